//! Two-phase execution of event behaviors.
//!
//! An event with behavior runs its immediate part as soon as it is added,
//! depth-first: events added from inside that immediate part cascade before
//! control returns to the caller. The delayed parts are collected into a
//! tree of frames and run once the outermost event's immediate part has
//! finished.

/// Order in which a frame's own delayed behavior runs relative to the
/// frames recorded beneath it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UnwindOrder {
    /// Children unwind before their parent: for a cascade A -> B -> C the
    /// delayed phase runs C, B, A.
    #[default]
    ChildrenFirst,
    /// The parent unwinds before its children: A, B, C. Siblings unwind
    /// latest first, so events recorded later by the same parent have
    /// their delayed behavior run earlier.
    ParentFirst,
}

#[derive(Debug)]
struct Frame<E> {
    event: E,
    depth: usize,
    children: Vec<Frame<E>>,
}

impl<E> Frame<E> {
    fn new(event: E, depth: usize) -> Self {
        Self {
            event,
            depth,
            children: Vec::new(),
        }
    }
}

/// Explicit stack of behavior frames for one message.
#[derive(Debug)]
pub struct TransitionCallStack<E> {
    frames: Vec<Frame<E>>,
    order: UnwindOrder,
}

impl<E> TransitionCallStack<E> {
    pub fn new(order: UnwindOrder) -> Self {
        Self {
            frames: Vec::new(),
            order,
        }
    }

    /// Number of frames currently executing.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_idle(&self) -> bool {
        self.frames.is_empty()
    }
}

/// The side of the call stack that knows how to run behaviors.
pub trait CascadeHost<E> {
    type Error;

    fn call_stack(&mut self) -> &mut TransitionCallStack<E>;

    fn has_behavior(&self, event: &E) -> bool;

    fn immediate(&mut self, event: &E) -> Result<(), Self::Error>;

    fn delayed(&mut self, event: &E) -> Result<(), Self::Error>;
}

/// Run the behavior of a freshly added event.
///
/// Events without behavior are ignored. Otherwise the immediate part runs
/// now; the frame is then attached to the frame that was executing when the
/// event was added, or, if there is none, the whole tree is unwound.
///
/// # Errors
///
/// The first error raised by any behavior aborts the cascade. Frames still
/// on the stack are discarded along with it.
pub fn push_event<E, H>(host: &mut H, event: E) -> Result<(), H::Error>
where
    E: Clone,
    H: CascadeHost<E>,
{
    if !host.has_behavior(&event) {
        return Ok(());
    }
    let stack = host.call_stack();
    let depth = stack.frames.len() + 1;
    stack.frames.push(Frame::new(event.clone(), depth));
    let result = host.immediate(&event);
    let frame = host.call_stack().frames.pop();
    result?;
    let Some(frame) = frame else {
        return Ok(());
    };
    tracing::trace!(depth = frame.depth, "immediate behavior completed");
    match host.call_stack().frames.last_mut() {
        Some(parent) => {
            parent.children.push(frame);
            Ok(())
        }
        None => unwind(host, frame),
    }
}

fn unwind<E, H>(host: &mut H, frame: Frame<E>) -> Result<(), H::Error>
where
    E: Clone,
    H: CascadeHost<E>,
{
    let Frame {
        event,
        depth,
        children,
    } = frame;
    host.call_stack().frames.push(Frame::new(event.clone(), depth));
    let result = run_delayed(host, &event, children);
    host.call_stack().frames.pop();
    result
}

fn run_delayed<E, H>(host: &mut H, event: &E, children: Vec<Frame<E>>) -> Result<(), H::Error>
where
    E: Clone,
    H: CascadeHost<E>,
{
    match host.call_stack().order {
        UnwindOrder::ChildrenFirst => {
            unwind_siblings(host, children)?;
            host.delayed(event)?;
        }
        UnwindOrder::ParentFirst => {
            host.delayed(event)?;
            unwind_siblings(host, children)?;
        }
    }
    // frames recorded while this frame's own delayed behavior ran
    loop {
        let late = host
            .call_stack()
            .frames
            .last_mut()
            .map(|frame| std::mem::take(&mut frame.children))
            .unwrap_or_default();
        if late.is_empty() {
            return Ok(());
        }
        unwind_siblings(host, late)?;
    }
}

fn unwind_siblings<E, H>(host: &mut H, mut siblings: Vec<Frame<E>>) -> Result<(), H::Error>
where
    E: Clone,
    H: CascadeHost<E>,
{
    if host.call_stack().order == UnwindOrder::ParentFirst {
        siblings.reverse();
    }
    for sibling in siblings {
        unwind(host, sibling)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;

    /// Host over a static tree: node `n` raises its children from its
    /// immediate behavior and `late[n]` from its delayed behavior.
    struct TreeHost {
        stack: TransitionCallStack<u32>,
        children: BTreeMap<u32, Vec<u32>>,
        late: BTreeMap<u32, Vec<u32>>,
        silent: Vec<u32>,
        fail_delayed: Option<u32>,
        trace: Vec<String>,
        max_depth: usize,
    }

    impl TreeHost {
        fn new(order: UnwindOrder) -> Self {
            Self {
                stack: TransitionCallStack::new(order),
                children: BTreeMap::new(),
                late: BTreeMap::new(),
                silent: Vec::new(),
                fail_delayed: None,
                trace: Vec::new(),
                max_depth: 0,
            }
        }

        fn raise(&mut self, events: Vec<u32>) -> Result<(), String> {
            for event in events {
                push_event(self, event)?;
            }
            Ok(())
        }
    }

    impl CascadeHost<u32> for TreeHost {
        type Error = String;

        fn call_stack(&mut self) -> &mut TransitionCallStack<u32> {
            &mut self.stack
        }

        fn has_behavior(&self, event: &u32) -> bool {
            !self.silent.contains(event)
        }

        fn immediate(&mut self, event: &u32) -> Result<(), String> {
            self.max_depth = self.max_depth.max(self.stack.depth());
            self.trace.push(format!("{event}-i"));
            let children = self.children.get(event).cloned().unwrap_or_default();
            self.raise(children)
        }

        fn delayed(&mut self, event: &u32) -> Result<(), String> {
            if self.fail_delayed == Some(*event) {
                return Err(format!("{event} failed"));
            }
            self.trace.push(format!("{event}-d"));
            let late = self.late.get(event).cloned().unwrap_or_default();
            self.raise(late)
        }
    }

    fn chain(order: UnwindOrder) -> TreeHost {
        let mut host = TreeHost::new(order);
        host.children.insert(1, vec![2]);
        host.children.insert(2, vec![3]);
        host
    }

    #[test]
    fn nested_cascade_unwinds_children_first() {
        let mut host = chain(UnwindOrder::ChildrenFirst);
        push_event(&mut host, 1).expect("cascade should succeed");
        assert_eq!(host.trace, ["1-i", "2-i", "3-i", "3-d", "2-d", "1-d"]);
        assert_eq!(host.max_depth, 3);
        assert!(host.stack.is_idle());
    }

    #[test]
    fn nested_cascade_unwinds_parent_first() {
        let mut host = chain(UnwindOrder::ParentFirst);
        push_event(&mut host, 1).expect("cascade should succeed");
        assert_eq!(host.trace, ["1-i", "2-i", "3-i", "1-d", "2-d", "3-d"]);
    }

    #[test]
    fn events_without_behavior_are_skipped() {
        let mut host = chain(UnwindOrder::ChildrenFirst);
        host.silent.push(2);
        push_event(&mut host, 1).expect("cascade should succeed");
        assert_eq!(host.trace, ["1-i", "1-d"]);
    }

    #[test]
    fn siblings_unwind_in_recorded_order() {
        let mut host = TreeHost::new(UnwindOrder::ChildrenFirst);
        host.children.insert(1, vec![2, 3]);
        push_event(&mut host, 1).expect("cascade should succeed");
        assert_eq!(host.trace, ["1-i", "2-i", "3-i", "2-d", "3-d", "1-d"]);
    }

    #[test]
    fn parent_first_unwinds_latest_sibling_first() {
        let mut host = TreeHost::new(UnwindOrder::ParentFirst);
        host.children.insert(1, vec![2, 3]);
        host.children.insert(2, vec![4, 5]);
        push_event(&mut host, 1).expect("cascade should succeed");
        assert_eq!(
            host.trace,
            ["1-i", "2-i", "4-i", "5-i", "3-i", "1-d", "3-d", "2-d", "5-d", "4-d"]
        );
    }

    #[test]
    fn events_raised_by_delayed_behavior_run_after_it() {
        let mut host = TreeHost::new(UnwindOrder::ChildrenFirst);
        host.children.insert(1, vec![2]);
        host.late.insert(2, vec![7]);
        push_event(&mut host, 1).expect("cascade should succeed");
        assert_eq!(host.trace, ["1-i", "2-i", "2-d", "7-i", "7-d", "1-d"]);
    }

    #[test]
    fn failing_delayed_behavior_aborts_and_clears_stack() {
        let mut host = chain(UnwindOrder::ChildrenFirst);
        host.fail_delayed = Some(2);
        let err = push_event(&mut host, 1).expect_err("cascade should fail");
        assert_eq!(err, "2 failed");
        assert_eq!(host.trace, ["1-i", "2-i", "3-i", "3-d"]);
        assert!(host.stack.is_idle(), "frames must not leak after a failure");
    }

    #[test]
    fn consecutive_top_level_events_unwind_independently() {
        let mut host = chain(UnwindOrder::ChildrenFirst);
        push_event(&mut host, 3).expect("first");
        push_event(&mut host, 2).expect("second");
        assert_eq!(host.trace, ["3-i", "3-d", "2-i", "3-i", "3-d", "2-d"]);
    }

    fn pre_order(tree: &BTreeMap<u32, Vec<u32>>, node: u32, out: &mut Vec<u32>) {
        out.push(node);
        for child in tree.get(&node).into_iter().flatten() {
            pre_order(tree, *child, out);
        }
    }

    /// Pre-order visiting the last child of every node first.
    fn reversed_pre_order(tree: &BTreeMap<u32, Vec<u32>>, node: u32, out: &mut Vec<u32>) {
        out.push(node);
        for child in tree.get(&node).into_iter().flatten().rev() {
            reversed_pre_order(tree, *child, out);
        }
    }

    fn post_order(tree: &BTreeMap<u32, Vec<u32>>, node: u32, out: &mut Vec<u32>) {
        for child in tree.get(&node).into_iter().flatten() {
            post_order(tree, *child, out);
        }
        out.push(node);
    }

    /// Random tree rooted at 0: node `i + 1` hangs below one of `0..=i`.
    fn tree_strategy() -> impl Strategy<Value = BTreeMap<u32, Vec<u32>>> {
        prop::collection::vec(any::<prop::sample::Index>(), 0..24).prop_map(|parents| {
            let mut tree: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
            for (i, parent) in parents.iter().enumerate() {
                let node = i as u32 + 1;
                let parent = parent.index(i + 1) as u32;
                tree.entry(parent).or_default().push(node);
            }
            tree
        })
    }

    proptest! {
        #[test]
        fn immediate_phase_is_pre_order_and_delayed_follows_unwind_order(
            tree in tree_strategy(),
            children_first in any::<bool>(),
        ) {
            let order = if children_first {
                UnwindOrder::ChildrenFirst
            } else {
                UnwindOrder::ParentFirst
            };
            let mut host = TreeHost::new(order);
            host.children = tree.clone();
            push_event(&mut host, 0).expect("cascade should succeed");

            let mut immediate = Vec::new();
            pre_order(&tree, 0, &mut immediate);
            let mut delayed = Vec::new();
            if children_first {
                post_order(&tree, 0, &mut delayed);
            } else {
                reversed_pre_order(&tree, 0, &mut delayed);
            }
            let expected: Vec<String> = immediate
                .iter()
                .map(|n| format!("{n}-i"))
                .chain(delayed.iter().map(|n| format!("{n}-d")))
                .collect();
            prop_assert_eq!(host.trace, expected);
            prop_assert!(host.stack.is_idle());
        }
    }
}
