//! Task that owns one model actor and works through its mailbox.
//!
//! Each actor instance runs on its own tokio task and handles one message
//! at a time. The task recovers the actor from storage before reading the
//! mailbox, so messages sent while recovery is running simply wait.
//!
//! Restarts happen inside the task: the actor is rebuilt from the journal
//! while the mailbox, and everything queued in it, is kept. Eviction after
//! an idle period closes the mailbox; the [`ActorSystem`](crate::ActorSystem)
//! notices the closed handle and spawns a fresh incarnation on the next
//! message.
//!
//! Public API: [`ActorRef`] (cloneable async handle).

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::back_office::BackOffice;
use crate::config::EngineConfig;
use crate::context::ActorCore;
use crate::error::{AskError, ExecuteError};
use crate::journal::Journal;
use crate::message::{
    CommandMessage, Failure, FailureKind, IncomingMessage, ModelResponse, Outcome, ReplyTo,
    UserIdentity,
};
use crate::model::ModelActor;
use crate::persistence::Warehouse;
use crate::reception::{Reception, receive};
use crate::recovery::{RecoveryRoom, recover};
use crate::scheduler::{Scheduler, Timers};
use crate::snapshot::SnapshotStore;
use crate::system::{Gateway, SystemShared};

/// Called with the actor's state, or with the reason it cannot be shown.
pub(crate) type Inspector<A> = Box<dyn FnOnce(Result<(&A, &ActorCore), AskError>) + Send>;

/// Everything that can land in an actor's mailbox.
pub(crate) enum Mail<A: ModelActor> {
    Incoming(IncomingMessage<A>),
    Control(Control),
    /// Read-only look at the actor between two messages.
    Inspect(Inspector<A>),
}

/// Engine-internal notices an actor sends to itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    /// The idle timer armed as `generation` has fired.
    Idle { generation: u64 },
    /// The writer finished a batch.
    Persisted,
    /// The writer failed and has shut down.
    PersistFailed,
    /// Forced termination.
    Terminate,
}

/// What the actor loop does after a message.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Directive {
    Continue,
    /// Rebuild the actor from the journal, keeping the mailbox.
    Restart(String),
    /// Stop accepting mail, finish what is queued, then exit.
    Sleep(String),
    /// Exit now; queued commands are answered with a failure.
    Stop(String),
}

/// Per-actor resources that outlive restarts.
pub(crate) struct ActorEnv<A: ModelActor> {
    pub id: String,
    pub config: Arc<EngineConfig>,
    pub journal: Arc<dyn Journal>,
    pub snapshots: Option<Arc<dyn SnapshotStore>>,
    pub gateway: Gateway,
    pub timers: Timers<A>,
    pub warehouse: Warehouse,
}

/// One life of an actor, from recovery to restart or exit.
pub(crate) struct Incarnation<A: ModelActor> {
    pub actor: A,
    pub core: ActorCore,
    pub reception: Reception,
    pub recovery: RecoveryRoom,
    pub back_office: BackOffice<A>,
    /// Sequence number of the last snapshot saved or restored.
    pub last_snapshot: u64,
}

impl<A: ModelActor> Incarnation<A> {
    pub(crate) fn new(id: &str, debug_mode: bool, idle_generation: u64) -> Self {
        Self {
            actor: A::default(),
            core: ActorCore::new(id, debug_mode),
            reception: Reception::new(),
            recovery: RecoveryRoom::default(),
            back_office: BackOffice::new(idle_generation),
            last_snapshot: 0,
        }
    }

    fn arm_idle_timer(&mut self, env: &ActorEnv<A>) {
        if self.actor.has_auto_shutdown() {
            self.back_office
                .arm_idle_timer(&env.timers, env.config.idle_period);
        }
    }

    fn control(&mut self, env: &ActorEnv<A>, control: Control) -> Directive {
        match control {
            Control::Idle { generation } if self.back_office.is_current_idle(generation) => {
                Directive::Sleep("idle".to_owned())
            }
            Control::Idle { .. } => Directive::Continue,
            Control::Persisted => {
                self.maybe_snapshot(env);
                Directive::Continue
            }
            Control::PersistFailed => Directive::Stop("journal write failed".to_owned()),
            Control::Terminate => Directive::Sleep("terminated".to_owned()),
        }
    }

    /// Save a snapshot once enough records have been written since the
    /// last one. Only runs while nothing is in flight, so the in-memory
    /// state matches the journal exactly.
    fn maybe_snapshot(&mut self, env: &ActorEnv<A>) {
        let interval = env.config.snapshot_interval;
        let Some(store) = &env.snapshots else {
            return;
        };
        if interval == 0 || self.reception.is_broken() || !self.reception.is_bootstrapped() {
            return;
        }
        // the in-memory state only matches the journal once every batch is durable
        let Some(sequence_nr) = env.warehouse.settled_sequence_nr() else {
            return;
        };
        if sequence_nr < self.last_snapshot + interval {
            return;
        }
        let Some(state) = self.actor.snapshot() else {
            return;
        };
        let snapshot = self.core.snapshot(sequence_nr, state);
        match store.save(A::ACTOR_TYPE, &env.id, &snapshot) {
            Ok(()) => {
                self.last_snapshot = sequence_nr;
                tracing::debug!(sequence_nr, "snapshot saved");
            }
            Err(e) => tracing::warn!(error = %e, sequence_nr, "failed to save snapshot"),
        }
    }
}

/// Spawn the task for one actor instance.
///
/// `previous` is the task of an earlier incarnation of the same actor.
/// The new task waits for it to finish before recovering, so the earlier
/// writer has flushed everything it accepted.
pub(crate) fn spawn_actor<A: ModelActor>(
    id: &str,
    shared: &SystemShared,
    gateway: Gateway,
    previous: Option<JoinHandle<()>>,
) -> (ActorRef<A>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<Mail<A>>(shared.config.mailbox_capacity.max(1));
    let warehouse = Warehouse::spawn::<A>(
        id.to_owned(),
        Arc::clone(&shared.journal),
        shared.health.clone(),
        tx.downgrade(),
    );
    let env = ActorEnv {
        id: id.to_owned(),
        config: Arc::clone(&shared.config),
        journal: Arc::clone(&shared.journal),
        snapshots: shared.snapshots.clone(),
        gateway,
        timers: Timers::new(Scheduler::new(), tx.downgrade()),
        warehouse,
    };
    let span = tracing::info_span!("actor", actor_type = A::ACTOR_TYPE, actor_id = %id);
    let task = tokio::spawn(run_actor(env, rx, previous).instrument(span));
    let handle = ActorRef {
        id: Arc::from(id),
        sender: tx,
    };
    (handle, task)
}

/// Runs the actor loop until the mailbox is closed and drained, or the
/// actor stops.
async fn run_actor<A: ModelActor>(
    env: ActorEnv<A>,
    mut rx: mpsc::Receiver<Mail<A>>,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous
        && let Err(e) = previous.await
    {
        tracing::warn!(error = %e, "previous incarnation ended abnormally");
    }

    let mut inc = recover(&env, 0).await;
    inc.arm_idle_timer(&env);
    let mut closing = false;

    while let Some(mail) = rx.recv().await {
        let mut directive = match mail {
            Mail::Incoming(message) => receive(&mut inc, &env, message),
            Mail::Control(control) => inc.control(&env, control),
            Mail::Inspect(inspect) => {
                let view = match inc.reception.inspection_refusal() {
                    Some(refusal) => Err(refusal),
                    None => Ok((&inc.actor, &inc.core)),
                };
                if catch_unwind(AssertUnwindSafe(|| inspect(view))).is_err() {
                    tracing::warn!("inspection panicked");
                }
                Directive::Continue
            }
        };
        if env.warehouse.has_failed() && !matches!(directive, Directive::Stop(_)) {
            directive = Directive::Stop("journal write failed".to_owned());
        }

        match directive {
            Directive::Continue => {}
            Directive::Restart(reason) => {
                tracing::warn!(reason = %reason, "restarting actor from its journal");
                env.timers.scheduler().cancel_all();
                if !env.warehouse.flush().await {
                        stop(&env, &inc.core, &mut rx, "journal write failed before restart").await;
                    return;
                }
                let generation = inc.back_office.idle_generation();
                inc = recover(&env, generation).await;
                inc.arm_idle_timer(&env);
            }
            Directive::Sleep(reason) => {
                if !closing {
                    tracing::info!(reason = %reason, "actor going to sleep");
                    closing = true;
                    rx.close();
                }
            }
            Directive::Stop(reason) => {
                stop(&env, &inc.core, &mut rx, &reason).await;
                return;
            }
        }
    }

    env.timers.scheduler().cancel_all();
    if !env.warehouse.flush().await {
        tracing::warn!("journal writer failed while shutting down");
    }
    env.gateway.release::<A>(&env.id).await;
    tracing::info!(
        pending_responses = inc.back_office.pending_responses(),
        "actor stopped"
    );
}

/// Exit without processing anything else. Every command still queued gets
/// an "engine choked" failure.
async fn stop<A: ModelActor>(
    env: &ActorEnv<A>,
    core: &ActorCore,
    rx: &mut mpsc::Receiver<Mail<A>>,
    reason: &str,
) {
    env.timers.scheduler().cancel_all();
    rx.close();
    let mut rejected = 0usize;
    while let Some(mail) = rx.recv().await {
        if let Mail::Incoming(IncomingMessage::Command(message)) = mail {
            let failure = Failure::new(
                FailureKind::EngineChoked,
                format!("actor {} stopped: {reason}", core.id()),
            );
            message
                .reply_to
                .send(core.response(&message.message_id, Outcome::Failure(failure)));
            rejected += 1;
        }
    }
    env.gateway.release::<A>(&env.id).await;
    tracing::error!(reason, rejected, "actor stopped");
}

/// Wrap `f` for the mailbox. The receiver yields its result, or the reason
/// the actor refused to be looked at.
pub(crate) fn inspector<A, R, F>(f: F) -> (Inspector<A>, oneshot::Receiver<Result<R, AskError>>)
where
    A: ModelActor,
    R: Send + 'static,
    F: FnOnce(&A, &ActorCore) -> R + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let inspector: Inspector<A> = Box::new(move |view: Result<(&A, &ActorCore), AskError>| {
        let _ = tx.send(view.map(|(actor, core)| f(actor, core)));
    });
    (inspector, rx)
}

/// Decode the success payload of `response` into the actor's reply type.
pub(crate) fn decode_reply<A: ModelActor>(response: ModelResponse) -> Result<A::Reply, ExecuteError> {
    let value = response.into_result()?;
    serde_json::from_value(value).map_err(ExecuteError::Decode)
}

/// Async handle to a running model actor.
///
/// Lightweight, cloneable, and `Send + Sync`. Communicates with the actor
/// task over a bounded channel. A handle does not revive an evicted actor;
/// go through the [`ActorSystem`](crate::ActorSystem) for that.
///
/// # Type Parameters
///
/// * `A` - The [`ModelActor`] type this handle controls.
pub struct ActorRef<A: ModelActor> {
    id: Arc<str>,
    sender: mpsc::Sender<Mail<A>>,
}

// Manual `Clone` because `A` itself need not be `Clone` for the handle.
impl<A: ModelActor> Clone for ActorRef<A> {
    fn clone(&self) -> Self {
        Self {
            id: Arc::clone(&self.id),
            sender: self.sender.clone(),
        }
    }
}

impl<A: ModelActor> std::fmt::Debug for ActorRef<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorRef")
            .field("actor_type", &A::ACTOR_TYPE)
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl<A: ModelActor> ActorRef<A> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Check whether the actor behind this handle still accepts mail.
    ///
    /// Returns `false` once the actor has gone to sleep or stopped. The
    /// system uses this to evict stale handles from its cache and spawn a
    /// new incarnation on the next message.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    pub(crate) async fn send(&self, mail: Mail<A>) -> Result<(), mpsc::error::SendError<Mail<A>>> {
        self.sender.send(mail).await
    }

    /// Send a command and wait for the actor's response.
    ///
    /// # Arguments
    ///
    /// * `command` - The command to handle.
    /// * `user` - Identity the command runs on behalf of.
    ///
    /// # Returns
    ///
    /// The response, which may itself describe a failure.
    ///
    /// # Errors
    ///
    /// Returns [`AskError::ActorGone`] if the actor is no longer running.
    pub async fn ask(&self, command: A::Command, user: UserIdentity) -> Result<ModelResponse, AskError> {
        let (tx, rx) = oneshot::channel();
        let message = CommandMessage::new(command, user, ReplyTo::Caller(tx));
        self.send(Mail::Incoming(IncomingMessage::Command(message)))
            .await
            .map_err(|_| AskError::ActorGone)?;
        rx.await.map_err(|_| AskError::ActorGone)
    }

    /// Send a command and decode its success payload.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Rejected`] - the actor answered with a failure.
    /// * [`ExecuteError::Decode`] - the payload is not an `A::Reply`.
    /// * [`ExecuteError::ActorGone`] - the actor is no longer running.
    pub async fn execute(&self, command: A::Command, user: UserIdentity) -> Result<A::Reply, ExecuteError> {
        let response = self.ask(command, user).await?;
        decode_reply::<A>(response)
    }

    /// Send a command without waiting for its response.
    ///
    /// # Errors
    ///
    /// Returns [`AskError::ActorGone`] if the actor is no longer running.
    pub async fn tell(&self, command: A::Command, user: UserIdentity) -> Result<(), AskError> {
        let message = CommandMessage::new(command, user, ReplyTo::Nobody);
        self.send(Mail::Incoming(IncomingMessage::Command(message)))
            .await
            .map_err(|_| AskError::ActorGone)
    }

    /// Run `f` against the actor between two messages.
    ///
    /// # Errors
    ///
    /// * [`AskError::DoesNotExist`] - the actor was never bootstrapped.
    /// * [`AskError::Unrecoverable`] - the actor's recovery failed.
    /// * [`AskError::ActorGone`] - the actor is no longer running or `f`
    ///   panicked.
    pub async fn inspect<R, F>(&self, f: F) -> Result<R, AskError>
    where
        R: Send + 'static,
        F: FnOnce(&A, &ActorCore) -> R + Send + 'static,
    {
        let (inspector, rx) = inspector(f);
        self.send(Mail::Inspect(inspector))
            .await
            .map_err(|_| AskError::ActorGone)?;
        rx.await.map_err(|_| AskError::ActorGone)?
    }

    /// A copy of the actor's current state.
    ///
    /// # Errors
    ///
    /// Same as [`inspect`](Self::inspect).
    pub async fn state(&self) -> Result<A, AskError>
    where
        A: Clone,
    {
        self.inspect(|actor, _| actor.clone()).await
    }

    /// Ask the actor to finish what is queued and exit.
    ///
    /// # Errors
    ///
    /// Returns [`AskError::ActorGone`] if the actor is no longer running.
    pub async fn terminate(&self) -> Result<(), AskError> {
        self.send(Mail::Control(Control::Terminate))
            .await
            .map_err(|_| AskError::ActorGone)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::journal::InMemoryJournal;
    use crate::journal::test_support::GatedJournal;
    use crate::model::test_fixtures::{Ledger, LedgerCommand, LedgerReply};
    use crate::snapshot::FileSnapshotStore;
    use crate::storage::StreamLayout;
    use crate::system::ActorSystem;

    fn alice() -> UserIdentity {
        UserIdentity::new("alice")
    }

    fn open() -> LedgerCommand {
        LedgerCommand::Open {
            tenant: "acme".into(),
        }
    }

    fn add(name: &str) -> LedgerCommand {
        LedgerCommand::Add { name: name.into() }
    }

    fn system() -> ActorSystem {
        ActorSystem::builder()
            .journal(InMemoryJournal::new())
            .register::<Ledger>()
            .build()
    }

    async fn spawn(system: &ActorSystem, id: &str) -> ActorRef<Ledger> {
        system.get::<Ledger>(id).await
    }

    fn kind(result: Result<LedgerReply, ExecuteError>) -> Option<FailureKind> {
        match result {
            Err(ExecuteError::Rejected(Failure { kind, .. })) => Some(kind),
            _ => None,
        }
    }

    #[tokio::test]
    async fn bootstrap_then_commands() {
        let system = system();
        let actor = spawn(&system, "l-1").await;

        let reply = actor.execute(open(), alice()).await.expect("open");
        assert_eq!(reply, LedgerReply { entries: 0 });
        let reply = actor.execute(add("a"), alice()).await.expect("add");
        assert_eq!(reply, LedgerReply { entries: 1 });

        let state = actor.state().await.expect("state");
        assert!(state.opened);
        assert_eq!(state.entries, vec!["a".to_string()]);
        assert!(state.recovered);
        let tenant = actor
            .inspect(|_, core| core.tenant().map(str::to_owned))
            .await
            .expect("inspect");
        assert_eq!(tenant.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn commands_before_bootstrap_are_refused() {
        let system = system();
        let actor = spawn(&system, "l-1").await;
        assert_eq!(
            kind(actor.execute(add("a"), alice()).await),
            Some(FailureKind::ActorDoesNotExist)
        );
        assert!(matches!(actor.state().await, Err(AskError::DoesNotExist)));
        assert!(matches!(
            actor.inspect(|_, core| core.tenant().is_some()).await,
            Err(AskError::DoesNotExist)
        ));
    }

    #[tokio::test]
    async fn second_bootstrap_is_refused_without_events() {
        let journal = InMemoryJournal::new();
        let system = ActorSystem::builder()
            .journal(journal.clone())
            .register::<Ledger>()
            .build();
        let actor = spawn(&system, "l-1").await;
        actor.execute(open(), alice()).await.expect("first open");
        assert_eq!(
            kind(actor.execute(open(), alice()).await),
            Some(FailureKind::ActorExists)
        );
        assert_eq!(
            journal.highest_sequence_nr("l-1").await.expect("seq"),
            1,
            "the refused bootstrap wrote nothing"
        );
    }

    #[tokio::test]
    async fn declared_failures_map_to_kinds() {
        let system = system();
        let actor = spawn(&system, "l-1").await;
        actor.execute(open(), alice()).await.expect("open");

        assert_eq!(
            kind(actor.execute(LedgerCommand::Unlisted, alice()).await),
            Some(FailureKind::InvalidCommand)
        );
        assert_eq!(
            kind(actor.execute(LedgerCommand::Forbidden, alice()).await),
            Some(FailureKind::SecurityFailure)
        );
        assert_eq!(
            kind(
                actor
                    .execute(
                        LedgerCommand::Reject {
                            reason: "no".into()
                        },
                        alice()
                    )
                    .await
            ),
            Some(FailureKind::CommandFailed)
        );
    }

    #[tokio::test]
    async fn panic_after_event_restarts_from_journal() {
        let system = system();
        let actor = spawn(&system, "l-1").await;
        actor.execute(open(), alice()).await.expect("open");
        actor.execute(add("a"), alice()).await.expect("add");

        assert_eq!(
            kind(actor.execute(LedgerCommand::Explode, alice()).await),
            Some(FailureKind::ActorChoked)
        );

        let state = actor.state().await.expect("actor survives the restart");
        assert_eq!(state.entries, vec!["a".to_string()]);
        actor.execute(add("b"), alice()).await.expect("still usable");
        let state = actor.state().await.expect("state");
        assert_eq!(state.entries, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn failing_state_update_is_choked_and_not_persisted() {
        let system = system();
        let actor = spawn(&system, "l-1").await;
        actor.execute(open(), alice()).await.expect("open");
        assert_eq!(
            kind(actor.execute(LedgerCommand::Poison, alice()).await),
            Some(FailureKind::ActorChoked)
        );
        let reply = actor.execute(add("a"), alice()).await.expect("add");
        assert_eq!(reply.entries, 1);
    }

    #[tokio::test]
    async fn cascade_runs_immediate_first_then_delayed_children_first() {
        let system = system();
        let actor = spawn(&system, "l-1").await;
        actor.execute(open(), alice()).await.expect("open");
        actor
            .execute(
                LedgerCommand::Cascade {
                    chain: vec!["A".into(), "B".into(), "C".into()],
                },
                alice(),
            )
            .await
            .expect("cascade");

        let state = actor.state().await.expect("state");
        assert_eq!(
            state.trace,
            vec![
                "A-immediate",
                "B-immediate",
                "C-immediate",
                "C-delayed",
                "B-delayed",
                "A-delayed"
            ]
        );
    }

    #[tokio::test]
    async fn failing_delayed_behavior_discards_the_whole_message() {
        let system = system();
        let actor = spawn(&system, "l-1").await;
        actor.execute(open(), alice()).await.expect("open");
        assert_eq!(
            kind(
                actor
                    .execute(
                        LedgerCommand::Cascade {
                            chain: vec!["A".into(), "boom".into()],
                        },
                        alice(),
                    )
                    .await
            ),
            Some(FailureKind::ActorChoked)
        );
        let state = actor.state().await.expect("state");
        assert!(state.trace.is_empty(), "in-memory effects were rolled back");
    }

    #[tokio::test]
    async fn scheduled_command_arrives_later() {
        let system = system();
        let actor = spawn(&system, "l-1").await;
        actor.execute(open(), alice()).await.expect("open");
        actor
            .execute(
                LedgerCommand::Schedule {
                    delay_ms: 20,
                    name: "later".into(),
                },
                alice(),
            )
            .await
            .expect("schedule");

        let mut entries = Vec::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            entries = actor.state().await.expect("state").entries;
            if !entries.is_empty() {
                break;
            }
        }
        assert_eq!(entries, vec!["later".to_string()]);
    }

    #[tokio::test]
    async fn terminate_closes_the_mailbox() {
        let system = system();
        let actor = spawn(&system, "l-1").await;
        actor.execute(open(), alice()).await.expect("open");
        actor.terminate().await.expect("terminate");
        for _ in 0..50 {
            if !actor.is_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!actor.is_alive());
        assert!(matches!(
            actor.ask(add("a"), alice()).await,
            Err(AskError::ActorGone)
        ));
    }

    /// Entries once the actor has handled `count` adds, or whatever it has
    /// after about half a second.
    async fn handled(actor: &ActorRef<Ledger>, count: usize) -> Vec<String> {
        let mut entries = Vec::new();
        for _ in 0..100 {
            entries = actor.state().await.expect("state").entries;
            if entries.len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        entries
    }

    #[tokio::test]
    async fn replies_wait_for_their_own_batch_in_order() {
        let journal = GatedJournal::closed();
        let system = ActorSystem::builder()
            .journal(journal.clone())
            .register::<Ledger>()
            .build();
        let actor = spawn(&system, "l-1").await;
        journal.open_writes(1);
        actor.execute(open(), alice()).await.expect("open");

        let first = tokio::spawn({
            let actor = actor.clone();
            async move { actor.execute(add("a"), alice()).await }
        });
        assert_eq!(handled(&actor, 1).await, vec!["a".to_string()]);
        let second = tokio::spawn({
            let actor = actor.clone();
            async move { actor.execute(add("b"), alice()).await }
        });

        assert_eq!(
            handled(&actor, 2).await,
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(!first.is_finished(), "no reply before the batch is durable");
        assert!(!second.is_finished(), "no reply before the batch is durable");

        journal.open_writes(1);
        let reply = first.await.expect("join").expect("first add");
        assert_eq!(reply, LedgerReply { entries: 1 });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished(), "the second batch is still held back");

        journal.open_writes(1);
        let reply = second.await.expect("join").expect("second add");
        assert_eq!(reply, LedgerReply { entries: 2 });

        let names: Vec<serde_json::Value> = journal
            .read("l-1", 1)
            .await
            .expect("read")
            .into_iter()
            .map(|r| r.payload["payload"]["data"]["data"]["name"].clone())
            .collect();
        assert_eq!(names, vec![serde_json::Value::Null, "a".into(), "b".into()]);

        let restarted = ActorSystem::builder()
            .journal(journal.clone())
            .register::<Ledger>()
            .build();
        let state = restarted.state::<Ledger>("l-1").await.expect("state");
        assert_eq!(state.entries, vec!["a".to_string(), "b".to_string()]);
    }

    async fn snapshot_reaches(store: &FileSnapshotStore, sequence_nr: u64) -> bool {
        for _ in 0..100 {
            if matches!(store.load("ledger", "l-1"), Ok(Some(s)) if s.sequence_nr == sequence_nr) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn snapshot_is_not_taken_while_a_batch_is_being_written() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileSnapshotStore::new(StreamLayout::new(dir.path()));
        let journal = GatedJournal::closed();
        let system = ActorSystem::builder()
            .journal(journal.clone())
            .snapshot_store(store.clone())
            .snapshot_interval(1)
            .register::<Ledger>()
            .build();
        let actor = spawn(&system, "l-1").await;
        journal.open_writes(1);
        actor.execute(open(), alice()).await.expect("open");
        assert!(snapshot_reaches(&store, 1).await, "snapshot after the opening event");

        actor.tell(add("a"), alice()).await.expect("tell");
        // a write notice arriving while the add is still held by the journal
        actor
            .send(Mail::Control(Control::Persisted))
            .await
            .expect("send notice");
        let state = actor.state().await.expect("state");
        assert_eq!(state.entries, vec!["a".to_string()]);
        let snapshot = store
            .load("ledger", "l-1")
            .expect("load")
            .expect("snapshot exists");
        assert_eq!(snapshot.sequence_nr, 1);
        assert_eq!(snapshot.state["entries"], serde_json::json!([]));

        journal.open_writes(1);
        assert!(snapshot_reaches(&store, 2).await, "snapshot once the add is durable");
        let snapshot = store
            .load("ledger", "l-1")
            .expect("load")
            .expect("snapshot exists");
        assert_eq!(snapshot.state["entries"], serde_json::json!(["a"]));

        let restarted = ActorSystem::builder()
            .journal(journal.clone())
            .snapshot_store(store.clone())
            .register::<Ledger>()
            .build();
        let state = restarted.state::<Ledger>("l-1").await.expect("state");
        assert_eq!(state.entries, vec!["a".to_string()]);
    }

    fn ledger_command() -> impl Strategy<Value = LedgerCommand> {
        prop_oneof![
            4 => "[a-z]{1,4}".prop_map(|name| LedgerCommand::Add { name }),
            1 => Just(LedgerCommand::Reject {
                reason: "no".into()
            }),
            1 => Just(LedgerCommand::Poison),
            1 => Just(LedgerCommand::Explode),
            2 => proptest::collection::vec("[a-z]{1,3}", 1..4)
                .prop_map(|chain| LedgerCommand::Cascade { chain }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn replayed_state_matches_live_state(
            commands in proptest::collection::vec(ledger_command(), 0..12),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");
            let (live, replayed) = runtime.block_on(async move {
                let journal = InMemoryJournal::new();
                let system = ActorSystem::builder()
                    .journal(journal.clone())
                    .register::<Ledger>()
                    .build();
                system.execute::<Ledger>("l-1", open(), alice()).await.expect("open");
                for command in commands {
                    let _ = system.execute::<Ledger>("l-1", command, alice()).await;
                }
                let live = system.state::<Ledger>("l-1").await.expect("live state");

                let restarted = ActorSystem::builder()
                    .journal(journal)
                    .register::<Ledger>()
                    .build();
                let replayed = restarted
                    .state::<Ledger>("l-1")
                    .await
                    .expect("replayed state");
                (live, replayed)
            });
            prop_assert_eq!(live, replayed);
        }
    }

    #[test]
    fn decode_reply_maps_failures_and_payloads() {
        let ok = ModelResponse {
            message_id: "m".into(),
            actor_id: "l-1".into(),
            last_modified: None,
            outcome: Outcome::Success(serde_json::json!({"entries": 3})),
        };
        assert_eq!(
            decode_reply::<Ledger>(ok).expect("decode"),
            LedgerReply { entries: 3 }
        );

        let wrong = ModelResponse {
            message_id: "m".into(),
            actor_id: "l-1".into(),
            last_modified: None,
            outcome: Outcome::Success(serde_json::json!("nope")),
        };
        assert!(matches!(
            decode_reply::<Ledger>(wrong),
            Err(ExecuteError::Decode(_))
        ));

        let failed = ModelResponse {
            message_id: "m".into(),
            actor_id: "l-1".into(),
            last_modified: None,
            outcome: Outcome::Failure(Failure::new(FailureKind::CommandFailed, "no")),
        };
        assert!(matches!(
            decode_reply::<Ledger>(failed),
            Err(ExecuteError::Rejected(_))
        ));
    }
}
