//! The contract a domain entity implements to run as a model actor.

use std::fmt;

use serde::{Serialize, de::DeserializeOwned};

use crate::context::ActorContext;
use crate::error::{CommandError, StateUpdateError};
use crate::event::{DomainEvent, ModelEvent};
use crate::scheduler::Timers;

/// A command understood by a model actor.
pub trait ModelCommand: fmt::Debug + Send + 'static {
    /// Stable name of this command kind, matched against
    /// [`Capabilities::commands`].
    fn kind(&self) -> &'static str;

    /// `Some(tenant)` if this command creates the actor.
    ///
    /// Only a bootstrap command is admitted by an actor that has no history
    /// yet, and a bootstrap command is refused by one that has.
    fn bootstrap_tenant(&self) -> Option<&str> {
        None
    }
}

/// Which command and event kinds an actor type accepts.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub commands: &'static [&'static str],
    pub events: &'static [&'static str],
}

impl Capabilities {
    pub const fn new(commands: &'static [&'static str], events: &'static [&'static str]) -> Self {
        Self { commands, events }
    }

    pub fn accepts_command(&self, kind: &str) -> bool {
        self.commands.contains(&kind)
    }

    pub fn accepts_event(&self, kind: &str) -> bool {
        self.events.contains(&kind)
    }
}

/// An event-sourced domain entity driven by the actor runtime.
///
/// The implementing type is the entity's in-memory state. It is rebuilt by
/// folding recorded events through [`update_state`](ModelActor::update_state)
/// and advanced by handling commands one at a time.
///
/// # Contract
///
/// - [`process_command`](ModelActor::process_command) decides and records
///   new events through [`ActorContext::add_event`], which applies each event
///   to the state before returning. Every state change must come from an
///   event.
/// - [`update_state`](ModelActor::update_state) must be deterministic: replay
///   of the same events yields the same state. It never sees debug events.
/// - An event for which [`has_behavior`](ModelActor::has_behavior) is true
///   gets its [`immediate_behavior`](ModelActor::immediate_behavior) run as
///   soon as it is added, and its
///   [`delayed_behavior`](ModelActor::delayed_behavior) once the outermost
///   cascade has finished its immediate phase. Behaviors run during live
///   handling only, never during replay.
/// - Returning [`CommandError::Malfunction`] or panicking reports "actor
///   choked". If events were already added, the actor restarts from the
///   journal and the partial changes are discarded.
pub trait ModelActor: Default + Send + 'static {
    /// Identifies this actor type (e.g. `"case"`). Recorded on every event.
    const ACTOR_TYPE: &'static str;

    /// Command and event kinds this actor type accepts.
    const CAPABILITIES: Capabilities;

    /// The set of commands this actor handles.
    type Command: ModelCommand + DeserializeOwned;

    /// The set of events this actor produces and replays.
    type Event: DomainEvent;

    /// Success payload returned to the sender of a command.
    type Reply: Serialize + DeserializeOwned + Send + 'static;

    /// Check a command before it is processed. Nothing may be recorded here.
    fn validate_command(
        &self,
        _command: &Self::Command,
        _ctx: &ActorContext<'_, Self>,
    ) -> Result<(), CommandError> {
        Ok(())
    }

    /// Handle a command, recording events through `ctx`.
    fn process_command(
        &mut self,
        command: Self::Command,
        ctx: &mut ActorContext<'_, Self>,
    ) -> Result<Self::Reply, CommandError>;

    /// Fold one recorded event into the state.
    fn update_state(&mut self, event: &ModelEvent<Self::Event>) -> Result<(), StateUpdateError>;

    fn has_behavior(&self, _event: &Self::Event) -> bool {
        false
    }

    fn immediate_behavior(
        &mut self,
        _event: &ModelEvent<Self::Event>,
        _ctx: &mut ActorContext<'_, Self>,
    ) -> Result<(), CommandError> {
        Ok(())
    }

    fn delayed_behavior(
        &mut self,
        _event: &ModelEvent<Self::Event>,
        _ctx: &mut ActorContext<'_, Self>,
    ) -> Result<(), CommandError> {
        Ok(())
    }

    /// Runs after a message was handled successfully and produced state
    /// changes, just before they are persisted.
    fn on_commit(&mut self, _ctx: &mut ActorContext<'_, Self>) -> Result<(), CommandError> {
        Ok(())
    }

    /// Runs once replay has finished, before the first live message.
    fn recovery_completed(&mut self, _timers: &Timers<Self>) {}

    /// Whether the actor is evicted after the configured idle period.
    fn has_auto_shutdown(&self) -> bool {
        true
    }

    /// State to store in a snapshot, or `None` to never snapshot.
    fn snapshot(&self) -> Option<serde_json::Value> {
        None
    }

    /// Restore state from a snapshot offered during recovery.
    fn restore_snapshot(&mut self, _state: serde_json::Value) -> Result<(), StateUpdateError> {
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;

    #[test]
    fn capabilities_match_kinds() {
        let caps = Ledger::CAPABILITIES;
        assert!(caps.accepts_command(LedgerCommand::Forbidden.kind()));
        assert!(!caps.accepts_command(LedgerCommand::Unlisted.kind()));
        assert!(caps.accepts_event("Noted"));
        assert!(!caps.accepts_event("Bumped"));
    }

    #[test]
    fn bootstrap_commands_carry_tenant() {
        let open = LedgerCommand::Open {
            tenant: "acme".into(),
        };
        assert_eq!(open.bootstrap_tenant(), Some("acme"));
        assert_eq!(LedgerCommand::Forbidden.bootstrap_tenant(), None);
    }

    #[test]
    fn commands_deserialize_from_tagged_json() {
        let cmd: LedgerCommand =
            serde_json::from_value(serde_json::json!({"type": "Add", "data": {"name": "x"}}))
                .expect("deserialize");
        assert_eq!(cmd, LedgerCommand::Add { name: "x".into() });
    }
}
