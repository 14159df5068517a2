//! Event-sourced model actors on tokio.
//!
//! Every entity is a [`ModelActor`] living on its own task. Commands pass an
//! admission gate, run against the actor with an [`ActorContext`], and the
//! events they record are applied at once and persisted as one batch
//! before the caller is answered. Actors sleep when idle and are rebuilt
//! from their journal, optionally starting from a snapshot, when next
//! addressed.

mod actor;
pub use actor::ActorRef;
mod back_office;
mod callstack;
pub use callstack::{CascadeHost, TransitionCallStack, UnwindOrder, push_event};
mod config;
pub use config::{DEFAULT_IDLE_PERIOD, DEFAULT_MAILBOX_CAPACITY, EngineConfig};
mod context;
pub use context::{ActorContext, ActorCore};
mod error;
pub use error::{AskError, CommandError, ConfigError, ExecuteError, JournalError, StateUpdateError};
mod event;
pub use event::{
    DEBUG_EVENT, DebugEntry, DebugEvent, DomainEvent, ENGINE_VERSION_CHANGED, EngineVersion,
    EventPayload, ModelEvent,
};
mod health;
pub use health::HealthMonitor;
mod journal;
pub use journal::{FileJournal, InMemoryJournal, Journal, JournalRecord};
mod message;
pub use message::{
    CommandEnvelope, CommandMessage, Failure, FailureKind, IncomingMessage, ModelResponse,
    Outcome, ReplyTo, ResponseSink, UserIdentity,
};
mod model;
pub use model::{Capabilities, ModelActor, ModelCommand};
mod persistence;
mod reception;
mod recovery;
pub use recovery::RecoveryMessage;
mod scheduler;
pub use scheduler::{JobHandle, JobId, Scheduler, Timers};
mod snapshot;
pub use snapshot::{ActorSnapshot, FileSnapshotStore, SnapshotStore};
mod staging;
mod storage;
pub use storage::StreamLayout;
mod system;
pub use system::{ActorSystem, ActorSystemBuilder, Gateway};
