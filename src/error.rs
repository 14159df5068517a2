//! Crate-level error types for command handling, persistence and delivery.

use crate::message::{Failure, FailureKind};

/// Error returned by domain code while handling a command or a response.
///
/// The first three variants are the declared outcomes a domain may choose
/// to report; each maps to a distinct failure kind on the response sent
/// back to the sender. [`Malfunction`](CommandError::Malfunction) marks an
/// undeclared fault and is reported as "actor choked".
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The current user may not perform this command.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// The command does not make sense against the current state.
    #[error("invalid command: {0}")]
    Invalid(String),

    /// The command was valid but could not be carried out.
    #[error("command failed: {0}")]
    Failed(String),

    /// Something broke that the domain did not anticipate.
    #[error("engine malfunction: {0}")]
    Malfunction(String),
}

impl From<StateUpdateError> for CommandError {
    fn from(err: StateUpdateError) -> Self {
        CommandError::Malfunction(err.to_string())
    }
}

/// Error returned when folding an event into actor state fails.
///
/// During live handling this leaves the in-memory state suspect and forces
/// a restart. During recovery it marks the actor as broken.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot apply {event}: {reason}")]
pub struct StateUpdateError {
    /// Kind of the event that could not be applied.
    pub event: String,
    /// Human readable cause.
    pub reason: String,
}

impl StateUpdateError {
    /// Create a new state update error for the given event kind.
    pub fn new(event: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            reason: reason.into(),
        }
    }
}

/// Error returned by a [`Journal`](crate::Journal) backend.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or a stored line could not be parsed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The persistence id cannot be mapped onto storage.
    #[error("invalid persistence id {0:?}")]
    InvalidPersistenceId(String),

    /// The backend refused the write.
    #[error("journal rejected write: {0}")]
    Rejected(String),
}

/// Error returned when a message cannot be delivered to an actor or its
/// reply never arrives.
#[derive(Debug, thiserror::Error)]
pub enum AskError {
    /// The actor task exited before it could answer.
    #[error("model actor is no longer running")]
    ActorGone,

    /// The actor has never been bootstrapped, so it has no state to show.
    #[error("model actor does not exist")]
    DoesNotExist,

    /// Recovery of the actor failed; its state is incomplete.
    #[error("model actor could not be recovered")]
    Unrecoverable,
}

/// Error returned by [`ActorRef::execute`](crate::ActorRef::execute).
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// The actor answered with a failure response.
    #[error(transparent)]
    Rejected(#[from] Failure),

    /// The success payload did not match the actor's reply type.
    #[error("cannot decode reply: {0}")]
    Decode(#[source] serde_json::Error),

    /// The actor task exited before it could answer.
    #[error("model actor is no longer running")]
    ActorGone,
}

impl From<AskError> for ExecuteError {
    fn from(err: AskError) -> Self {
        match err {
            AskError::ActorGone => ExecuteError::ActorGone,
            AskError::DoesNotExist => ExecuteError::Rejected(Failure::new(
                FailureKind::ActorDoesNotExist,
                err.to_string(),
            )),
            AskError::Unrecoverable => {
                ExecuteError::Rejected(Failure::new(FailureKind::Unrecoverable, err.to_string()))
            }
        }
    }
}

/// Error returned when loading an [`EngineConfig`](crate::EngineConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration is not valid JSON or has wrong field types.
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}
