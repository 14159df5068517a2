//! Messages that enter a model actor and the responses that leave it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::model::ModelActor;
use crate::recovery::RecoveryMessage;

/// The user on whose behalf a message is handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Identity used for engine-internal work such as timers.
    pub fn system() -> Self {
        Self::new("system")
    }
}

/// Category of a failed message, carried on every failure response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The domain declined the command.
    CommandFailed,
    /// The command was not acceptable for this actor or its state.
    InvalidCommand,
    /// The user is not allowed to perform the command.
    SecurityFailure,
    /// Domain code hit an undeclared fault.
    ActorChoked,
    /// The events of the command could not be made durable.
    EngineChoked,
    /// A bootstrap command reached an actor that already exists.
    ActorExists,
    /// A regular command reached an actor that was never created.
    ActorDoesNotExist,
    /// The actor could not rebuild its state from the journal.
    Unrecoverable,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::CommandFailed => "command failed",
            FailureKind::InvalidCommand => "invalid command",
            FailureKind::SecurityFailure => "security failure",
            FailureKind::ActorChoked => "actor choked",
            FailureKind::EngineChoked => "engine choked",
            FailureKind::ActorExists => "actor already exists",
            FailureKind::ActorDoesNotExist => "actor does not exist",
            FailureKind::Unrecoverable => "actor not recovered",
        })
    }
}

/// A failure outcome: kind plus human readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Result of handling one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Outcome {
    Success(serde_json::Value),
    Failure(Failure),
}

/// Reply to a command, correlated by message id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub message_id: String,
    pub actor_id: String,
    /// Time of the last state change of the actor at reply time.
    pub last_modified: Option<DateTime<Utc>>,
    pub outcome: Outcome,
}

impl ModelResponse {
    pub fn failure(&self) -> Option<&Failure> {
        match &self.outcome {
            Outcome::Failure(failure) => Some(failure),
            Outcome::Success(_) => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure().is_some()
    }

    /// Success payload, or the failure.
    pub fn into_result(self) -> Result<serde_json::Value, Failure> {
        match self.outcome {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(failure) => Err(failure),
        }
    }
}

/// Receives a response on behalf of another model actor.
pub trait ResponseSink: Send + 'static {
    fn deliver(self: Box<Self>, response: ModelResponse);
}

/// Where the response to a command goes.
pub enum ReplyTo {
    /// Fire-and-forget; the response is dropped.
    Nobody,
    /// An external caller waiting on a oneshot channel.
    Caller(oneshot::Sender<ModelResponse>),
    /// Another model actor that asked this one.
    Actor(Box<dyn ResponseSink>),
}

impl ReplyTo {
    pub fn send(self, response: ModelResponse) {
        match self {
            ReplyTo::Nobody => {}
            ReplyTo::Caller(tx) => {
                if tx.send(response).is_err() {
                    tracing::debug!("caller went away before the response was sent");
                }
            }
            ReplyTo::Actor(sink) => sink.deliver(response),
        }
    }
}

impl fmt::Debug for ReplyTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReplyTo::Nobody => "Nobody",
            ReplyTo::Caller(_) => "Caller",
            ReplyTo::Actor(_) => "Actor",
        })
    }
}

/// A typed command on its way into an actor.
#[derive(Debug)]
pub struct CommandMessage<C> {
    pub message_id: String,
    pub user: UserIdentity,
    pub command: C,
    pub reply_to: ReplyTo,
}

impl<C> CommandMessage<C> {
    /// Wrap a command under a fresh message id.
    pub fn new(command: C, user: UserIdentity, reply_to: ReplyTo) -> Self {
        Self {
            message_id: new_message_id(),
            user,
            command,
            reply_to,
        }
    }
}

/// Everything that may be admitted by an actor's reception.
pub enum IncomingMessage<A: ModelActor> {
    Command(CommandMessage<A::Command>),
    /// Reply to a command this actor sent to another actor.
    Response(ModelResponse),
    /// Replay input, only ever produced while recovering.
    Recovery(RecoveryMessage<A::Event>),
}

/// A command addressed to an actor by type name and id, with an untyped
/// JSON body. Used for actor-to-actor traffic through the
/// [`Gateway`](crate::Gateway).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub message_id: String,
    pub actor_type: String,
    pub actor_id: String,
    pub user: UserIdentity,
    pub command: serde_json::Value,
}

impl CommandEnvelope {
    pub fn new(
        actor_type: impl Into<String>,
        actor_id: impl Into<String>,
        user: UserIdentity,
        command: serde_json::Value,
    ) -> Self {
        Self {
            message_id: new_message_id(),
            actor_type: actor_type.into(),
            actor_id: actor_id.into(),
            user,
            command,
        }
    }

    /// Failure response for an envelope that never reached its actor.
    pub(crate) fn undeliverable(&self, failure: Failure) -> ModelResponse {
        ModelResponse {
            message_id: self.message_id.clone(),
            actor_id: self.actor_id.clone(),
            last_modified: None,
            outcome: Outcome::Failure(failure),
        }
    }
}

pub(crate) fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(outcome: Outcome) -> ModelResponse {
        ModelResponse {
            message_id: "m-1".into(),
            actor_id: "a-1".into(),
            last_modified: None,
            outcome,
        }
    }

    #[test]
    fn failure_display_includes_kind() {
        let failure = Failure::new(FailureKind::ActorExists, "a-1");
        assert_eq!(failure.to_string(), "actor already exists: a-1");
    }

    #[test]
    fn response_into_result_splits_outcome() {
        let ok = response(Outcome::Success(serde_json::json!({"n": 2})));
        assert!(!ok.is_failure());
        assert_eq!(ok.into_result().expect("success"), serde_json::json!({"n": 2}));

        let failed = response(Outcome::Failure(Failure::new(
            FailureKind::EngineChoked,
            "disk full",
        )));
        assert_eq!(
            failed.failure().map(|f| f.kind),
            Some(FailureKind::EngineChoked)
        );
    }

    #[tokio::test]
    async fn reply_to_caller_delivers_once() {
        let (tx, rx) = oneshot::channel();
        ReplyTo::Caller(tx).send(response(Outcome::Success(serde_json::Value::Null)));
        let received = rx.await.expect("response should arrive");
        assert_eq!(received.message_id, "m-1");
    }

    #[test]
    fn reply_to_dropped_caller_does_not_panic() {
        let (tx, rx) = oneshot::channel();
        drop(rx);
        ReplyTo::Caller(tx).send(response(Outcome::Success(serde_json::Value::Null)));
    }

    #[test]
    fn message_ids_are_unique() {
        let a = CommandMessage::new((), UserIdentity::new("u"), ReplyTo::Nobody);
        let b = CommandMessage::new((), UserIdentity::new("u"), ReplyTo::Nobody);
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn user_roles() {
        let user = UserIdentity::new("bob").with_role("admin");
        assert!(user.has_role("admin"));
        assert!(!user.has_role("guest"));
    }
}
