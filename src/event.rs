//! The event envelope written to the journal, and the two universal events
//! every actor understands.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::message::UserIdentity;

/// A domain event produced by a model actor.
///
/// Events are plain data. Implementations use adjacently tagged serde
/// (`#[serde(tag = "type", content = "data")]`) so the variant name doubles
/// as the journal manifest.
pub trait DomainEvent:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    /// Stable name of this event kind, matched against
    /// [`Capabilities::events`](crate::Capabilities).
    fn kind(&self) -> &'static str;

    /// `Some(tenant)` if this event creates the actor.
    ///
    /// Replaying a bootstrap event assigns the tenant and unlocks the actor
    /// for ordinary commands.
    fn bootstrap_tenant(&self) -> Option<&str> {
        None
    }
}

/// Version of the engine that produced an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineVersion {
    /// Release identifier, e.g. `"1.4.0"`.
    pub version: String,
    /// Optional build or commit tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
}

impl EngineVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            build: None,
        }
    }

    pub fn with_build(mut self, build: impl Into<String>) -> Self {
        self.build = Some(build.into());
        self
    }

    /// True if `other` was produced by a different engine build than `self`.
    pub fn differs(&self, other: &EngineVersion) -> bool {
        self != other
    }
}

impl Default for EngineVersion {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_VERSION"))
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.build {
            Some(build) => write!(f, "{} ({build})", self.version),
            None => f.write_str(&self.version),
        }
    }
}

/// One line of diagnostic output collected while handling a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DebugEntry {
    Text(String),
    Json {
        label: String,
        value: serde_json::Value,
    },
    Error(String),
}

/// All diagnostic output of a single message.
///
/// At most one exists per message. It is written to the journal only when
/// debug mode is on and is skipped during replay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebugEvent {
    pub entries: Vec<DebugEntry>,
}

impl DebugEvent {
    pub fn add_text(&mut self, text: impl Into<String>) {
        self.entries.push(DebugEntry::Text(text.into()));
    }

    pub fn add_json(&mut self, label: impl Into<String>, value: serde_json::Value) {
        self.entries.push(DebugEntry::Json {
            label: label.into(),
            value,
        });
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        self.entries.push(DebugEntry::Error(error.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What a [`ModelEvent`] carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload<E> {
    /// An event of the actor's own domain.
    Domain(E),
    /// The actor was touched by a different engine build than the one
    /// recorded in its state.
    EngineVersionChanged { version: EngineVersion },
    /// Diagnostic output of one message.
    Debug(DebugEvent),
}

/// Manifest used for [`EventPayload::EngineVersionChanged`].
pub const ENGINE_VERSION_CHANGED: &str = "EngineVersionChanged";

/// Manifest used for [`EventPayload::Debug`].
pub const DEBUG_EVENT: &str = "DebugEvent";

/// An immutable fact recorded by a model actor.
///
/// The envelope carries the identity of the actor that produced it, the
/// tenant, the transaction timestamp shared by all events of one message,
/// and the user on whose behalf it was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEvent<E> {
    pub actor_id: String,
    pub actor_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub user: UserIdentity,
    /// Engine build that created the actor; set on bootstrap events only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<EngineVersion>,
    pub payload: EventPayload<E>,
}

impl<E> ModelEvent<E> {
    /// The domain event, if this is one.
    pub fn domain(&self) -> Option<&E> {
        match &self.payload {
            EventPayload::Domain(event) => Some(event),
            _ => None,
        }
    }

    /// Debug events never influence state.
    pub fn is_debug(&self) -> bool {
        matches!(self.payload, EventPayload::Debug(_))
    }

    pub fn is_stateful(&self) -> bool {
        !self.is_debug()
    }

    /// Re-wrap the envelope around a different payload type.
    pub(crate) fn with_payload<F>(self, payload: EventPayload<F>) -> ModelEvent<F> {
        ModelEvent {
            actor_id: self.actor_id,
            actor_type: self.actor_type,
            tenant: self.tenant,
            timestamp: self.timestamp,
            user: self.user,
            engine_version: self.engine_version,
            payload,
        }
    }
}

impl<E: DomainEvent> ModelEvent<E> {
    /// Journal manifest of this event.
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            EventPayload::Domain(event) => event.kind(),
            EventPayload::EngineVersionChanged { .. } => ENGINE_VERSION_CHANGED,
            EventPayload::Debug(_) => DEBUG_EVENT,
        }
    }

    pub fn bootstrap_tenant(&self) -> Option<&str> {
        self.domain().and_then(DomainEvent::bootstrap_tenant)
    }
}
