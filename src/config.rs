//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::callstack::UnwindOrder;
use crate::error::ConfigError;
use crate::event::EngineVersion;

/// Default idle period before an actor with auto-shutdown is evicted.
pub const DEFAULT_IDLE_PERIOD: Duration = Duration::from_secs(300);

/// Default mailbox capacity per actor.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 32;

/// Settings shared by every actor of an [`ActorSystem`](crate::ActorSystem).
///
/// Every field has a default, so a configuration file only needs to list
/// what it changes:
///
/// ```json
/// { "idle_period_ms": 60000, "debug_mode": true }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long an actor may go without messages before it is evicted.
    #[serde(rename = "idle_period_ms", with = "duration_ms")]
    pub idle_period: Duration,
    /// Persist a debug event alongside the events of every message.
    pub debug_mode: bool,
    /// Version stamped on bootstrap events and compared on every message.
    pub engine_version: EngineVersion,
    /// Save a snapshot every this many persisted records; 0 disables.
    pub snapshot_interval: u64,
    pub mailbox_capacity: usize,
    pub unwind_order: UnwindOrder,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_period: DEFAULT_IDLE_PERIOD,
            debug_mode: false,
            engine_version: EngineVersion::default(),
            snapshot_interval: 0,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            unwind_order: UnwindOrder::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the text is not valid JSON or a
    /// field has the wrong type.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Parse`] if its contents are invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
