//! Snapshots of actor state, offered to an actor at the start of recovery.
//!
//! File snapshots are stored as JSON at
//! `<base_dir>/snapshots/<actor_type>/<actor_id>/snapshot.json`.
//! Writes are atomic via a temp-rename pattern to prevent corruption
//! from crashes mid-write.

use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::EngineVersion;
use crate::storage::StreamLayout;

/// A point-in-time copy of an actor's state.
///
/// `sequence_nr` is the last journal record folded into `state`; recovery
/// resumes replay at `sequence_nr + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorSnapshot {
    pub sequence_nr: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<EngineVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    pub state: serde_json::Value,
}

/// Where snapshots are kept.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Load the snapshot of one actor.
    ///
    /// # Returns
    ///
    /// `Ok(None)` if there is none or it cannot be read back.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` only for unexpected I/O failures.
    fn load(&self, actor_type: &str, actor_id: &str) -> io::Result<Option<ActorSnapshot>>;

    /// Replace the snapshot of one actor.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the snapshot cannot be written.
    fn save(&self, actor_type: &str, actor_id: &str, snapshot: &ActorSnapshot) -> io::Result<()>;
}

/// Snapshot store backed by the local file system.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    layout: StreamLayout,
}

impl FileSnapshotStore {
    pub fn new(layout: StreamLayout) -> Self {
        Self { layout }
    }

    fn path(&self, actor_type: &str, actor_id: &str) -> io::Result<std::path::PathBuf> {
        self.layout
            .snapshot_file(actor_type, actor_id)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("cannot store a snapshot for {actor_type}/{actor_id}"),
                )
            })
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self, actor_type: &str, actor_id: &str) -> io::Result<Option<ActorSnapshot>> {
        let path = self.path(actor_type, actor_id)?;
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        match serde_json::from_slice::<ActorSnapshot>(&bytes) {
            Ok(snap) => Ok(Some(snap)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to deserialize snapshot; treating as cache miss"
                );
                Ok(None)
            }
        }
    }

    /// Writes to `snapshot.json.tmp` in the same directory, then renames it
    /// to `snapshot.json`. Readers never see a partially-written file.
    fn save(&self, actor_type: &str, actor_id: &str, snapshot: &ActorSnapshot) -> io::Result<()> {
        let path = self.path(actor_type, actor_id)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(seq: u64) -> ActorSnapshot {
        ActorSnapshot {
            sequence_nr: seq,
            tenant: Some("acme".into()),
            engine_version: Some(EngineVersion::new("1.0")),
            last_modified: None,
            state: serde_json::json!({"entries": ["a", "b"]}),
        }
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileSnapshotStore::new(StreamLayout::new(dir.path()));

        store
            .save("ledger", "l-1", &snapshot(7))
            .expect("save should succeed");
        let loaded = store
            .load("ledger", "l-1")
            .expect("load should succeed")
            .expect("snapshot should exist");
        assert_eq!(loaded, snapshot(7));
    }

    #[test]
    fn load_nonexistent_returns_none() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileSnapshotStore::new(StreamLayout::new(dir.path()));
        let result = store.load("ledger", "no-such-id").expect("load should succeed");
        assert!(result.is_none());
    }

    #[test]
    fn load_corrupt_json_returns_none() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let layout = StreamLayout::new(dir.path());
        let path = layout.snapshot_file("ledger", "l-bad").expect("path");
        std::fs::create_dir_all(path.parent().expect("parent")).expect("create dir");
        std::fs::write(&path, b"this is not valid json!!!").expect("write corrupt file");

        let store = FileSnapshotStore::new(layout);
        let result = store
            .load("ledger", "l-bad")
            .expect("load should succeed (not Err)");
        assert!(
            result.is_none(),
            "corrupt JSON should return Ok(None), not Ok(Some(...))"
        );
    }

    #[test]
    fn save_replaces_previous_snapshot_atomically() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let layout = StreamLayout::new(dir.path());
        let store = FileSnapshotStore::new(layout.clone());

        store.save("ledger", "l-1", &snapshot(3)).expect("first save");
        store.save("ledger", "l-1", &snapshot(9)).expect("second save");

        let final_path = layout.snapshot_file("ledger", "l-1").expect("path");
        assert!(final_path.exists(), "final snapshot file should exist");
        assert!(
            !final_path.with_extension("json.tmp").exists(),
            "temp file should not exist after successful save"
        );
        let loaded = store.load("ledger", "l-1").expect("load").expect("exists");
        assert_eq!(loaded.sequence_nr, 9);
    }

    #[test]
    fn invalid_ids_are_io_errors() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileSnapshotStore::new(StreamLayout::new(dir.path()));
        let err = store.load("ledger", "../x").expect_err("should reject");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
