//! On-disk directory layout shared by the file journal and snapshot store.

use std::path::{Path, PathBuf};

/// Manages the on-disk directory layout for model actor data.
///
/// The layout follows this structure:
/// ```text
/// <base_dir>/
///     journal/
///         <persistence_id>.jsonl      -- one record per line
///     snapshots/
///         <actor_type>/
///             <actor_id>/
///                 snapshot.json
/// ```
///
/// `StreamLayout` is cheap to clone (it wraps a single `PathBuf`).
#[derive(Debug, Clone)]
pub struct StreamLayout {
    base_dir: PathBuf,
}

impl StreamLayout {
    /// Create a new `StreamLayout` rooted at the given base directory.
    ///
    /// # Arguments
    ///
    /// * `base_dir` - Root directory for all actor data. The directory does
    ///   not need to exist yet; writers create what they need lazily.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this layout.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns `<base_dir>/journal`.
    pub fn journal_dir(&self) -> PathBuf {
        self.base_dir.join("journal")
    }

    /// Returns the journal file of one persistence id, or `None` if the id
    /// cannot be used as a file name.
    ///
    /// # Returns
    ///
    /// `<base_dir>/journal/<persistence_id>.jsonl`
    pub fn journal_file(&self, persistence_id: &str) -> Option<PathBuf> {
        is_safe_segment(persistence_id)
            .then(|| self.journal_dir().join(format!("{persistence_id}.jsonl")))
    }

    /// Returns the snapshot file of one actor, or `None` if either segment
    /// cannot be used as a directory name.
    ///
    /// # Returns
    ///
    /// `<base_dir>/snapshots/<actor_type>/<actor_id>/snapshot.json`
    pub fn snapshot_file(&self, actor_type: &str, actor_id: &str) -> Option<PathBuf> {
        (is_safe_segment(actor_type) && is_safe_segment(actor_id)).then(|| {
            self.base_dir
                .join("snapshots")
                .join(actor_type)
                .join(actor_id)
                .join("snapshot.json")
        })
    }

    /// Lists the persistence ids that have a journal file.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the journal directory exists but cannot
    /// be read.
    pub fn list_persistence_ids(&self) -> std::io::Result<Vec<String>> {
        let dir = self.journal_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "jsonl")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(stem.to_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\', '\0'])
}
