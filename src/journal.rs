//! Durable append-only log of model events, keyed by persistence id.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};

use crate::error::JournalError;
use crate::event::{DomainEvent, ModelEvent};
use crate::storage::StreamLayout;

/// One event as stored in the journal.
///
/// The full [`ModelEvent`] envelope lives in `payload` as JSON; the other
/// fields are copies kept for routing and inspection without decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub persistence_id: String,
    /// Position in the persistence id's log, starting at 1. Assigned by the
    /// journal on write.
    pub sequence_nr: u64,
    pub actor_type: String,
    /// Event kind.
    pub manifest: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl JournalRecord {
    /// Encode an event for writing. The sequence number is left at 0.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the domain event fails to serialize.
    pub fn encode<E: DomainEvent>(event: &ModelEvent<E>) -> Result<Self, serde_json::Error> {
        Ok(Self {
            persistence_id: event.actor_id.clone(),
            sequence_nr: 0,
            actor_type: event.actor_type.clone(),
            manifest: event.kind().to_owned(),
            timestamp: event.timestamp,
            payload: serde_json::to_value(event)?,
        })
    }
}

/// Storage backend for model events.
///
/// A write of several records is atomic: either all of them become durable
/// under consecutive sequence numbers, or none do.
#[async_trait]
pub trait Journal: Send + Sync + 'static {
    /// Append `records` to the log of `persistence_id`.
    ///
    /// Returns the sequence number of the last record written.
    async fn write(
        &self,
        persistence_id: &str,
        records: Vec<JournalRecord>,
    ) -> Result<u64, JournalError>;

    /// Read all records with `sequence_nr >= from_sequence_nr`, in order.
    async fn read(
        &self,
        persistence_id: &str,
        from_sequence_nr: u64,
    ) -> Result<Vec<JournalRecord>, JournalError>;

    /// Highest sequence number written, or 0 for an empty log.
    async fn highest_sequence_nr(&self, persistence_id: &str) -> Result<u64, JournalError>;

    /// All persistence ids that have at least one record.
    async fn persistence_ids(&self) -> Result<Vec<String>, JournalError>;
}

fn number(records: &mut [JournalRecord], persistence_id: &str, highest: u64) -> u64 {
    let mut seq = highest;
    for record in records.iter_mut() {
        seq += 1;
        record.sequence_nr = seq;
        record.persistence_id = persistence_id.to_owned();
    }
    seq
}

/// Journal kept entirely in memory. Lost when the process exits.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJournal {
    logs: Arc<RwLock<HashMap<String, Vec<JournalRecord>>>>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Journal for InMemoryJournal {
    async fn write(
        &self,
        persistence_id: &str,
        mut records: Vec<JournalRecord>,
    ) -> Result<u64, JournalError> {
        let mut logs = self.logs.write().await;
        let log = logs.entry(persistence_id.to_owned()).or_default();
        let highest = log.last().map_or(0, |r| r.sequence_nr);
        let last = number(&mut records, persistence_id, highest);
        log.extend(records);
        Ok(last)
    }

    async fn read(
        &self,
        persistence_id: &str,
        from_sequence_nr: u64,
    ) -> Result<Vec<JournalRecord>, JournalError> {
        let logs = self.logs.read().await;
        Ok(logs
            .get(persistence_id)
            .map(|log| {
                log.iter()
                    .filter(|r| r.sequence_nr >= from_sequence_nr)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn highest_sequence_nr(&self, persistence_id: &str) -> Result<u64, JournalError> {
        let logs = self.logs.read().await;
        Ok(logs
            .get(persistence_id)
            .and_then(|log| log.last())
            .map_or(0, |r| r.sequence_nr))
    }

    async fn persistence_ids(&self) -> Result<Vec<String>, JournalError> {
        let logs = self.logs.read().await;
        let mut ids: Vec<String> = logs
            .iter()
            .filter(|(_, log)| !log.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// Journal storing one JSONL file per persistence id.
///
/// A batch is serialized up front and appended with a single write
/// followed by `sync_data`. A batch counts only once its final newline is
/// on disk: bytes after the last newline are left over from a write that
/// never completed and are ignored on read and cut off by the next write.
#[derive(Debug)]
pub struct FileJournal {
    layout: StreamLayout,
    tails: Mutex<HashMap<String, LogTail>>,
}

/// Where the complete part of a log file ends.
#[derive(Debug, Clone, Copy, Default)]
struct LogTail {
    highest: u64,
    len: u64,
}

#[derive(Debug, Default)]
struct LogFile {
    records: Vec<JournalRecord>,
    tail: LogTail,
}

impl FileJournal {
    pub fn new(layout: StreamLayout) -> Self {
        Self {
            layout,
            tails: Mutex::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &StreamLayout {
        &self.layout
    }

    fn path(&self, persistence_id: &str) -> Result<PathBuf, JournalError> {
        self.layout
            .journal_file(persistence_id)
            .ok_or_else(|| JournalError::InvalidPersistenceId(persistence_id.to_owned()))
    }

    async fn read_file(&self, persistence_id: &str) -> Result<LogFile, JournalError> {
        let path = self.path(persistence_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LogFile::default()),
            Err(e) => return Err(e.into()),
        };
        let complete = bytes
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |i| i + 1);
        if complete < bytes.len() {
            tracing::warn!(
                persistence_id,
                ignored_bytes = bytes.len() - complete,
                "ignoring incomplete write at the end of the journal"
            );
        }
        let mut records = Vec::new();
        for line in bytes[..complete]
            .split(|b| *b == b'\n')
            .filter(|l| !l.iter().all(u8::is_ascii_whitespace))
        {
            records.push(serde_json::from_slice::<JournalRecord>(line)?);
        }
        let tail = LogTail {
            highest: records.last().map_or(0, |r| r.sequence_nr),
            len: complete as u64,
        };
        Ok(LogFile { records, tail })
    }

    async fn cached_tail(
        &self,
        cache: &mut HashMap<String, LogTail>,
        persistence_id: &str,
    ) -> Result<LogTail, JournalError> {
        if let Some(tail) = cache.get(persistence_id) {
            return Ok(*tail);
        }
        let tail = self.read_file(persistence_id).await?.tail;
        cache.insert(persistence_id.to_owned(), tail);
        Ok(tail)
    }
}

async fn append(file: &mut tokio::fs::File, offset: u64, buf: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(buf).await?;
    file.flush().await?;
    file.sync_data().await
}

#[async_trait]
impl Journal for FileJournal {
    async fn write(
        &self,
        persistence_id: &str,
        mut records: Vec<JournalRecord>,
    ) -> Result<u64, JournalError> {
        let path = self.path(persistence_id)?;
        // Held across the write so batches for one id are numbered in order.
        let mut cache = self.tails.lock().await;
        let tail = self.cached_tail(&mut cache, persistence_id).await?;
        let last = number(&mut records, persistence_id, tail.highest);

        let mut buf = Vec::new();
        for record in &records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        tokio::fs::create_dir_all(self.layout.journal_dir()).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;
        // cuts off whatever an incomplete earlier write left behind
        file.set_len(tail.len).await?;
        if let Err(e) = append(&mut file, tail.len, &buf).await {
            if let Err(undo) = file.set_len(tail.len).await {
                tracing::warn!(persistence_id, error = %undo, "cannot cut off failed journal append");
            }
            return Err(e.into());
        }

        cache.insert(
            persistence_id.to_owned(),
            LogTail {
                highest: last,
                len: tail.len + buf.len() as u64,
            },
        );
        tracing::trace!(persistence_id, last, count = records.len(), "journal append");
        Ok(last)
    }

    async fn read(
        &self,
        persistence_id: &str,
        from_sequence_nr: u64,
    ) -> Result<Vec<JournalRecord>, JournalError> {
        let mut records = self.read_file(persistence_id).await?.records;
        records.retain(|r| r.sequence_nr >= from_sequence_nr);
        Ok(records)
    }

    async fn highest_sequence_nr(&self, persistence_id: &str) -> Result<u64, JournalError> {
        let mut cache = self.tails.lock().await;
        Ok(self.cached_tail(&mut cache, persistence_id).await?.highest)
    }

    async fn persistence_ids(&self) -> Result<Vec<String>, JournalError> {
        let layout = self.layout.clone();
        let ids = tokio::task::spawn_blocking(move || layout.list_persistence_ids())
            .await
            .map_err(|e| JournalError::Rejected(e.to_string()))??;
        Ok(ids)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use super::*;

    /// In-memory journal whose writes each wait for a permit.
    #[derive(Debug, Clone)]
    pub(crate) struct GatedJournal {
        inner: InMemoryJournal,
        gate: Arc<Semaphore>,
    }

    impl GatedJournal {
        /// A journal that holds every write until [`open_writes`](Self::open_writes).
        pub(crate) fn closed() -> Self {
            Self {
                inner: InMemoryJournal::new(),
                gate: Arc::new(Semaphore::new(0)),
            }
        }

        /// Let `writes` more writes through.
        pub(crate) fn open_writes(&self, writes: usize) {
            self.gate.add_permits(writes);
        }
    }

    #[async_trait]
    impl Journal for GatedJournal {
        async fn write(
            &self,
            persistence_id: &str,
            records: Vec<JournalRecord>,
        ) -> Result<u64, JournalError> {
            self.gate
                .acquire()
                .await
                .map_err(|e| JournalError::Rejected(e.to_string()))?
                .forget();
            self.inner.write(persistence_id, records).await
        }

        async fn read(
            &self,
            persistence_id: &str,
            from_sequence_nr: u64,
        ) -> Result<Vec<JournalRecord>, JournalError> {
            self.inner.read(persistence_id, from_sequence_nr).await
        }

        async fn highest_sequence_nr(&self, persistence_id: &str) -> Result<u64, JournalError> {
            self.inner.highest_sequence_nr(persistence_id).await
        }

        async fn persistence_ids(&self) -> Result<Vec<String>, JournalError> {
            self.inner.persistence_ids().await
        }
    }
}
