//! Ordered, per-actor write queue in front of the journal.
//!
//! Batches are written strictly in the order they were handed over. The
//! response belonging to a batch is sent once the whole batch is durable.
//! After the first failed write the queue shuts down: every batch still
//! queued is answered with an "engine choked" failure, and the actor stops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tokio::sync::{mpsc, oneshot};

use crate::actor::{Control, Mail};
use crate::health::HealthMonitor;
use crate::journal::{Journal, JournalRecord};
use crate::message::{Failure, FailureKind, ModelResponse, Outcome, ReplyTo};
use crate::model::ModelActor;

/// A response held back until its batch is durable.
#[derive(Debug)]
pub(crate) struct PendingReply {
    pub to: ReplyTo,
    pub response: ModelResponse,
}

impl PendingReply {
    fn reject(self, reason: &str) {
        let response = ModelResponse {
            outcome: Outcome::Failure(Failure::new(
                FailureKind::EngineChoked,
                format!("events of message {} were not persisted: {reason}", self.response.message_id),
            )),
            ..self.response
        };
        self.to.send(response);
    }
}

enum WriteRequest {
    Batch {
        records: Vec<JournalRecord>,
        reply: Option<PendingReply>,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct QueueState {
    in_flight: AtomicUsize,
    last_sequence_nr: AtomicU64,
    failed: AtomicBool,
}

/// Handle to the writer task of one actor.
#[derive(Clone)]
pub(crate) struct Warehouse {
    tx: mpsc::UnboundedSender<WriteRequest>,
    state: Arc<QueueState>,
}

impl Warehouse {
    /// Start the writer task for `persistence_id`.
    pub(crate) fn spawn<A: ModelActor>(
        persistence_id: String,
        journal: Arc<dyn Journal>,
        health: HealthMonitor,
        mailbox: mpsc::WeakSender<Mail<A>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(QueueState::default());
        let writer = Writer {
            persistence_id,
            journal,
            health,
            state: Arc::clone(&state),
            mailbox,
        };
        tokio::spawn(writer.run(rx));
        Self { tx, state }
    }

    /// Queue a batch. `reply` is sent once the batch is durable.
    pub(crate) fn enqueue(&self, records: Vec<JournalRecord>, reply: Option<PendingReply>) {
        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(request)) =
            self.tx.send(WriteRequest::Batch { records, reply })
        {
            self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
            if let WriteRequest::Batch {
                reply: Some(reply), ..
            } = request
            {
                reply.reject("journal writer has stopped");
            }
        }
    }

    /// Wait until every batch queued so far has been written.
    ///
    /// Returns `false` if the writer has stopped after a failure.
    pub(crate) async fn flush(&self) -> bool {
        let (done, wait) = oneshot::channel();
        if self.tx.send(WriteRequest::Flush(done)).is_err() {
            return false;
        }
        wait.await.is_ok() && !self.has_failed()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn last_sequence_nr(&self) -> u64 {
        self.state.last_sequence_nr.load(Ordering::SeqCst)
    }

    /// The highest durable sequence number, provided nothing is queued or
    /// being written and no write has failed.
    pub(crate) fn settled_sequence_nr(&self) -> Option<u64> {
        if self.has_failed() || self.in_flight() > 0 {
            return None;
        }
        Some(self.last_sequence_nr())
    }

    pub(crate) fn recovered_up_to(&self, sequence_nr: u64) {
        self.state
            .last_sequence_nr
            .fetch_max(sequence_nr, Ordering::SeqCst);
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.state.failed.load(Ordering::SeqCst)
    }
}

struct Writer<A: ModelActor> {
    persistence_id: String,
    journal: Arc<dyn Journal>,
    health: HealthMonitor,
    state: Arc<QueueState>,
    mailbox: mpsc::WeakSender<Mail<A>>,
}

impl<A: ModelActor> Writer<A> {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<WriteRequest>) {
        while let Some(request) = rx.recv().await {
            match request {
                WriteRequest::Flush(done) => {
                    let _ = done.send(());
                }
                WriteRequest::Batch { records, reply } => {
                    if let Err(reason) = self.write(records, reply).await {
                        self.shut_down(&mut rx, &reason).await;
                        return;
                    }
                }
            }
        }
    }

    async fn write(
        &self,
        records: Vec<JournalRecord>,
        reply: Option<PendingReply>,
    ) -> Result<(), String> {
        let manifests: Vec<String> = records.iter().map(|r| r.manifest.clone()).collect();
        let result = self.journal.write(&self.persistence_id, records).await;
        // publish the outcome before the batch stops counting as in flight
        match &result {
            Ok(last) => {
                self.state.last_sequence_nr.fetch_max(*last, Ordering::SeqCst);
            }
            Err(_) => self.state.failed.store(true, Ordering::SeqCst),
        }
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        match result {
            Ok(last) => {
                self.health.journal_ok();
                let first = last + 1 - manifests.len() as u64;
                for (offset, manifest) in manifests.iter().enumerate() {
                    tracing::debug!(
                        sequence_nr = first + offset as u64,
                        manifest = %manifest,
                        "persisted event"
                    );
                }
                if let Some(reply) = reply {
                    reply.to.send(reply.response);
                }
                self.notify(Control::Persisted);
                Ok(())
            }
            Err(e) => {
                self.health.journal_failed(&e);
                tracing::error!(
                    persistence_id = %self.persistence_id,
                    error = %e,
                    events = manifests.len(),
                    "failed to persist events; actor will stop"
                );
                let reason = e.to_string();
                if let Some(reply) = reply {
                    reply.reject(&reason);
                }
                Err(reason)
            }
        }
    }

    async fn shut_down(&self, rx: &mut mpsc::UnboundedReceiver<WriteRequest>, reason: &str) {
        rx.close();
        self.notify(Control::PersistFailed);
        while let Some(request) = rx.recv().await {
            if let WriteRequest::Batch { reply, .. } = request {
                self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
                if let Some(reply) = reply {
                    reply.reject(reason);
                }
            }
        }
    }

    // Never awaits: the actor may itself be waiting on a flush.
    fn notify(&self, control: Control) {
        if let Some(tx) = self.mailbox.upgrade() {
            let _ = tx.try_send(Mail::Control(control));
        }
    }
}
