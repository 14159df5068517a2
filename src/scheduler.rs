//! Cancellable delayed jobs, and the timer handle actors use to send
//! commands to themselves later.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::actor::{Control, Mail};
use crate::message::{CommandMessage, IncomingMessage, ReplyTo, UserIdentity};
use crate::model::ModelActor;

/// Identifier of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

type Registry = Arc<Mutex<HashMap<JobId, AbortHandle>>>;

/// Registry of pending delayed jobs.
///
/// A fired job removes itself from the registry before it runs, so the
/// registry only ever lists jobs that have not started. Cancellation is
/// best-effort: a job whose timer already expired may still run, and the
/// work it does must check on arrival whether it is still wanted.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    jobs: Registry,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` once `delay` has elapsed.
    pub fn schedule<F>(&self, delay: Duration, job: F) -> JobHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = JobId(Uuid::new_v4());
        let jobs = Arc::clone(&self.jobs);
        // Registered under the lock so the job cannot fire before it is listed.
        let mut registry = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let registered = jobs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id)
                .is_some();
            if registered {
                job.await;
            }
        });
        registry.insert(id, task.abort_handle());
        JobHandle {
            id,
            jobs: Arc::clone(&self.jobs),
        }
    }

    /// Cancel every pending job.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "cancelling scheduled jobs");
        }
        for (_, handle) in drained {
            handle.abort();
        }
    }

    /// Number of jobs that have not fired yet.
    pub fn pending(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Handle to one scheduled job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    jobs: Registry,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Cancel the job. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&self) -> bool {
        let removed = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        match removed {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&self.id)
    }
}

/// Schedules work that comes back through an actor's own mailbox.
///
/// Holds only a weak reference to the mailbox: a timer never keeps an
/// evicted actor alive, and a timer that fires after the actor is gone is
/// dropped.
pub struct Timers<A: ModelActor> {
    scheduler: Scheduler,
    mailbox: mpsc::WeakSender<Mail<A>>,
}

impl<A: ModelActor> Clone for Timers<A> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
            mailbox: self.mailbox.clone(),
        }
    }
}

impl<A: ModelActor> Timers<A> {
    pub(crate) fn new(scheduler: Scheduler, mailbox: mpsc::WeakSender<Mail<A>>) -> Self {
        Self { scheduler, mailbox }
    }

    /// Deliver `command` to this actor after `delay`, as a fire-and-forget
    /// message on behalf of `user`.
    pub fn schedule_command(&self, delay: Duration, command: A::Command, user: UserIdentity) -> JobHandle {
        let mailbox = self.mailbox.clone();
        self.scheduler.schedule(delay, async move {
            let message = CommandMessage::new(command, user, ReplyTo::Nobody);
            if let Some(tx) = mailbox.upgrade()
                && tx
                    .send(Mail::Incoming(IncomingMessage::Command(message)))
                    .await
                    .is_err()
            {
                tracing::debug!("timer fired after the actor stopped");
            }
        })
    }

    pub(crate) fn schedule_control(&self, delay: Duration, control: Control) -> JobHandle {
        let mailbox = self.mailbox.clone();
        self.scheduler.schedule(delay, async move {
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx.send(Mail::Control(control)).await;
            }
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}
