//! Per-message buffer of events, debug output and the response.

use crate::context::{ActorCore, settle};
use crate::event::{DebugEvent, DomainEvent, EventPayload, ModelEvent};
use crate::journal::JournalRecord;
use crate::message::{Failure, FailureKind, Outcome, ReplyTo};
use crate::persistence::{PendingReply, Warehouse};
use crate::reception::Reception;

/// What happened to a staged message.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Stored {
    /// Replied; nothing stateful to persist.
    Done,
    /// Events handed to the warehouse; the reply follows once durable.
    Persisting,
    /// A failure left unpersisted events behind; in-memory state is stale.
    Restart(String),
    /// The events could not even be encoded.
    Stop(String),
}

/// Everything one message produced, kept until it is persisted and
/// answered as a unit.
#[derive(Debug)]
pub(crate) struct StagingArea<E> {
    actor_type: &'static str,
    message_id: String,
    description: String,
    events: Vec<ModelEvent<E>>,
    debug: Option<DebugEvent>,
    outcome: Option<Outcome>,
}

impl<E: DomainEvent> StagingArea<E> {
    pub(crate) fn open(
        actor_type: &'static str,
        message_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            actor_type,
            message_id: message_id.into(),
            description: description.into(),
            events: Vec::new(),
            debug: None,
            outcome: None,
        }
    }

    pub(crate) fn add(&mut self, event: ModelEvent<E>) {
        self.events.push(event);
    }

    /// The message's debug event, created on first use.
    pub(crate) fn debug_event(&mut self) -> &mut DebugEvent {
        self.debug.get_or_insert_with(DebugEvent::default)
    }

    pub(crate) fn set_outcome(&mut self, outcome: Outcome) {
        self.outcome = Some(outcome);
    }

    pub(crate) fn has_failure(&self) -> bool {
        matches!(self.outcome, Some(Outcome::Failure(_)))
    }

    pub(crate) fn has_stateful_events(&self) -> bool {
        self.events.iter().any(ModelEvent::is_stateful)
    }

    fn take_debug_event(&mut self, core: &mut ActorCore) -> Option<ModelEvent<E>> {
        let debug = self.debug.take()?;
        if !core.debug_mode() || core.is_recovering() || debug.is_empty() {
            return None;
        }
        Some(ModelEvent {
            actor_id: core.id().to_owned(),
            actor_type: self.actor_type.to_owned(),
            tenant: core.tenant().map(str::to_owned),
            timestamp: core.transaction_timestamp(),
            user: core.current_user().clone(),
            engine_version: None,
            payload: EventPayload::Debug(debug),
        })
    }

    /// Finish the message: reply, persist, or request a restart.
    ///
    /// - On failure the response goes out at once and only the debug event
    ///   is persisted. If stateful events had been staged, the actor's
    ///   state no longer matches its journal and must be rebuilt.
    /// - With stateful events the debug event and the events are handed to
    ///   the warehouse as one batch; the response is released when the
    ///   batch is durable.
    /// - Otherwise the response goes out at once and the debug event, if
    ///   any, is persisted on its own.
    pub(crate) fn store(
        mut self,
        core: &mut ActorCore,
        reception: &mut Reception,
        reply_to: ReplyTo,
        warehouse: &Warehouse,
    ) -> Stored {
        let response = self
            .outcome
            .take()
            .map(|outcome| core.response(&self.message_id, outcome));
        let debug = self.take_debug_event(core);

        if response.as_ref().is_some_and(|r| r.is_failure()) || self.events.is_empty() {
            let stale = self.has_stateful_events();
            settle(core, reception, response.as_ref());
            if let Some(response) = response {
                reply_to.send(response);
            }
            if let Some(debug) = debug {
                self.persist_debug(debug, warehouse);
            }
            if stale {
                let reason = format!(
                    "{} failed after recording {} event(s)",
                    self.description,
                    self.events.len()
                );
                tracing::error!(message_id = %self.message_id, "{reason}; rebuilding state from the journal");
                return Stored::Restart(reason);
            }
            return Stored::Done;
        }

        let batch: Vec<ModelEvent<E>> = debug.into_iter().chain(self.events).collect();
        let records: Result<Vec<JournalRecord>, _> = batch.iter().map(JournalRecord::encode).collect();
        match records {
            Ok(records) => {
                settle(core, reception, response.as_ref());
                let reply = response.map(|response| PendingReply {
                    to: reply_to,
                    response,
                });
                warehouse.enqueue(records, reply);
                Stored::Persisting
            }
            Err(e) => {
                let reason = format!("cannot encode events of {}: {e}", self.description);
                tracing::error!(message_id = %self.message_id, "{reason}");
                if response.is_some() {
                    reply_to.send(core.response(
                        &self.message_id,
                        Outcome::Failure(Failure::new(FailureKind::EngineChoked, reason.clone())),
                    ));
                }
                Stored::Stop(reason)
            }
        }
    }

    fn persist_debug(&self, debug: ModelEvent<E>, warehouse: &Warehouse) {
        match JournalRecord::encode(&debug) {
            Ok(record) => warehouse.enqueue(vec![record], None),
            Err(e) => tracing::warn!(
                message_id = %self.message_id,
                error = %e,
                "dropping debug event that cannot be encoded"
            ),
        }
    }
}
