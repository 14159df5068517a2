//! Rebuilds an actor from its snapshot and journal.

use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::actor::{ActorEnv, Incarnation};
use crate::context::{ActorCore, apply_event};
use crate::event::{DomainEvent, EventPayload, ModelEvent};
use crate::journal::JournalRecord;
use crate::message::IncomingMessage;
use crate::model::ModelActor;
use crate::reception::{Reception, receive};
use crate::scheduler::Timers;
use crate::snapshot::ActorSnapshot;

/// Replay input, in the order the recovery room must see it.
#[derive(Debug, Clone)]
pub enum RecoveryMessage<E> {
    /// State saved earlier; replay continues after its sequence number.
    SnapshotOffer(ActorSnapshot),
    Event {
        sequence_nr: u64,
        event: ModelEvent<E>,
    },
    /// A domain event written by a different actor type under this id.
    Foreign {
        sequence_nr: u64,
        actor_type: String,
        manifest: String,
    },
    DeserializationFailure {
        sequence_nr: u64,
        manifest: String,
        error: String,
    },
    /// End of replay.
    Completed,
}

impl<E: DomainEvent> RecoveryMessage<E> {
    /// Turn a journal record into replay input for an actor of
    /// `actor_type`.
    pub fn decode(record: JournalRecord, actor_type: &str) -> Self {
        let sequence_nr = record.sequence_nr;
        let failure = |error: serde_json::Error| RecoveryMessage::DeserializationFailure {
            sequence_nr,
            manifest: record.manifest.clone(),
            error: error.to_string(),
        };

        let envelope: ModelEvent<serde_json::Value> = match serde_json::from_value(record.payload.clone()) {
            Ok(envelope) => envelope,
            Err(e) => return failure(e),
        };
        let payload = match envelope.payload.clone() {
            EventPayload::Domain(value) => {
                if envelope.actor_type != actor_type {
                    return RecoveryMessage::Foreign {
                        sequence_nr,
                        actor_type: envelope.actor_type,
                        manifest: record.manifest,
                    };
                }
                match serde_json::from_value::<E>(value) {
                    Ok(event) => EventPayload::Domain(event),
                    Err(e) => return failure(e),
                }
            }
            EventPayload::EngineVersionChanged { version } => EventPayload::EngineVersionChanged { version },
            EventPayload::Debug(debug) => EventPayload::Debug(debug),
        };
        RecoveryMessage::Event {
            sequence_nr,
            event: envelope.with_payload(payload),
        }
    }
}

/// Applies replay input to a recovering actor.
#[derive(Debug, Default)]
pub(crate) struct RecoveryRoom {
    replayed: u64,
    restored_from: Option<u64>,
}

impl RecoveryRoom {
    /// Sequence number of the snapshot the actor was restored from, if
    /// one was offered and accepted.
    pub(crate) fn restored_from(&self) -> Option<u64> {
        self.restored_from
    }

    pub(crate) fn recover<A: ModelActor>(
        &mut self,
        actor: &mut A,
        core: &mut ActorCore,
        reception: &mut Reception,
        timers: &Timers<A>,
        message: RecoveryMessage<A::Event>,
    ) {
        if reception.is_broken() && !matches!(message, RecoveryMessage::Completed) {
            return;
        }
        match message {
            RecoveryMessage::SnapshotOffer(mut snapshot) => {
                let sequence_nr = snapshot.sequence_nr;
                let state = std::mem::take(&mut snapshot.state);
                // restored into a blank actor so a rejected snapshot leaves nothing behind
                let mut restored = A::default();
                let outcome = catch_unwind(AssertUnwindSafe(|| restored.restore_snapshot(state)));
                let reason = match outcome {
                    Ok(Ok(())) => {
                        *actor = restored;
                        core.restore(&snapshot);
                        if core.tenant().is_some() {
                            reception.unlock();
                        }
                        self.restored_from = Some(sequence_nr);
                        tracing::debug!(actor_id = %core.id(), sequence_nr, "restored snapshot");
                        return;
                    }
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => "panicked".to_owned(),
                };
                tracing::warn!(
                    actor_id = %core.id(),
                    sequence_nr,
                    reason = %reason,
                    "snapshot rejected; replaying the full journal"
                );
            }
            RecoveryMessage::Event { sequence_nr, event } => {
                core.set_current_user(event.user.clone());
                if event.is_debug() {
                    return;
                }
                if let Some(domain) = event.domain()
                    && !A::CAPABILITIES.accepts_event(domain.kind())
                {
                    reception.report_invalid_recovery_event(
                        core,
                        sequence_nr,
                        &format!("{} is not an event of {}", domain.kind(), A::ACTOR_TYPE),
                    );
                    return;
                }
                let applied = catch_unwind(AssertUnwindSafe(|| apply_event(actor, core, &event)));
                match applied {
                    Ok(Ok(())) => {
                        self.replayed += 1;
                        if event.bootstrap_tenant().is_some() {
                            reception.unlock();
                        }
                    }
                    Ok(Err(e)) => reception.report_state_update_failure(core, sequence_nr, &e.to_string()),
                    Err(_) => reception.report_state_update_failure(core, sequence_nr, "panicked"),
                }
            }
            RecoveryMessage::Foreign {
                sequence_nr,
                actor_type,
                manifest,
            } => reception.report_invalid_recovery_event(
                core,
                sequence_nr,
                &format!("{manifest} was written by a {actor_type} actor"),
            ),
            RecoveryMessage::DeserializationFailure {
                sequence_nr,
                manifest,
                error,
            } => reception.report_deserialization_failure(core, sequence_nr, &manifest, &error),
            RecoveryMessage::Completed => {
                core.finish_recovery();
                core.reset_transaction_timestamp();
                reception.open();
                if !reception.is_broken() {
                    actor.recovery_completed(timers);
                }
                tracing::info!(
                    actor_id = %core.id(),
                    actor_type = A::ACTOR_TYPE,
                    replayed = self.replayed,
                    broken = reception.is_broken(),
                    "recovery completed"
                );
            }
        }
    }
}

/// Build a fresh incarnation of the actor from storage.
///
/// The snapshot, if any, is offered first; journal records after it
/// follow in order. Journal and snapshot problems never fail this call:
/// they leave the incarnation broken and it answers accordingly.
pub(crate) async fn recover<A: ModelActor>(env: &ActorEnv<A>, idle_generation: u64) -> Incarnation<A> {
    let mut inc = Incarnation::new(&env.id, env.config.debug_mode, idle_generation);

    let mut from = 1;
    if let Some(store) = &env.snapshots {
        match store.load(A::ACTOR_TYPE, &env.id) {
            Ok(Some(snapshot)) => {
                let sequence_nr = snapshot.sequence_nr;
                receive(&mut inc, env, IncomingMessage::Recovery(RecoveryMessage::SnapshotOffer(snapshot)));
                if inc.recovery.restored_from() == Some(sequence_nr) {
                    from = sequence_nr + 1;
                    inc.last_snapshot = sequence_nr;
                    env.warehouse.recovered_up_to(sequence_nr);
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(actor_id = %env.id, error = %e, "cannot load snapshot; replaying full journal")
            }
        }
    }

    match env.journal.read(&env.id, from).await {
        Ok(records) => {
            for record in records {
                env.warehouse.recovered_up_to(record.sequence_nr);
                let message = RecoveryMessage::decode(record, A::ACTOR_TYPE);
                receive(&mut inc, env, IncomingMessage::Recovery(message));
            }
        }
        Err(e) => inc.reception.report_journal_failure(&inc.core, &e.to_string()),
    }

    receive(&mut inc, env, IncomingMessage::Recovery(RecoveryMessage::Completed));
    inc
}
