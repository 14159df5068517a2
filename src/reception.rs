//! Admission gate in front of every actor.
//!
//! Tracks whether the actor has been bootstrapped, whether its recovery
//! broke, and whether replay has finished. Live commands are only handed
//! to the back office once they pass these checks; recovery input goes to
//! the recovery room.

use crate::actor::{ActorEnv, Directive, Incarnation};
use crate::back_office::Work;
use crate::context::{ActorCore, settle};
use crate::error::AskError;
use crate::message::{CommandMessage, Failure, FailureKind, IncomingMessage, Outcome};
use crate::model::{Capabilities, ModelActor, ModelCommand};

/// Decision about one live command.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    Pass,
    /// Answer with the failure and keep running.
    Refuse(Failure),
    /// Answer with the failure and evict the actor so the next message
    /// triggers a fresh recovery.
    Evict(Failure),
}

#[derive(Debug)]
pub(crate) struct Reception {
    bootstrap_pending: bool,
    broken: Option<String>,
    open: bool,
}

impl Reception {
    pub(crate) fn new() -> Self {
        Self {
            bootstrap_pending: true,
            broken: None,
            open: false,
        }
    }

    /// Lift the bootstrap lock for good.
    pub(crate) fn unlock(&mut self) {
        self.bootstrap_pending = false;
    }

    pub(crate) fn open(&mut self) {
        self.open = true;
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open
    }

    pub(crate) fn is_bootstrapped(&self) -> bool {
        !self.bootstrap_pending
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.broken.is_some()
    }

    /// Why the actor's state may not be looked at, if it may not.
    pub(crate) fn inspection_refusal(&self) -> Option<AskError> {
        if self.broken.is_some() {
            Some(AskError::Unrecoverable)
        } else if self.bootstrap_pending {
            Some(AskError::DoesNotExist)
        } else {
            None
        }
    }

    pub(crate) fn report_invalid_recovery_event(&mut self, core: &ActorCore, sequence_nr: u64, detail: &str) {
        self.mark_broken(core, format!("event #{sequence_nr} does not belong to this actor: {detail}"));
    }

    pub(crate) fn report_state_update_failure(&mut self, core: &ActorCore, sequence_nr: u64, detail: &str) {
        self.mark_broken(core, format!("replaying event #{sequence_nr} failed: {detail}"));
    }

    pub(crate) fn report_deserialization_failure(
        &mut self,
        core: &ActorCore,
        sequence_nr: u64,
        manifest: &str,
        detail: &str,
    ) {
        self.mark_broken(core, format!("cannot decode {manifest} event #{sequence_nr}: {detail}"));
    }

    pub(crate) fn report_journal_failure(&mut self, core: &ActorCore, detail: &str) {
        self.mark_broken(core, format!("cannot read journal: {detail}"));
    }

    fn mark_broken(&mut self, core: &ActorCore, reason: String) {
        tracing::error!(actor_id = %core.id(), reason = %reason, "actor recovery is broken");
        if self.broken.is_none() {
            self.broken = Some(reason);
        }
    }

    /// Decide whether a live command may be processed.
    pub(crate) fn admit<C: ModelCommand>(
        &self,
        command: &C,
        core: &ActorCore,
        capabilities: &Capabilities,
    ) -> Admission {
        let bootstrap = command.bootstrap_tenant().is_some();
        if self.broken.is_some() {
            let failure = if bootstrap {
                Failure::new(
                    FailureKind::ActorExists,
                    format!("actor {} already exists", core.id()),
                )
            } else {
                Failure::new(
                    FailureKind::Unrecoverable,
                    format!("actor {} could not be recovered, check the logs", core.id()),
                )
            };
            return Admission::Evict(failure);
        }

        match (bootstrap, self.bootstrap_pending) {
            (false, true) => {
                return Admission::Refuse(Failure::new(
                    FailureKind::ActorDoesNotExist,
                    format!("actor {} does not exist yet", core.id()),
                ));
            }
            (true, false) => {
                return Admission::Refuse(Failure::new(
                    FailureKind::ActorExists,
                    format!("actor {} already exists", core.id()),
                ));
            }
            _ => {}
        }

        let kind = command.kind();
        if !capabilities.accepts_command(kind) {
            return Admission::Refuse(Failure::new(
                FailureKind::InvalidCommand,
                format!("command {kind} is not supported by this actor"),
            ));
        }
        Admission::Pass
    }
}

/// Route one incoming message through the gate.
pub(crate) fn receive<A: ModelActor>(
    inc: &mut Incarnation<A>,
    env: &ActorEnv<A>,
    message: IncomingMessage<A>,
) -> Directive {
    match message {
        IncomingMessage::Recovery(message) => {
            if inc.reception.is_open() {
                tracing::warn!(actor_id = %inc.core.id(), "recovery input after recovery completed; ignoring");
                return Directive::Continue;
            }
            inc.recovery
                .recover(&mut inc.actor, &mut inc.core, &mut inc.reception, &env.timers, message);
            Directive::Continue
        }
        IncomingMessage::Response(response) => inc.back_office.perform(
            &mut inc.actor,
            &mut inc.core,
            &mut inc.reception,
            env,
            Work::Response(response),
        ),
        IncomingMessage::Command(message) => {
            match inc.reception.admit(&message.command, &inc.core, &A::CAPABILITIES) {
                Admission::Pass => inc.back_office.perform(
                    &mut inc.actor,
                    &mut inc.core,
                    &mut inc.reception,
                    env,
                    Work::Command(message),
                ),
                Admission::Refuse(failure) => {
                    refuse(inc, message, failure);
                    Directive::Continue
                }
                Admission::Evict(failure) => {
                    refuse(inc, message, failure);
                    Directive::Sleep("recovery is broken".to_owned())
                }
            }
        }
    }
}

fn refuse<A: ModelActor>(inc: &mut Incarnation<A>, message: CommandMessage<A::Command>, failure: Failure) {
    tracing::debug!(
        actor_id = %inc.core.id(),
        command = message.command.kind(),
        error = %failure,
        "command refused"
    );
    let response = inc.core.response(&message.message_id, Outcome::Failure(failure));
    settle(&mut inc.core, &mut inc.reception, Some(&response));
    message.reply_to.send(response);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_fixtures::{Ledger, LedgerCommand};

    fn core() -> ActorCore {
        let mut core = ActorCore::new("l-1", false);
        core.finish_recovery();
        core
    }

    fn open() -> LedgerCommand {
        LedgerCommand::Open {
            tenant: "acme".into(),
        }
    }

    fn add() -> LedgerCommand {
        LedgerCommand::Add { name: "a".into() }
    }

    fn refused_kind(admission: Admission) -> Option<FailureKind> {
        match admission {
            Admission::Refuse(f) | Admission::Evict(f) => Some(f.kind),
            Admission::Pass => None,
        }
    }

    #[test]
    fn pending_actor_only_admits_bootstrap() {
        let reception = Reception::new();
        let caps = Ledger::CAPABILITIES;
        assert_eq!(reception.admit(&open(), &core(), &caps), Admission::Pass);
        assert_eq!(
            refused_kind(reception.admit(&add(), &core(), &caps)),
            Some(FailureKind::ActorDoesNotExist)
        );
    }

    #[test]
    fn bootstrapped_actor_refuses_second_bootstrap() {
        let mut reception = Reception::new();
        reception.unlock();
        let caps = Ledger::CAPABILITIES;
        assert_eq!(
            refused_kind(reception.admit(&open(), &core(), &caps)),
            Some(FailureKind::ActorExists)
        );
        assert_eq!(reception.admit(&add(), &core(), &caps), Admission::Pass);
    }

    #[test]
    fn unsupported_commands_are_invalid() {
        let mut reception = Reception::new();
        reception.unlock();
        assert_eq!(
            refused_kind(reception.admit(&LedgerCommand::Unlisted, &core(), &Ledger::CAPABILITIES)),
            Some(FailureKind::InvalidCommand)
        );
    }

    #[test]
    fn broken_actor_evicts_with_exists_or_unrecoverable() {
        let mut reception = Reception::new();
        let core = core();
        reception.report_deserialization_failure(&core, 3, "Opened", "bad json");
        assert!(reception.is_broken());

        let caps = Ledger::CAPABILITIES;
        assert!(matches!(
            reception.admit(&open(), &core, &caps),
            Admission::Evict(Failure { kind: FailureKind::ActorExists, .. })
        ));
        assert!(matches!(
            reception.admit(&add(), &core, &caps),
            Admission::Evict(Failure { kind: FailureKind::Unrecoverable, .. })
        ));
    }

    #[test]
    fn first_broken_reason_wins() {
        let mut reception = Reception::new();
        let core = core();
        reception.report_journal_failure(&core, "disk gone");
        reception.report_state_update_failure(&core, 2, "later");
        assert_eq!(reception.broken.as_deref(), Some("cannot read journal: disk gone"));
    }
}
