//! Executes admitted messages against the actor and settles the outcome.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use crate::actor::{ActorEnv, Control, Directive};
use crate::context::{ActorContext, ActorCore};
use crate::error::CommandError;
use crate::message::{CommandMessage, Failure, FailureKind, ModelResponse, Outcome, ReplyTo};
use crate::model::{ModelActor, ModelCommand};
use crate::reception::Reception;
use crate::scheduler::{JobHandle, Timers};
use crate::staging::{StagingArea, Stored};

type FailureListener<A> = Box<
    dyn for<'x> FnOnce(&mut A, &mut ActorContext<'x, A>, Failure) -> Result<(), CommandError> + Send,
>;
type ResponseListener<A> = Box<
    dyn for<'x> FnOnce(&mut A, &mut ActorContext<'x, A>, ModelResponse) -> Result<(), CommandError>
        + Send,
>;

/// Callbacks waiting for the response to one outgoing command.
pub(crate) struct Responder<A: ModelActor> {
    description: String,
    on_failure: FailureListener<A>,
    on_success: ResponseListener<A>,
}

impl<A: ModelActor> Responder<A> {
    pub(crate) fn new(
        description: String,
        on_failure: FailureListener<A>,
        on_success: ResponseListener<A>,
    ) -> Self {
        Self {
            description,
            on_failure,
            on_success,
        }
    }

    fn handle(
        self,
        actor: &mut A,
        ctx: &mut ActorContext<'_, A>,
        response: ModelResponse,
    ) -> Result<(), CommandError> {
        match response.failure().cloned() {
            Some(failure) => (self.on_failure)(actor, ctx, failure),
            None => (self.on_success)(actor, ctx, response),
        }
    }
}

/// Outstanding asks, keyed by the message id of the outgoing command.
pub(crate) type Responders<A> = HashMap<String, Responder<A>>;

/// An admitted live message.
pub(crate) enum Work<A: ModelActor> {
    Command(CommandMessage<A::Command>),
    Response(ModelResponse),
}

/// Runs one message at a time against the actor.
pub(crate) struct BackOffice<A: ModelActor> {
    responders: Responders<A>,
    idle_timer: Option<JobHandle>,
    idle_generation: u64,
}

impl<A: ModelActor> BackOffice<A> {
    /// `idle_generation` continues the count of a previous incarnation so
    /// its stale idle notices are never mistaken for current ones.
    pub(crate) fn new(idle_generation: u64) -> Self {
        Self {
            responders: HashMap::new(),
            idle_timer: None,
            idle_generation,
        }
    }

    pub(crate) fn idle_generation(&self) -> u64 {
        self.idle_generation
    }

    pub(crate) fn is_current_idle(&self, generation: u64) -> bool {
        self.idle_timer.is_some() && generation == self.idle_generation
    }

    pub(crate) fn pending_responses(&self) -> usize {
        self.responders.len()
    }

    pub(crate) fn arm_idle_timer(&mut self, timers: &Timers<A>, period: Duration) {
        self.cancel_idle_timer();
        self.idle_generation += 1;
        let generation = self.idle_generation;
        self.idle_timer = Some(timers.schedule_control(period, Control::Idle { generation }));
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.cancel();
        }
    }

    /// Execute one admitted message and settle its outcome.
    pub(crate) fn perform(
        &mut self,
        actor: &mut A,
        core: &mut ActorCore,
        reception: &mut Reception,
        env: &ActorEnv<A>,
        work: Work<A>,
    ) -> Directive {
        self.cancel_idle_timer();
        let directive = self.execute(actor, core, reception, env, work);
        if matches!(directive, Directive::Continue) && actor.has_auto_shutdown() {
            self.arm_idle_timer(&env.timers, env.config.idle_period);
        }
        directive
    }

    fn execute(
        &mut self,
        actor: &mut A,
        core: &mut ActorCore,
        reception: &mut Reception,
        env: &ActorEnv<A>,
        work: Work<A>,
    ) -> Directive {
        let (message_id, description, reply_to, job) = match work {
            Work::Command(message) => {
                let CommandMessage {
                    message_id,
                    user,
                    command,
                    reply_to,
                } = message;
                core.set_current_user(user);
                let description = format!("command {}", command.kind());
                (message_id, description, reply_to, Job::Command(command))
            }
            Work::Response(response) => {
                let Some(responder) = self.responders.remove(&response.message_id) else {
                    tracing::warn!(
                        message_id = %response.message_id,
                        "received a response nobody is waiting for; dropping it"
                    );
                    return Directive::Continue;
                };
                let description = format!("response from {}", responder.description);
                (
                    response.message_id.clone(),
                    description,
                    ReplyTo::Nobody,
                    Job::Response(responder, response),
                )
            }
        };

        let mut staging = StagingArea::open(A::ACTOR_TYPE, message_id, description);
        {
            let mut ctx = ActorContext::new(core, &mut staging, &mut self.responders, env);
            match ctx.check_engine_version(actor) {
                Ok(()) => job.run(actor, &mut ctx),
                Err(e) => report(&mut ctx, failure_for(e)),
            }
            if !ctx.has_failure() && ctx.has_stateful_events() {
                let committed = guarded(|| actor.on_commit(&mut ctx));
                if let Err(failure) = committed {
                    report(&mut ctx, failure);
                }
            }
        }

        match staging.store(core, reception, reply_to, &env.warehouse) {
            Stored::Done | Stored::Persisting => Directive::Continue,
            Stored::Restart(reason) => Directive::Restart(reason),
            Stored::Stop(reason) => Directive::Stop(reason),
        }
    }
}

enum Job<A: ModelActor> {
    Command(A::Command),
    Response(Responder<A>, ModelResponse),
}

impl<A: ModelActor> Job<A> {
    fn run(self, actor: &mut A, ctx: &mut ActorContext<'_, A>) {
        match self {
            Job::Command(command) => {
                ctx.add_debug_info(|| format!("handling {command:?}"));
                let result = guarded(|| {
                    actor.validate_command(&command, ctx)?;
                    actor.process_command(command, ctx)
                })
                .and_then(|reply| {
                    serde_json::to_value(reply).map_err(|e| {
                        Failure::new(FailureKind::ActorChoked, format!("cannot serialize reply: {e}"))
                    })
                });
                match result {
                    Ok(value) => ctx.set_outcome(Outcome::Success(value)),
                    Err(failure) => report(ctx, failure),
                }
            }
            Job::Response(responder, response) => {
                if let Err(failure) = guarded(|| responder.handle(actor, ctx, response)) {
                    report(ctx, failure);
                }
            }
        }
    }
}

/// Run domain code, turning declared errors and panics into failures.
fn guarded<T>(f: impl FnOnce() -> Result<T, CommandError>) -> Result<T, Failure> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(failure_for(err)),
        Err(panic) => Err(Failure::new(FailureKind::ActorChoked, panic_message(&*panic))),
    }
}

fn failure_for(err: CommandError) -> Failure {
    match err {
        CommandError::Unauthorized(msg) => Failure::new(FailureKind::SecurityFailure, msg),
        CommandError::Invalid(msg) => Failure::new(FailureKind::InvalidCommand, msg),
        CommandError::Failed(msg) => Failure::new(FailureKind::CommandFailed, msg),
        CommandError::Malfunction(msg) => Failure::new(FailureKind::ActorChoked, msg),
    }
}

fn report<A: ModelActor>(ctx: &mut ActorContext<'_, A>, failure: Failure) {
    if failure.kind == FailureKind::ActorChoked {
        tracing::error!(actor_id = %ctx.actor_id(), error = %failure.message, "engine malfunction while handling message");
    } else {
        tracing::debug!(actor_id = %ctx.actor_id(), error = %failure, "message failed");
    }
    ctx.add_debug_error(&failure.to_string());
    ctx.set_outcome(Outcome::Failure(failure));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        format!("panic: {text}")
    } else if let Some(text) = payload.downcast_ref::<String>() {
        format!("panic: {text}")
    } else {
        "panic with a non-string payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_errors_map_to_failure_kinds() {
        let cases = [
            (CommandError::Unauthorized("u".into()), FailureKind::SecurityFailure),
            (CommandError::Invalid("i".into()), FailureKind::InvalidCommand),
            (CommandError::Failed("f".into()), FailureKind::CommandFailed),
            (CommandError::Malfunction("m".into()), FailureKind::ActorChoked),
        ];
        for (err, kind) in cases {
            assert_eq!(failure_for(err).kind, kind);
        }
    }

    #[test]
    fn guarded_catches_panics() {
        let result: Result<(), Failure> = guarded(|| panic!("kaboom"));
        let failure = result.expect_err("panic should be caught");
        assert_eq!(failure.kind, FailureKind::ActorChoked);
        assert_eq!(failure.message, "panic: kaboom");
    }

    #[test]
    fn guarded_passes_values_through() {
        let result = guarded(|| Ok::<_, CommandError>(7));
        assert_eq!(result.expect("ok"), 7);
    }

    #[test]
    fn formatted_panic_payload_is_kept() {
        let result: Result<(), Failure> = guarded(|| panic!("bad index {}", 3));
        assert_eq!(result.expect_err("caught").message, "panic: bad index 3");
    }
}
