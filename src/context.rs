//! Identity of a running actor and the context handed to domain code.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::actor::ActorEnv;
use crate::back_office::{Responder, Responders};
use crate::callstack::{CascadeHost, TransitionCallStack, push_event};
use crate::error::{CommandError, StateUpdateError};
use crate::event::{DomainEvent, EngineVersion, EventPayload, ModelEvent};
use crate::message::{CommandEnvelope, Failure, ModelResponse, Outcome, UserIdentity};
use crate::model::ModelActor;
use crate::reception::Reception;
use crate::scheduler::Timers;
use crate::snapshot::ActorSnapshot;
use crate::staging::StagingArea;

/// Engine-side attributes of one actor instance.
#[derive(Debug, Clone)]
pub struct ActorCore {
    id: String,
    tenant: Option<String>,
    engine_version: Option<EngineVersion>,
    last_modified: Option<DateTime<Utc>>,
    transaction_timestamp: Option<DateTime<Utc>>,
    current_user: UserIdentity,
    debug_mode: bool,
    recovering: bool,
}

impl ActorCore {
    pub(crate) fn new(id: &str, debug_mode: bool) -> Self {
        Self {
            id: id.to_owned(),
            tenant: None,
            engine_version: None,
            last_modified: None,
            transaction_timestamp: None,
            current_user: UserIdentity::system(),
            debug_mode,
            recovering: true,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    /// Engine build recorded in the actor's history.
    pub fn engine_version(&self) -> Option<&EngineVersion> {
        self.engine_version.as_ref()
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    /// User of the message being handled, or of the event being replayed.
    pub fn current_user(&self) -> &UserIdentity {
        &self.current_user
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    pub(crate) fn set_tenant(&mut self, tenant: &str) {
        if let Some(current) = &self.tenant
            && current != tenant
        {
            tracing::warn!(actor_id = %self.id, current = %current, tenant, "tenant reassigned");
        }
        self.tenant = Some(tenant.to_owned());
    }

    pub(crate) fn set_current_user(&mut self, user: UserIdentity) {
        self.current_user = user;
    }

    /// Pinned on first use and shared by every event of the message.
    pub(crate) fn transaction_timestamp(&mut self) -> DateTime<Utc> {
        *self.transaction_timestamp.get_or_insert_with(Utc::now)
    }

    pub(crate) fn reset_transaction_timestamp(&mut self) {
        self.transaction_timestamp = None;
    }

    pub(crate) fn finish_recovery(&mut self) {
        self.recovering = false;
    }

    pub(crate) fn restore(&mut self, snapshot: &ActorSnapshot) {
        self.tenant.clone_from(&snapshot.tenant);
        self.engine_version.clone_from(&snapshot.engine_version);
        self.last_modified = snapshot.last_modified;
    }

    pub(crate) fn snapshot(&self, sequence_nr: u64, state: serde_json::Value) -> ActorSnapshot {
        ActorSnapshot {
            sequence_nr,
            tenant: self.tenant.clone(),
            engine_version: self.engine_version.clone(),
            last_modified: self.last_modified,
            state,
        }
    }

    pub(crate) fn response(&self, message_id: &str, outcome: Outcome) -> ModelResponse {
        ModelResponse {
            message_id: message_id.to_owned(),
            actor_id: self.id.clone(),
            last_modified: self.last_modified,
            outcome,
        }
    }
}

/// Fold an event into actor and engine state. Shared by replay and live
/// handling.
pub(crate) fn apply_event<A: ModelActor>(
    actor: &mut A,
    core: &mut ActorCore,
    event: &ModelEvent<A::Event>,
) -> Result<(), StateUpdateError> {
    match &event.payload {
        EventPayload::Debug(_) => return Ok(()),
        EventPayload::EngineVersionChanged { version } => {
            core.engine_version = Some(version.clone());
        }
        EventPayload::Domain(domain) => {
            if let Some(tenant) = domain.bootstrap_tenant() {
                core.set_tenant(tenant);
            }
            if let Some(version) = &event.engine_version {
                core.engine_version = Some(version.clone());
            }
            actor.update_state(event)?;
        }
    }
    core.last_modified = Some(event.timestamp);
    Ok(())
}

/// Bookkeeping done whenever a message is answered: the transaction
/// timestamp is released and, unless the message failed, a pending
/// bootstrap lock is lifted.
pub(crate) fn settle(core: &mut ActorCore, reception: &mut Reception, response: Option<&ModelResponse>) {
    core.reset_transaction_timestamp();
    if !response.is_some_and(ModelResponse::is_failure) {
        reception.unlock();
    }
}

/// What domain code may do while handling one message.
///
/// Lives for exactly one message. Events added here are applied to the
/// actor at once and persisted together once handling has finished.
pub struct ActorContext<'c, A: ModelActor> {
    core: &'c mut ActorCore,
    staging: &'c mut StagingArea<A::Event>,
    responders: &'c mut Responders<A>,
    env: &'c ActorEnv<A>,
    call_stack: TransitionCallStack<ModelEvent<A::Event>>,
}

impl<'c, A: ModelActor> ActorContext<'c, A> {
    pub(crate) fn new(
        core: &'c mut ActorCore,
        staging: &'c mut StagingArea<A::Event>,
        responders: &'c mut Responders<A>,
        env: &'c ActorEnv<A>,
    ) -> Self {
        Self {
            core,
            staging,
            responders,
            env,
            call_stack: TransitionCallStack::new(env.config.unwind_order),
        }
    }

    pub fn actor_id(&self) -> &str {
        self.core.id()
    }

    pub fn tenant(&self) -> Option<&str> {
        self.core.tenant()
    }

    pub fn user(&self) -> &UserIdentity {
        self.core.current_user()
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.core.last_modified()
    }

    pub fn engine_version(&self) -> Option<&EngineVersion> {
        self.core.engine_version()
    }

    /// Timestamp stamped on every event of the current message.
    pub fn transaction_timestamp(&mut self) -> DateTime<Utc> {
        self.core.transaction_timestamp()
    }

    /// Depth of the behavior cascade currently running; 0 outside of
    /// behaviors.
    pub fn cascade_depth(&self) -> usize {
        self.call_stack.depth()
    }

    pub fn has_stateful_events(&self) -> bool {
        self.staging.has_stateful_events()
    }

    pub fn timers(&self) -> &Timers<A> {
        &self.env.timers
    }

    /// Record a new event.
    ///
    /// The event is staged for persistence and applied to `actor` before
    /// this returns. If it has behavior, the immediate part runs now and
    /// the delayed part once the outermost cascade unwinds.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Malfunction`] if the state update fails, or
    /// whatever error a triggered behavior returns.
    pub fn add_event(&mut self, actor: &mut A, event: A::Event) -> Result<(), CommandError> {
        let event = self.envelope(EventPayload::Domain(event));
        self.record(actor, event)
    }

    pub(crate) fn record(
        &mut self,
        actor: &mut A,
        event: ModelEvent<A::Event>,
    ) -> Result<(), CommandError> {
        let kind = event.kind();
        self.add_debug_info(|| format!("updating actor state for new event {kind}"));
        self.staging.add(event.clone());
        apply_event(actor, self.core, &event)?;
        push_event(&mut Cascade { actor, ctx: self }, event)
    }

    /// Stage an `EngineVersionChanged` event if the recorded engine
    /// version differs from the running one.
    pub(crate) fn check_engine_version(&mut self, actor: &mut A) -> Result<(), CommandError> {
        let env = self.env;
        let running = &env.config.engine_version;
        let Some(recorded) = self.core.engine_version() else {
            return Ok(());
        };
        if !recorded.differs(running) {
            return Ok(());
        }
        let version = running.clone();
        tracing::info!(actor_id = %self.core.id(), from = %recorded, to = %version, "engine version changed");
        let event = self.envelope(EventPayload::EngineVersionChanged { version });
        self.record(actor, event)
    }

    fn envelope(&mut self, payload: EventPayload<A::Event>) -> ModelEvent<A::Event> {
        let bootstrap = match &payload {
            EventPayload::Domain(event) => event.bootstrap_tenant().map(str::to_owned),
            _ => None,
        };
        ModelEvent {
            actor_id: self.core.id().to_owned(),
            actor_type: A::ACTOR_TYPE.to_owned(),
            tenant: bootstrap
                .clone()
                .or_else(|| self.core.tenant().map(str::to_owned)),
            timestamp: self.core.transaction_timestamp(),
            user: self.core.current_user().clone(),
            engine_version: bootstrap
                .is_some()
                .then(|| self.env.config.engine_version.clone()),
            payload,
        }
    }

    /// Send `command` to another actor and handle its response later.
    ///
    /// The command is handed to the gateway right away. When the response
    /// arrives it is processed as a message of its own: `on_success` or
    /// `on_failure` runs with a fresh context, and any events it adds are
    /// persisted like those of a command. A response that arrives after
    /// this actor restarted finds no listener and is dropped.
    ///
    /// # Returns
    ///
    /// The message id of the outgoing command.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Malfunction`] if `command` cannot be
    /// serialized.
    pub fn ask_model<C, F, S>(
        &mut self,
        actor_type: &str,
        actor_id: &str,
        command: &C,
        on_failure: F,
        on_success: S,
    ) -> Result<String, CommandError>
    where
        C: Serialize,
        F: for<'x> FnOnce(&mut A, &mut ActorContext<'x, A>, Failure) -> Result<(), CommandError>
            + Send
            + 'static,
        S: for<'x> FnOnce(&mut A, &mut ActorContext<'x, A>, ModelResponse) -> Result<(), CommandError>
            + Send
            + 'static,
    {
        let payload = serde_json::to_value(command)
            .map_err(|e| CommandError::Malfunction(format!("cannot serialize command: {e}")))?;
        let envelope = CommandEnvelope::new(actor_type, actor_id, self.core.current_user().clone(), payload);
        let message_id = envelope.message_id.clone();
        let description = format!("{actor_type}/{actor_id}");
        self.add_debug_info(|| format!("asking {description} (message {message_id})"));
        self.responders.insert(
            message_id.clone(),
            Responder::new(description, Box::new(on_failure), Box::new(on_success)),
        );
        let reply_to = self.env.gateway.reply_to::<A>(self.core.id());
        self.env.gateway.inform(envelope, reply_to);
        Ok(message_id)
    }

    /// Add a line to the message's debug event.
    ///
    /// `info` only runs if debug mode is on or debug logging is enabled.
    pub fn add_debug_info<S, F>(&mut self, info: F)
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        if !self.debug_wanted() {
            return;
        }
        let text = info().into();
        tracing::debug!(actor_id = %self.core.id(), "{text}");
        self.staging.debug_event().add_text(text);
    }

    pub fn add_debug_json<F>(&mut self, label: &str, value: F)
    where
        F: FnOnce() -> serde_json::Value,
    {
        if !self.debug_wanted() {
            return;
        }
        let value = value();
        tracing::debug!(actor_id = %self.core.id(), label, %value, "debug value");
        self.staging.debug_event().add_json(label, value);
    }

    pub(crate) fn add_debug_error(&mut self, error: &str) {
        self.staging.debug_event().add_error(error);
    }

    pub(crate) fn set_outcome(&mut self, outcome: Outcome) {
        self.staging.set_outcome(outcome);
    }

    pub(crate) fn has_failure(&self) -> bool {
        self.staging.has_failure()
    }

    fn debug_wanted(&self) -> bool {
        self.core.debug_mode() || tracing::enabled!(tracing::Level::DEBUG)
    }
}

/// Binds an actor to its context so the call stack can run behaviors.
struct Cascade<'x, 'c, A: ModelActor> {
    actor: &'x mut A,
    ctx: &'x mut ActorContext<'c, A>,
}

impl<A: ModelActor> CascadeHost<ModelEvent<A::Event>> for Cascade<'_, '_, A> {
    type Error = CommandError;

    fn call_stack(&mut self) -> &mut TransitionCallStack<ModelEvent<A::Event>> {
        &mut self.ctx.call_stack
    }

    fn has_behavior(&self, event: &ModelEvent<A::Event>) -> bool {
        event.domain().is_some_and(|e| self.actor.has_behavior(e))
    }

    fn immediate(&mut self, event: &ModelEvent<A::Event>) -> Result<(), CommandError> {
        self.actor.immediate_behavior(event, self.ctx)
    }

    fn delayed(&mut self, event: &ModelEvent<A::Event>) -> Result<(), CommandError> {
        self.actor.delayed_behavior(event, self.ctx)
    }
}
