//! Top-level entry point: creates actors on demand, caches their handles,
//! and routes commands between them.
//!
//! The system is built via [`ActorSystemBuilder`], which fixes the journal,
//! the optional snapshot store, the engine configuration, and the actor
//! types that can be addressed by name through the [`Gateway`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::actor::{ActorRef, Control, Mail, decode_reply, inspector, spawn_actor};
use crate::callstack::UnwindOrder;
use crate::config::EngineConfig;
use crate::context::ActorCore;
use crate::error::{AskError, ExecuteError};
use crate::event::EngineVersion;
use crate::health::HealthMonitor;
use crate::journal::{FileJournal, InMemoryJournal, Journal};
use crate::message::{
    CommandEnvelope, CommandMessage, Failure, FailureKind, IncomingMessage, ModelResponse, ReplyTo,
    ResponseSink, UserIdentity,
};
use crate::model::ModelActor;
use crate::snapshot::{FileSnapshotStore, SnapshotStore};
use crate::storage::StreamLayout;

/// Resources every actor of a system shares.
pub(crate) struct SystemShared {
    pub config: Arc<EngineConfig>,
    pub journal: Arc<dyn Journal>,
    pub snapshots: Option<Arc<dyn SnapshotStore>>,
    pub health: HealthMonitor,
}

/// A cached actor: its typed handle, erased, and the task running it.
struct CachedActor {
    handle: Box<dyn Any + Send + Sync>,
    task: JoinHandle<()>,
}

/// Type-erased handle cache keyed by `(TypeId, actor_id)`.
type HandleCache = HashMap<(TypeId, String), CachedActor>;

/// Type-erased dispatcher map keyed by actor type name.
type DispatcherMap = HashMap<&'static str, Box<dyn ActorDispatcher>>;

pub(crate) struct SystemInner {
    shared: SystemShared,
    cache: RwLock<HandleCache>,
    dispatchers: DispatcherMap,
}

/// Registry that owns the lifecycle of every model actor.
///
/// Actors are created on first use and recovered from the journal. An
/// evicted actor is transparently recovered again by the next call that
/// addresses it.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct ActorSystem {
    inner: Arc<SystemInner>,
}

// Manual `Debug` because `dyn Any` is not `Debug` and we don't want to
// expose cache internals.
impl std::fmt::Debug for ActorSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.inner.dispatchers.keys().collect();
        types.sort();
        f.debug_struct("ActorSystem")
            .field("actor_types", &types)
            .field("config", &self.inner.shared.config)
            .finish()
    }
}

impl ActorSystem {
    pub fn builder() -> ActorSystemBuilder {
        ActorSystemBuilder::new()
    }

    /// Get a handle to an actor, spawning and recovering it if needed.
    ///
    /// If a live handle is cached it is returned as is. Otherwise a new
    /// incarnation is spawned; it waits for any previous incarnation of the
    /// same actor to finish before it reads the journal.
    ///
    /// # Arguments
    ///
    /// * `id` - Unique instance identifier within the actor type.
    ///
    /// # Returns
    ///
    /// An [`ActorRef`] for sending commands and reading state.
    pub async fn get<A: ModelActor>(&self, id: &str) -> ActorRef<A> {
        let key = (TypeId::of::<A>(), id.to_owned());

        // Fast path: check cache with read lock.
        {
            let cache = self.inner.cache.read().await;
            if let Some(cached) = cache.get(&key)
                && let Some(handle) = cached.handle.downcast_ref::<ActorRef<A>>()
                && handle.is_alive()
            {
                return handle.clone();
            }
        }

        // Slow path: re-check under the write lock, then replace the stale
        // entry.
        let mut cache = self.inner.cache.write().await;
        let previous = match cache.remove(&key) {
            Some(cached) => {
                if let Some(handle) = cached.handle.downcast_ref::<ActorRef<A>>()
                    && handle.is_alive()
                {
                    let handle = handle.clone();
                    cache.insert(key, cached);
                    return handle;
                }
                Some(cached.task)
            }
            None => None,
        };

        tracing::debug!(actor_type = A::ACTOR_TYPE, actor_id = %id, "spawning actor");
        let (handle, task) = spawn_actor::<A>(id, &self.inner.shared, self.gateway(), previous);
        cache.insert(
            key,
            CachedActor {
                handle: Box::new(handle.clone()),
                task,
            },
        );
        handle
    }

    /// Put `mail` into an actor's mailbox, reviving the actor if it went to
    /// sleep in the meantime. Hands the mail back if it cannot be placed.
    pub(crate) async fn deliver<A: ModelActor>(&self, id: &str, mail: Mail<A>) -> Result<(), Mail<A>> {
        let handle = self.get::<A>(id).await;
        match handle.send(mail).await {
            Ok(()) => Ok(()),
            // The actor closed its mailbox after we looked it up.
            Err(mpsc::error::SendError(mail)) => {
                let handle = self.get::<A>(id).await;
                handle
                    .send(mail)
                    .await
                    .map_err(|mpsc::error::SendError(mail)| mail)
            }
        }
    }

    /// Send a command to an actor and wait for its response.
    ///
    /// # Errors
    ///
    /// Returns [`AskError::ActorGone`] if the actor stopped before it
    /// answered.
    pub async fn ask<A: ModelActor>(
        &self,
        id: &str,
        command: A::Command,
        user: UserIdentity,
    ) -> Result<ModelResponse, AskError> {
        let (tx, rx) = oneshot::channel();
        let message = CommandMessage::new(command, user, ReplyTo::Caller(tx));
        self.deliver::<A>(id, Mail::Incoming(IncomingMessage::Command(message)))
            .await
            .map_err(|_| AskError::ActorGone)?;
        rx.await.map_err(|_| AskError::ActorGone)
    }

    /// Send a command to an actor and decode its success payload.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Rejected`] - the actor answered with a failure.
    /// * [`ExecuteError::Decode`] - the payload is not an `A::Reply`.
    /// * [`ExecuteError::ActorGone`] - the actor stopped before it answered.
    pub async fn execute<A: ModelActor>(
        &self,
        id: &str,
        command: A::Command,
        user: UserIdentity,
    ) -> Result<A::Reply, ExecuteError> {
        let response = self.ask::<A>(id, command, user).await?;
        decode_reply::<A>(response)
    }

    /// Send a command to an actor without waiting for the response.
    ///
    /// # Errors
    ///
    /// Returns [`AskError::ActorGone`] if the command could not be queued.
    pub async fn tell<A: ModelActor>(
        &self,
        id: &str,
        command: A::Command,
        user: UserIdentity,
    ) -> Result<(), AskError> {
        let message = CommandMessage::new(command, user, ReplyTo::Nobody);
        self.deliver::<A>(id, Mail::Incoming(IncomingMessage::Command(message)))
            .await
            .map_err(|_| AskError::ActorGone)
    }

    /// Run `f` against an actor between two of its messages.
    ///
    /// # Errors
    ///
    /// * [`AskError::DoesNotExist`] - the actor was never bootstrapped.
    /// * [`AskError::Unrecoverable`] - the actor's recovery failed.
    /// * [`AskError::ActorGone`] - the actor stopped first.
    pub async fn inspect<A, R, F>(&self, id: &str, f: F) -> Result<R, AskError>
    where
        A: ModelActor,
        R: Send + 'static,
        F: FnOnce(&A, &ActorCore) -> R + Send + 'static,
    {
        let (inspector, rx) = inspector::<A, _, _>(f);
        self.deliver::<A>(id, Mail::Inspect(inspector))
            .await
            .map_err(|_| AskError::ActorGone)?;
        rx.await.map_err(|_| AskError::ActorGone)?
    }

    /// A copy of an actor's current state.
    ///
    /// # Errors
    ///
    /// Same as [`inspect`](Self::inspect).
    pub async fn state<A: ModelActor + Clone>(&self, id: &str) -> Result<A, AskError> {
        self.inspect::<A, _, _>(id, |actor, _| actor.clone()).await
    }

    /// Force an actor to finish its queued mail and exit.
    ///
    /// Returns `false` if the actor was not running. A terminated actor is
    /// recovered again by the next message addressed to it.
    pub async fn terminate<A: ModelActor>(&self, id: &str) -> bool {
        let key = (TypeId::of::<A>(), id.to_owned());
        let handle = {
            let cache = self.inner.cache.read().await;
            cache
                .get(&key)
                .and_then(|cached| cached.handle.downcast_ref::<ActorRef<A>>())
                .filter(|handle| handle.is_alive())
                .cloned()
        };
        match handle {
            Some(handle) => {
                tracing::info!(actor_type = A::ACTOR_TYPE, actor_id = %id, "terminating actor");
                handle.send(Mail::Control(Control::Terminate)).await.is_ok()
            }
            None => false,
        }
    }

    /// Route a command addressed by actor type name and wait for the
    /// response.
    ///
    /// Unknown actor types and command payloads that do not decode are
    /// answered with an invalid-command failure.
    pub async fn ask_envelope(&self, envelope: CommandEnvelope) -> ModelResponse {
        let (tx, rx) = oneshot::channel();
        let fallback = envelope.undeliverable(Failure::new(
            FailureKind::EngineChoked,
            "actor stopped before answering",
        ));
        self.dispatch(envelope, ReplyTo::Caller(tx)).await;
        rx.await.unwrap_or(fallback)
    }

    /// Route a command addressed by actor type name.
    pub(crate) async fn dispatch(&self, envelope: CommandEnvelope, reply_to: ReplyTo) {
        match self.inner.dispatchers.get(envelope.actor_type.as_str()) {
            Some(dispatcher) => dispatcher.dispatch(self, envelope, reply_to).await,
            None => {
                tracing::warn!(actor_type = %envelope.actor_type, "no actor type registered under this name");
                let failure = Failure::new(
                    FailureKind::InvalidCommand,
                    format!("unknown actor type {}", envelope.actor_type),
                );
                reply_to.send(envelope.undeliverable(failure));
            }
        }
    }

    /// Handle for routing commands between actors.
    pub fn gateway(&self) -> Gateway {
        Gateway {
            system: Arc::downgrade(&self.inner),
        }
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.inner.shared.health
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.shared.config
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.inner.shared.journal
    }

    #[cfg(test)]
    pub(crate) async fn cached_actor_count(&self) -> usize {
        self.inner.cache.read().await.len()
    }
}

/// Routes commands to actors by type name without keeping the system
/// alive.
///
/// Every actor holds one; it is how
/// [`ActorContext::ask_model`](crate::ActorContext::ask_model) reaches its
/// peers.
#[derive(Clone)]
pub struct Gateway {
    system: Weak<SystemInner>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("connected", &(self.system.strong_count() > 0))
            .finish()
    }
}

impl Gateway {
    fn system(&self) -> Option<ActorSystem> {
        self.system.upgrade().map(|inner| ActorSystem { inner })
    }

    /// Deliver `envelope` in the background; the response goes to
    /// `reply_to`.
    pub fn inform(&self, envelope: CommandEnvelope, reply_to: ReplyTo) {
        let Some(system) = self.system() else {
            reply_to.send(envelope.undeliverable(Failure::new(
                FailureKind::EngineChoked,
                "actor system has shut down",
            )));
            return;
        };
        tokio::spawn(async move { system.dispatch(envelope, reply_to).await });
    }

    /// Force the named actor to exit. Returns `false` if it was not
    /// running or the type is unknown.
    pub async fn terminate(&self, actor_type: &str, actor_id: &str) -> bool {
        let Some(system) = self.system() else {
            return false;
        };
        match system.inner.dispatchers.get(actor_type) {
            Some(dispatcher) => dispatcher.terminate(&system, actor_id).await,
            None => false,
        }
    }

    /// Forget an actor whose task is exiting. An entry that already holds
    /// a newer, live incarnation is left alone.
    pub(crate) async fn release<A: ModelActor>(&self, actor_id: &str) {
        let Some(system) = self.system() else {
            return;
        };
        let key = (TypeId::of::<A>(), actor_id.to_owned());
        let mut cache = system.inner.cache.write().await;
        let stale = cache
            .get(&key)
            .and_then(|cached| cached.handle.downcast_ref::<ActorRef<A>>())
            .is_some_and(|handle| !handle.is_alive());
        if stale {
            cache.remove(&key);
            tracing::trace!(actor_type = A::ACTOR_TYPE, actor_id, "released cached handle");
        }
    }

    /// Reply address that feeds a response back into actor `actor_id` of
    /// type `A`.
    pub(crate) fn reply_to<A: ModelActor>(&self, actor_id: &str) -> ReplyTo {
        ReplyTo::Actor(Box::new(ActorSink::<A> {
            gateway: self.clone(),
            actor_id: actor_id.to_owned(),
            _actor: PhantomData,
        }))
    }
}

struct ActorSink<A> {
    gateway: Gateway,
    actor_id: String,
    _actor: PhantomData<fn() -> A>,
}

impl<A: ModelActor> ResponseSink for ActorSink<A> {
    fn deliver(self: Box<Self>, response: ModelResponse) {
        let Some(system) = self.gateway.system() else {
            tracing::debug!(actor_id = %self.actor_id, "dropping response; actor system has shut down");
            return;
        };
        let actor_id = self.actor_id;
        tokio::spawn(async move {
            let mail = Mail::Incoming(IncomingMessage::Response(response));
            if system.deliver::<A>(&actor_id, mail).await.is_err() {
                tracing::warn!(actor_type = A::ACTOR_TYPE, actor_id = %actor_id, "could not deliver response");
            }
        });
    }
}

// --- Type-erased dispatch for routing commands by actor type name ---

/// Type-erased interface for dispatching [`CommandEnvelope`]s to an actor
/// type.
#[async_trait]
trait ActorDispatcher: Send + Sync {
    /// Decode the envelope's command and deliver it; the response goes to
    /// `reply_to`.
    async fn dispatch(&self, system: &ActorSystem, envelope: CommandEnvelope, reply_to: ReplyTo);

    async fn terminate(&self, system: &ActorSystem, actor_id: &str) -> bool;
}

/// Concrete dispatcher for a specific actor type `A`.
struct TypedDispatcher<A: ModelActor> {
    _marker: PhantomData<fn() -> A>,
}

impl<A: ModelActor> TypedDispatcher<A> {
    fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<A: ModelActor> ActorDispatcher for TypedDispatcher<A> {
    async fn dispatch(&self, system: &ActorSystem, envelope: CommandEnvelope, reply_to: ReplyTo) {
        let command: A::Command = match serde_json::from_value(envelope.command.clone()) {
            Ok(command) => command,
            Err(e) => {
                let failure = Failure::new(
                    FailureKind::InvalidCommand,
                    format!("cannot decode {} command: {e}", A::ACTOR_TYPE),
                );
                reply_to.send(envelope.undeliverable(failure));
                return;
            }
        };
        let message = CommandMessage {
            message_id: envelope.message_id.clone(),
            user: envelope.user.clone(),
            command,
            reply_to,
        };
        let mail = Mail::Incoming(IncomingMessage::Command(message));
        if let Err(Mail::Incoming(IncomingMessage::Command(message))) =
            system.deliver::<A>(&envelope.actor_id, mail).await
        {
            message.reply_to.send(envelope.undeliverable(Failure::new(
                FailureKind::EngineChoked,
                format!("actor {} is not accepting commands", envelope.actor_id),
            )));
        }
    }

    async fn terminate(&self, system: &ActorSystem, actor_id: &str) -> bool {
        system.terminate::<A>(actor_id).await
    }
}

/// Factory for creating a type-erased actor dispatcher.
type DispatcherFactory = fn() -> Box<dyn ActorDispatcher>;

fn typed_dispatcher<A: ModelActor>() -> Box<dyn ActorDispatcher> {
    Box::new(TypedDispatcher::<A>::new())
}

/// Builder for configuring an [`ActorSystem`].
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use modelfold::ActorSystemBuilder;
///
/// # fn example() {
/// let system = ActorSystemBuilder::new()
///     .file_storage("/tmp/my-app")
///     .idle_period(Duration::from_secs(60))
///     .build();
/// # }
/// ```
pub struct ActorSystemBuilder {
    config: EngineConfig,
    journal: Option<Arc<dyn Journal>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    dispatcher_factories: Vec<(&'static str, DispatcherFactory)>,
}

impl Default for ActorSystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorSystemBuilder {
    /// Create a builder with the default [`EngineConfig`] and no storage.
    ///
    /// Without a call to [`journal`](ActorSystemBuilder::journal) or
    /// [`file_storage`](ActorSystemBuilder::file_storage) the system keeps
    /// its events in memory.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            journal: None,
            snapshots: None,
            dispatcher_factories: Vec::new(),
        }
    }

    /// Replace the whole engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn journal(self, journal: impl Journal) -> Self {
        self.shared_journal(Arc::new(journal))
    }

    /// Use a journal that is shared with other systems or callers.
    pub fn shared_journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn snapshot_store(mut self, store: impl SnapshotStore) -> Self {
        self.snapshots = Some(Arc::new(store));
        self
    }

    /// Keep the journal and snapshots under `base_dir`.
    ///
    /// # Arguments
    ///
    /// * `base_dir` - Root directory; `journal/` and `snapshots/` are
    ///   created beneath it on first write.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn file_storage(mut self, base_dir: impl AsRef<Path>) -> Self {
        let layout = StreamLayout::new(base_dir.as_ref());
        self.journal = Some(Arc::new(FileJournal::new(layout.clone())));
        self.snapshots = Some(Arc::new(FileSnapshotStore::new(layout)));
        self
    }

    /// Set how long an actor may go without messages before it is evicted.
    ///
    /// Defaults to 5 minutes.
    pub fn idle_period(mut self, period: Duration) -> Self {
        self.config.idle_period = period;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn engine_version(mut self, version: EngineVersion) -> Self {
        self.config.engine_version = version;
        self
    }

    /// Save a snapshot every `interval` persisted records. 0 disables
    /// snapshots, which is the default.
    pub fn snapshot_interval(mut self, interval: u64) -> Self {
        self.config.snapshot_interval = interval;
        self
    }

    pub fn unwind_order(mut self, order: UnwindOrder) -> Self {
        self.config.unwind_order = order;
        self
    }

    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.config.mailbox_capacity = capacity;
        self
    }

    /// Make actor type `A` addressable by name through the [`Gateway`].
    ///
    /// Required for every type that is the target of
    /// [`ActorContext::ask_model`](crate::ActorContext::ask_model) or
    /// [`ActorSystem::ask_envelope`].
    ///
    /// # Type Parameters
    ///
    /// * `A` - A type implementing [`ModelActor`].
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn register<A: ModelActor>(mut self) -> Self {
        if self
            .dispatcher_factories
            .iter()
            .any(|(name, _)| *name == A::ACTOR_TYPE)
        {
            tracing::warn!(actor_type = A::ACTOR_TYPE, "actor type registered twice; keeping the last");
        }
        self.dispatcher_factories
            .push((A::ACTOR_TYPE, typed_dispatcher::<A>));
        self
    }

    pub fn build(self) -> ActorSystem {
        let journal = self.journal.unwrap_or_else(|| {
            tracing::info!("no journal configured; events are kept in memory");
            Arc::new(InMemoryJournal::new())
        });
        let dispatchers: DispatcherMap = self
            .dispatcher_factories
            .into_iter()
            .map(|(name, factory)| (name, factory()))
            .collect();
        ActorSystem {
            inner: Arc::new(SystemInner {
                shared: SystemShared {
                    config: Arc::new(self.config),
                    journal,
                    snapshots: self.snapshots,
                    health: HealthMonitor::new(),
                },
                cache: RwLock::new(HashMap::new()),
                dispatchers,
            }),
        }
    }
}
