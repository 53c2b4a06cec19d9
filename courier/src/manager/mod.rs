//! Connection manager: reconciles live adapter connections against stored
//! channel configs.
//!
//! One refresh sweep per tick (serialized — a concurrent refresh waits rather
//! than skipping, so newly persisted configs are never dropped), a connection
//! table keyed by config id, and the inbound worker pool. Locks are held only
//! around table mutations, never across `connect`, `stop`, or `send`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use env_config::RuntimeSettings;

use crate::adapter::{Adapter, Connection};
use crate::descriptor::ChannelType;
use crate::dispatch::{wrap_handler, Dispatcher, InboundHandler, InboundMiddleware};
use crate::error::ChannelError;
use crate::message::inbound::InboundMessage;
use crate::message::{Message, OutboundMessage, Target};
use crate::outbound;
use crate::processor::InboundProcessor;
use crate::registry::Registry;
use crate::store::{ChannelConfig, ConfigStore};
use crate::stream::{StreamObserver, StreamReplySender};

/// One live entry in the connection table.
struct ConnectionEntry {
    config: Arc<ChannelConfig>,
    connection: Arc<dyn Connection>,
}

/// Send request addressed either directly or via a user binding.
#[derive(Clone, Debug)]
pub struct SendRequest {
    pub target: Option<Target>,
    pub user_id: Option<String>,
    pub message: Message,
}

/// The channel runtime: registry + config store + connection table + inbound
/// pipeline.
pub struct Manager {
    registry: Arc<Registry>,
    store: Arc<dyn ConfigStore>,
    processor: Arc<dyn InboundProcessor>,
    observer: Option<Arc<dyn StreamObserver>>,
    middlewares: Vec<Arc<dyn InboundMiddleware>>,
    settings: RuntimeSettings,
    connections: StdMutex<HashMap<String, ConnectionEntry>>,
    /// Serializes refresh sweeps; callers wait instead of skipping.
    refresh_mu: tokio::sync::Mutex<()>,
    dispatcher: Arc<Dispatcher>,
    handler: OnceLock<InboundHandler>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Manager {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn ConfigStore>,
        processor: Arc<dyn InboundProcessor>,
        settings: RuntimeSettings,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(settings.inbound_queue_capacity));
        Self {
            registry,
            store,
            processor,
            observer: None,
            middlewares: Vec::new(),
            settings,
            connections: StdMutex::new(HashMap::new()),
            refresh_mu: tokio::sync::Mutex::new(()),
            dispatcher,
            handler: OnceLock::new(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Mirrors every stream event to the observer (WebUI / broadcast).
    pub fn with_observer(mut self, observer: Arc<dyn StreamObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Appends a middleware; the first registered is outermost.
    pub fn with_middleware(mut self, middleware: Arc<dyn InboundMiddleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Launches the inbound worker pool and the refresh ticker.
    pub fn start(self: &Arc<Self>) {
        self.dispatcher.start(
            self.chain(),
            self.settings.inbound_workers,
            self.cancel.clone(),
            &self.tracker,
        );
        let manager = Arc::clone(self);
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(manager.settings.refresh_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => break,
                    _ = ticker.tick() => manager.refresh().await,
                }
            }
            tracing::debug!("refresh ticker stopped");
        });
    }

    /// One full sweep: list configs per registered type and reconcile.
    /// Per-type listing errors are logged and never abort the sweep.
    pub async fn refresh(&self) {
        let _guard = self.refresh_mu.lock().await;
        let mut configs = Vec::new();
        for ty in self.registry.types() {
            match self.store.list_configs_by_type(&ty).await {
                Ok(list) => configs.extend(list),
                Err(e) => {
                    tracing::warn!(channel = %ty, error = %e, "listing configs failed");
                }
            }
        }
        self.reconcile(configs).await;
    }

    /// Converges the connection table toward the active subset of `configs`.
    pub async fn reconcile(&self, configs: Vec<ChannelConfig>) {
        let active: Vec<ChannelConfig> = configs
            .into_iter()
            .filter(|c| !c.id.is_empty() && c.is_active())
            .collect();
        let active_ids: HashSet<String> = active.iter().map(|c| c.id.clone()).collect();

        let ensures = active.into_iter().map(|config| {
            let channel = config.channel_type.clone();
            let config_id = config.id.clone();
            async move { (channel, config_id, self.ensure_connection(config).await) }
        });
        for (channel, config_id, result) in futures::future::join_all(ensures).await {
            if let Err(e) = result {
                tracing::warn!(
                    channel = %channel,
                    config_id = %config_id,
                    error = %e,
                    "ensure connection failed"
                );
            }
        }

        let stale: Vec<ConnectionEntry> = {
            let mut table = self.connections.lock().expect("connection table poisoned");
            let stale_ids: Vec<String> = table
                .keys()
                .filter(|id| !active_ids.contains(*id))
                .cloned()
                .collect();
            stale_ids
                .into_iter()
                .filter_map(|id| table.remove(&id))
                .collect()
        };
        for entry in stale {
            self.stop_entry(entry, "config no longer active").await;
        }
    }

    /// Starts, restarts, or leaves alone the connection for one config.
    ///
    /// The lock dance: the stale entry is removed while the lock is held (a
    /// concurrent caller must not observe it), stopped outside the lock, and
    /// re-inserted when the connection cannot be torn down. After the connect
    /// the table is re-checked — a rival that inserted first wins and the new
    /// connection is stopped.
    pub async fn ensure_connection(&self, config: ChannelConfig) -> Result<(), ChannelError> {
        let ty = config.channel_type.clone();
        let Some(adapter) = self.registry.get(&ty) else {
            return Ok(());
        };
        if adapter.receiver().is_none() {
            // Adapter loaded read-only; send-only types hold no connections.
            return Ok(());
        }

        let existing = {
            let mut table = self.connections.lock().expect("connection table poisoned");
            match table.get(&config.id) {
                Some(entry) if entry.config.updated_at >= config.updated_at => return Ok(()),
                Some(_) => table.remove(&config.id),
                None => None,
            }
        };

        if let Some(old) = existing {
            match old.connection.stop().await {
                Ok(()) => {
                    tracing::info!(
                        channel = %ty,
                        config_id = %config.id,
                        "stopped outdated connection for restart"
                    );
                }
                Err(e) if e.is_stop_unsupported() => {
                    tracing::warn!(
                        channel = %ty,
                        config_id = %config.id,
                        "connection cannot be stopped, keeping the running session"
                    );
                    let mut table = self.connections.lock().expect("connection table poisoned");
                    table.insert(config.id.clone(), old);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        channel = %ty,
                        config_id = %config.id,
                        error = %e,
                        "stopping outdated connection failed, restarting anyway"
                    );
                }
            }
        }

        {
            let table = self.connections.lock().expect("connection table poisoned");
            if table.contains_key(&config.id) {
                // A concurrent caller re-established the connection meanwhile.
                return Ok(());
            }
        }

        let mut config = config;
        if config.self_identity.is_empty() {
            if let Some(discoverer) = adapter.self_discoverer() {
                match discoverer.discover_self(&config).await {
                    Ok(identity) => config.self_identity = identity,
                    Err(e) => {
                        tracing::debug!(
                            channel = %ty,
                            config_id = %config.id,
                            error = %e,
                            "self discovery failed"
                        );
                    }
                }
            }
        }
        let config = Arc::new(config);

        let Some(receiver) = adapter.receiver() else {
            return Ok(());
        };
        // The connect runs detached from any caller lifetime; the session ends
        // only via stop or shutdown.
        let connection = receiver
            .connect(Arc::clone(&config), self.connect_handler())
            .await?;
        let connection: Arc<dyn Connection> = Arc::from(connection);

        let rival_won = {
            let mut table = self.connections.lock().expect("connection table poisoned");
            if table.contains_key(&config.id) {
                true
            } else {
                table.insert(
                    config.id.clone(),
                    ConnectionEntry {
                        config: Arc::clone(&config),
                        connection: Arc::clone(&connection),
                    },
                );
                false
            }
        };
        if rival_won {
            tracing::info!(
                channel = %ty,
                config_id = %config.id,
                "rival connection inserted first, stopping ours"
            );
            if let Err(e) = connection.stop().await {
                if !e.is_stop_unsupported() {
                    tracing::warn!(
                        channel = %ty,
                        config_id = %config.id,
                        error = %e,
                        "stopping redundant connection failed"
                    );
                }
            }
        } else {
            tracing::info!(
                channel = %ty,
                config_id = %config.id,
                bot_id = %config.bot_id,
                "connection established"
            );
        }
        Ok(())
    }

    /// Explicit single-config reconcile; also the disable path (stop+delete
    /// when the config is no longer active).
    pub async fn ensure_config(&self, config: ChannelConfig) -> Result<(), ChannelError> {
        if config.id.is_empty() || !config.is_active() {
            self.stop(&config.id).await;
            return Ok(());
        }
        self.ensure_connection(config).await
    }

    /// Registers the adapter and triggers one refresh sweep.
    pub async fn add_adapter(&self, adapter: Arc<dyn Adapter>) {
        let ty = adapter.channel_type();
        self.registry.register(adapter);
        tracing::info!(channel = %ty, "adapter registered");
        self.refresh().await;
    }

    /// Stops all connections of the type and unregisters the adapter.
    pub async fn remove_adapter(&self, channel_type: &ChannelType) {
        let removed: Vec<ConnectionEntry> = {
            let mut table = self.connections.lock().expect("connection table poisoned");
            let ids: Vec<String> = table
                .iter()
                .filter(|(_, e)| &e.config.channel_type == channel_type)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| table.remove(&id)).collect()
        };
        for entry in removed {
            self.stop_entry(entry, "adapter removed").await;
        }
        self.registry.unregister(channel_type);
        tracing::info!(channel = %channel_type, "adapter unregistered");
    }

    /// Stops and removes one connection; absent ids are a no-op.
    pub async fn stop(&self, config_id: &str) {
        let entry = {
            let mut table = self.connections.lock().expect("connection table poisoned");
            table.remove(config_id)
        };
        if let Some(entry) = entry {
            self.stop_entry(entry, "stop requested").await;
        }
    }

    /// Stops every connection belonging to the bot.
    pub async fn stop_by_bot(&self, bot_id: &str) {
        let removed: Vec<ConnectionEntry> = {
            let mut table = self.connections.lock().expect("connection table poisoned");
            let ids: Vec<String> = table
                .iter()
                .filter(|(_, e)| e.config.bot_id == bot_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| table.remove(&id)).collect()
        };
        for entry in removed {
            self.stop_entry(entry, "bot stopped").await;
        }
    }

    /// Cancels the worker pool, waits for drain, then stops all connections.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        let all: Vec<ConnectionEntry> = {
            let mut table = self.connections.lock().expect("connection table poisoned");
            table.drain().map(|(_, e)| e).collect()
        };
        for entry in all {
            self.stop_entry(entry, "shutdown").await;
        }
        tracing::info!("channel manager shut down");
    }

    /// Entry point for adapters and webhook surfaces: detach from the caller
    /// and enqueue. A full queue is backpressure, not an internal retry.
    pub fn handle_inbound(
        &self,
        config: Arc<ChannelConfig>,
        message: InboundMessage,
    ) -> Result<(), ChannelError> {
        self.dispatcher.enqueue(config, message)
    }

    /// Sends a message on behalf of a bot, addressed directly or through a
    /// user binding.
    pub async fn send(
        &self,
        bot_id: &str,
        channel_type: &str,
        request: SendRequest,
    ) -> Result<(), ChannelError> {
        let ty = self.registry.parse_type(channel_type)?;
        let adapter = self.registry.get_sender(&ty)?;
        let config = self.store.resolve_effective_config(bot_id, &ty).await?;

        let target = match request.target {
            Some(target) => self.registry.normalize_target(&ty, &target)?,
            None => {
                let user_id = request.user_id.ok_or_else(|| {
                    ChannelError::Config("send requires a target or a user id".into())
                })?;
                let user_config = self.store.get_user_config(&user_id, &ty).await?;
                let target = self.registry.resolve_target(&ty, &user_config)?;
                self.registry.normalize_target(&ty, &target)?
            }
        };
        outbound::deliver(
            adapter.as_ref(),
            &config,
            &OutboundMessage::new(target, request.message),
        )
        .await
    }

    /// Edits an already-sent message; gated on the `edit` capability.
    pub async fn edit_message(
        &self,
        bot_id: &str,
        channel_type: &str,
        target: &Target,
        message_id: &str,
        message: &Message,
    ) -> Result<(), ChannelError> {
        let ty = self.registry.parse_type(channel_type)?;
        let adapter = self
            .registry
            .get(&ty)
            .ok_or_else(|| ChannelError::Unsupported(ty.to_string()))?;
        if !adapter.descriptor().capabilities.edit {
            return Err(ChannelError::Capability {
                channel: ty.to_string(),
                capability: "edit".into(),
            });
        }
        let Some(editor) = adapter.message_editor() else {
            return Err(ChannelError::Capability {
                channel: ty.to_string(),
                capability: "edit".into(),
            });
        };
        let config = self.store.resolve_effective_config(bot_id, &ty).await?;
        let target = self.registry.normalize_target(&ty, target)?;
        editor.edit_message(&config, &target, message_id, message).await
    }

    /// Removes an already-sent message; gated on the `unsend` capability.
    pub async fn unsend_message(
        &self,
        bot_id: &str,
        channel_type: &str,
        target: &Target,
        message_id: &str,
    ) -> Result<(), ChannelError> {
        let ty = self.registry.parse_type(channel_type)?;
        let adapter = self
            .registry
            .get(&ty)
            .ok_or_else(|| ChannelError::Unsupported(ty.to_string()))?;
        if !adapter.descriptor().capabilities.unsend {
            return Err(ChannelError::Capability {
                channel: ty.to_string(),
                capability: "unsend".into(),
            });
        }
        let Some(editor) = adapter.message_editor() else {
            return Err(ChannelError::Capability {
                channel: ty.to_string(),
                capability: "unsend".into(),
            });
        };
        let config = self.store.resolve_effective_config(bot_id, &ty).await?;
        let target = self.registry.normalize_target(&ty, target)?;
        editor.unsend_message(&config, &target, message_id).await
    }

    /// Adds a reaction through the adapter's `Reactor` contract.
    pub async fn react(
        &self,
        bot_id: &str,
        channel_type: &str,
        target: &Target,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), ChannelError> {
        let ty = self.registry.parse_type(channel_type)?;
        let adapter = self
            .registry
            .get(&ty)
            .ok_or_else(|| ChannelError::Unsupported(ty.to_string()))?;
        let Some(reactor) = adapter.reactor() else {
            return Err(ChannelError::Capability {
                channel: ty.to_string(),
                capability: "reactions".into(),
            });
        };
        let config = self.store.resolve_effective_config(bot_id, &ty).await?;
        let target = self.registry.normalize_target(&ty, target)?;
        reactor.react(&config, &target, message_id, emoji).await
    }

    /// Current connection table keys; test and introspection aid.
    pub fn connection_ids(&self) -> Vec<String> {
        let table = self.connections.lock().expect("connection table poisoned");
        let mut ids: Vec<String> = table.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn stop_entry(&self, entry: ConnectionEntry, reason: &str) {
        let channel = entry.config.channel_type.clone();
        let config_id = entry.config.id.clone();
        match entry.connection.stop().await {
            Ok(()) => {
                tracing::info!(channel = %channel, config_id = %config_id, reason, "connection stopped");
            }
            Err(e) if e.is_stop_unsupported() => {
                tracing::warn!(
                    channel = %channel,
                    config_id = %config_id,
                    reason,
                    "connection does not support stopping, dropping entry"
                );
            }
            Err(e) => {
                tracing::warn!(
                    channel = %channel,
                    config_id = %config_id,
                    reason,
                    error = %e,
                    "stopping connection failed"
                );
            }
        }
    }

    /// Handler given to `Receiver::connect`: detaches from the adapter's
    /// calling context by enqueueing into the bounded queue.
    fn connect_handler(&self) -> InboundHandler {
        let dispatcher = Arc::clone(&self.dispatcher);
        Arc::new(move |config, message| {
            let dispatcher = Arc::clone(&dispatcher);
            Box::pin(async move { dispatcher.enqueue(config, message) })
        })
    }

    /// The full middleware chain around the innermost processor call.
    fn chain(&self) -> InboundHandler {
        self.handler
            .get_or_init(|| {
                let registry = Arc::clone(&self.registry);
                let observer = self.observer.clone();
                let processor = Arc::clone(&self.processor);
                let inner: InboundHandler = Arc::new(move |config, message| {
                    let registry = Arc::clone(&registry);
                    let observer = observer.clone();
                    let processor = Arc::clone(&processor);
                    Box::pin(async move {
                        let Some(adapter) = registry.get(&message.channel) else {
                            return Err(ChannelError::Unsupported(message.channel.to_string()));
                        };
                        let sender = StreamReplySender::new(adapter, Arc::clone(&config), observer);
                        processor.process(config, message, sender).await
                    })
                });
                wrap_handler(inner, &self.middlewares)
            })
            .clone()
    }
}
