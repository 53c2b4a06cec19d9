//! Connection manager reconciliation: converging live connections toward the
//! active config set, restart on update, stop-unsupported tolerance, races.

mod init_logging;

use std::sync::Arc;

use async_trait::async_trait;
use courier::adapter::mock::MockAdapter;
use courier::{
    ChannelConfig, ChannelError, ChannelType, InboundMessage, InboundProcessor, InMemoryConfigStore,
    Manager, Registry, RuntimeSettings, StreamReplySender,
};

struct NoopProcessor;

#[async_trait]
impl InboundProcessor for NoopProcessor {
    async fn process(
        &self,
        _config: Arc<ChannelConfig>,
        _message: InboundMessage,
        _sender: StreamReplySender,
    ) -> Result<(), ChannelError> {
        Ok(())
    }
}

fn manager_with(
    adapter: Arc<MockAdapter>,
    store: Arc<InMemoryConfigStore>,
) -> (Arc<Manager>, Arc<Registry>) {
    let registry = Arc::new(Registry::new());
    registry.register(adapter);
    let manager = Arc::new(Manager::new(
        Arc::clone(&registry),
        store,
        Arc::new(NoopProcessor),
        RuntimeSettings::default(),
    ));
    (manager, registry)
}

fn active_config(id: &str, bot: &str, ty: &str) -> ChannelConfig {
    ChannelConfig::new(id, bot, ChannelType::new(ty))
}

#[tokio::test]
async fn reconcile_establishes_and_removes() {
    let adapter = Arc::new(MockAdapter::new("mock").with_receiver());
    let store = Arc::new(InMemoryConfigStore::new());
    let (manager, _) = manager_with(Arc::clone(&adapter), store);

    manager
        .reconcile(vec![active_config("cfg-a", "bot-1", "mock")])
        .await;
    assert_eq!(manager.connection_ids(), vec!["cfg-a"]);
    assert_eq!(adapter.connect_count(), 1);

    // Empty active set: adapter's stop invoked once, table empty.
    manager.reconcile(vec![]).await;
    assert!(manager.connection_ids().is_empty());
    assert_eq!(adapter.stop_count(), 1);
}

#[tokio::test]
async fn reconcile_skips_inactive_and_nameless_configs() {
    let adapter = Arc::new(MockAdapter::new("mock").with_receiver());
    let store = Arc::new(InMemoryConfigStore::new());
    let (manager, _) = manager_with(Arc::clone(&adapter), store);

    let mut disabled = active_config("cfg-d", "bot-1", "mock");
    disabled.status = "disabled".into();
    let mut pending = active_config("cfg-p", "bot-1", "mock");
    pending.status = "pending".into();
    let nameless = {
        let mut c = active_config("", "bot-1", "mock");
        c.status = "active".into();
        c
    };
    let mut verified = active_config("cfg-v", "bot-1", "mock");
    verified.status = "Verified".into();

    manager
        .reconcile(vec![disabled, pending, nameless, verified])
        .await;
    assert_eq!(manager.connection_ids(), vec!["cfg-v"]);
}

#[tokio::test]
async fn refresh_uses_store_and_tolerates_receiverless_adapters() {
    let adapter = Arc::new(MockAdapter::new("mock").with_receiver());
    let sendonly = Arc::new(MockAdapter::new("sendonly").with_sender());
    let store = Arc::new(InMemoryConfigStore::new());
    store.put_config(active_config("cfg-a", "bot-1", "mock"));
    store.put_config(active_config("cfg-b", "bot-1", "sendonly"));

    let registry = Arc::new(Registry::new());
    registry.register(Arc::clone(&adapter) as _);
    registry.register(sendonly);
    let manager = Arc::new(Manager::new(
        registry,
        store,
        Arc::new(NoopProcessor),
        RuntimeSettings::default(),
    ));

    manager.refresh().await;
    // Only the receiver-backed type holds a connection.
    assert_eq!(manager.connection_ids(), vec!["cfg-a"]);
}

#[tokio::test]
async fn updated_config_restarts_connection() {
    let adapter = Arc::new(MockAdapter::new("mock").with_receiver());
    let store = Arc::new(InMemoryConfigStore::new());
    let (manager, _) = manager_with(Arc::clone(&adapter), store);

    let cfg = active_config("cfg-a", "bot-1", "mock");
    manager.reconcile(vec![cfg.clone()]).await;
    assert_eq!(adapter.connect_count(), 1);

    // Same updated_at: nothing to do.
    manager.reconcile(vec![cfg.clone()]).await;
    assert_eq!(adapter.connect_count(), 1);
    assert_eq!(adapter.stop_count(), 0);

    // Newer updated_at: old stopped, new connected.
    let mut newer = cfg;
    newer.updated_at += chrono::Duration::seconds(5);
    manager.reconcile(vec![newer]).await;
    assert_eq!(adapter.connect_count(), 2);
    assert_eq!(adapter.stop_count(), 1);
    assert_eq!(manager.connection_ids(), vec!["cfg-a"]);
}

#[tokio::test]
async fn stop_unsupported_keeps_running_session() {
    let adapter = Arc::new(MockAdapter::new("mock").with_receiver());
    adapter.set_stop_unsupported();
    let store = Arc::new(InMemoryConfigStore::new());
    let (manager, _) = manager_with(Arc::clone(&adapter), store);

    let cfg = active_config("cfg-a", "bot-1", "mock");
    manager.reconcile(vec![cfg.clone()]).await;
    assert_eq!(adapter.connect_count(), 1);

    let mut newer = cfg;
    newer.updated_at += chrono::Duration::seconds(5);
    manager.reconcile(vec![newer]).await;
    // Cannot restart: the original session stays, no second connect.
    assert_eq!(adapter.connect_count(), 1);
    assert_eq!(manager.connection_ids(), vec!["cfg-a"]);
}

#[tokio::test]
async fn concurrent_ensure_yields_one_connection() {
    let adapter = Arc::new(MockAdapter::new("mock").with_receiver());
    let store = Arc::new(InMemoryConfigStore::new());
    let (manager, _) = manager_with(Arc::clone(&adapter), store);

    let cfg = active_config("cfg-a", "bot-1", "mock");
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let cfg = cfg.clone();
            tokio::spawn(async move { manager.ensure_connection(cfg).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(manager.connection_ids(), vec!["cfg-a"]);
    // Races may connect more than once, but every loser is stopped again.
    assert_eq!(
        adapter.connect_count() - 1,
        adapter.stop_count(),
        "every redundant connection must be stopped"
    );
}

#[tokio::test]
async fn ensure_config_disable_path_stops_connection() {
    let adapter = Arc::new(MockAdapter::new("mock").with_receiver());
    let store = Arc::new(InMemoryConfigStore::new());
    let (manager, _) = manager_with(Arc::clone(&adapter), store);

    let cfg = active_config("cfg-a", "bot-1", "mock");
    manager.ensure_config(cfg.clone()).await.unwrap();
    assert_eq!(manager.connection_ids(), vec!["cfg-a"]);

    let mut disabled = cfg;
    disabled.status = "disabled".into();
    manager.ensure_config(disabled).await.unwrap();
    assert!(manager.connection_ids().is_empty());
    assert_eq!(adapter.stop_count(), 1);
}

#[tokio::test]
async fn add_and_remove_adapter() {
    let store = Arc::new(InMemoryConfigStore::new());
    store.put_config(active_config("cfg-a", "bot-1", "late"));
    let registry = Arc::new(Registry::new());
    let manager = Arc::new(Manager::new(
        Arc::clone(&registry),
        store,
        Arc::new(NoopProcessor),
        RuntimeSettings::default(),
    ));

    let adapter = Arc::new(MockAdapter::new("late").with_receiver());
    manager.add_adapter(Arc::clone(&adapter) as _).await;
    assert_eq!(manager.connection_ids(), vec!["cfg-a"]);

    manager.remove_adapter(&ChannelType::new("late")).await;
    assert!(manager.connection_ids().is_empty());
    assert_eq!(adapter.stop_count(), 1);
    assert!(registry.get(&ChannelType::new("late")).is_none());
}

#[tokio::test]
async fn stop_by_bot_only_touches_that_bot() {
    let adapter = Arc::new(MockAdapter::new("mock").with_receiver());
    let store = Arc::new(InMemoryConfigStore::new());
    let (manager, _) = manager_with(Arc::clone(&adapter), store);

    manager
        .reconcile(vec![
            active_config("cfg-a", "bot-1", "mock"),
            active_config("cfg-b", "bot-2", "mock"),
        ])
        .await;
    assert_eq!(manager.connection_ids(), vec!["cfg-a", "cfg-b"]);

    manager.stop_by_bot("bot-1").await;
    assert_eq!(manager.connection_ids(), vec!["cfg-b"]);
}

#[tokio::test]
async fn shutdown_stops_everything() {
    let adapter = Arc::new(MockAdapter::new("mock").with_receiver());
    let store = Arc::new(InMemoryConfigStore::new());
    let (manager, _) = manager_with(Arc::clone(&adapter), store);
    manager.start();

    manager
        .reconcile(vec![active_config("cfg-a", "bot-1", "mock")])
        .await;
    manager.shutdown().await;
    assert!(manager.connection_ids().is_empty());
    assert_eq!(adapter.stop_count(), 1);
}
