//! Outbound delivery: retries with backoff, retry exhaustion, gate failures
//! without retry, manager-level send with user-binding targets.

mod init_logging;

use std::sync::Arc;

use async_trait::async_trait;
use courier::adapter::mock::MockAdapter;
use courier::outbound;
use courier::{
    Capabilities, ChannelConfig, ChannelError, ChannelType, ConfigStore, InMemoryConfigStore,
    InboundMessage, InboundProcessor, Manager, Message, OutboundMessage, OutboundPolicy, Registry,
    RuntimeSettings, SendRequest, StreamReplySender, Target,
};
use serde_json::json;

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

fn fast_retries() -> OutboundPolicy {
    OutboundPolicy {
        retry_backoff_ms: 5,
        ..OutboundPolicy::default()
    }
}

fn config() -> ChannelConfig {
    ChannelConfig::new("cfg-1", "bot-1", ChannelType::new("mock"))
}

#[tokio::test]
async fn transient_send_failures_are_retried() {
    let adapter = MockAdapter::new("mock")
        .with_sender()
        .with_outbound(fast_retries());
    adapter.fail_sends(2);

    outbound::deliver(
        &adapter,
        &config(),
        &OutboundMessage::new(Target::new("t1"), Message::text("retry me")),
    )
    .await
    .unwrap();
    assert_eq!(adapter.sent().len(), 1);
}

#[tokio::test]
async fn exhausted_retries_wrap_last_cause() {
    let adapter = MockAdapter::new("mock")
        .with_sender()
        .with_outbound(fast_retries());
    adapter.fail_sends(3);

    let err = outbound::deliver(
        &adapter,
        &config(),
        &OutboundMessage::new(Target::new("t1"), Message::text("doomed")),
    )
    .await
    .unwrap_err();
    match err {
        ChannelError::SendRetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, ChannelError::Transport(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(adapter.sent().is_empty());
}

#[tokio::test]
async fn gate_failure_never_reaches_the_wire() {
    let adapter = MockAdapter::new("mock")
        .with_sender()
        .with_capabilities(Capabilities::text_only())
        .with_outbound(fast_retries());
    // Any send attempt would succeed; the gate must fire first.
    let err = outbound::deliver(
        &adapter,
        &config(),
        &OutboundMessage::new(Target::new("t1"), Message::markdown("# nope")),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ChannelError::Capability { .. }));
    assert!(adapter.sent().is_empty());
}

#[tokio::test]
async fn long_reply_is_chunked_on_delivery() {
    let adapter = MockAdapter::new("mock").with_sender().with_outbound(OutboundPolicy {
        text_chunk_limit: 10,
        retry_backoff_ms: 5,
        ..OutboundPolicy::default()
    });

    outbound::deliver(
        &adapter,
        &config(),
        &OutboundMessage::new(Target::new("t1"), Message::text("aaa\nbbb\nccc\nddd")),
    )
    .await
    .unwrap();
    let sent = adapter.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].message.text, "aaa\nbbb");
    assert_eq!(sent[1].message.text, "ccc\nddd");
}

#[tokio::test]
async fn manager_send_resolves_user_binding_target() {
    let adapter = Arc::new(
        MockAdapter::new("mock")
            .with_sender()
            .with_target_resolver(),
    );
    let registry = Arc::new(Registry::new());
    registry.register(Arc::clone(&adapter) as _);
    let store = Arc::new(InMemoryConfigStore::new());
    store.put_config(config());
    let mut binding = serde_json::Map::new();
    binding.insert("open_id".into(), json!("  OU-42 "));
    store
        .upsert_user_config("user-7", &ChannelType::new("mock"), binding)
        .await
        .unwrap();

    let manager = Manager::new(
        registry,
        store,
        Arc::new(NoopProcessor),
        RuntimeSettings::default(),
    );
    manager
        .send(
            "bot-1",
            "Mock",
            SendRequest {
                target: None,
                user_id: Some("user-7".into()),
                message: Message::text("direct ping"),
            },
        )
        .await
        .unwrap();

    let sent = adapter.sent();
    assert_eq!(sent.len(), 1);
    // Resolved from the binding, then normalized.
    assert_eq!(sent[0].target.id, "ou-42");
}

#[tokio::test]
async fn manager_send_requires_target_or_user() {
    let adapter = Arc::new(MockAdapter::new("mock").with_sender());
    let registry = Arc::new(Registry::new());
    registry.register(Arc::clone(&adapter) as _);
    let store = Arc::new(InMemoryConfigStore::new());
    store.put_config(config());

    let manager = Manager::new(
        registry,
        store,
        Arc::new(NoopProcessor),
        RuntimeSettings::default(),
    );
    let err = manager
        .send(
            "bot-1",
            "mock",
            SendRequest {
                target: None,
                user_id: None,
                message: Message::text("nowhere"),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Config(_)));
}

#[tokio::test]
async fn manager_edit_and_react_are_capability_gated() {
    let adapter = Arc::new(MockAdapter::new("mock").with_sender());
    let registry = Arc::new(Registry::new());
    registry.register(Arc::clone(&adapter) as _);
    let store = Arc::new(InMemoryConfigStore::new());
    store.put_config(config());

    let manager = Manager::new(
        registry,
        store,
        Arc::new(NoopProcessor),
        RuntimeSettings::default(),
    );
    // Full capability matrix but no MessageEditor/Reactor contract: probe fails.
    let err = manager
        .edit_message(
            "bot-1",
            "mock",
            &Target::new("t1"),
            "m-1",
            &Message::text("edited"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Capability { .. }));

    let err = manager
        .react("bot-1", "mock", &Target::new("t1"), "m-1", "👍")
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Capability { .. }));
}
