//! Registry behavior: registration, type parsing, capability probing,
//! normalization delegation.

mod init_logging;

use std::sync::Arc;

use courier::adapter::mock::MockAdapter;
use courier::{ChannelError, ChannelType, Registry, Target};
use serde_json::{json, Map};

#[test]
fn parse_type_trims_and_lowercases() {
    let registry = Registry::new();
    registry.register(Arc::new(MockAdapter::new("telegram")));

    let ty = registry.parse_type("  Telegram ").unwrap();
    assert_eq!(ty.as_str(), "telegram");

    assert!(matches!(
        registry.parse_type("discord"),
        Err(ChannelError::Unsupported(_))
    ));
    assert!(matches!(
        registry.parse_type("   "),
        Err(ChannelError::Unsupported(_))
    ));
}

#[test]
fn types_reflect_register_and_unregister() {
    let registry = Registry::new();
    registry.register(Arc::new(MockAdapter::new("b-chan")));
    registry.register(Arc::new(MockAdapter::new("a-chan")));
    assert_eq!(
        registry.types(),
        vec![ChannelType::new("a-chan"), ChannelType::new("b-chan")]
    );

    registry.unregister(&ChannelType::new("a-chan"));
    assert_eq!(registry.types(), vec![ChannelType::new("b-chan")]);
}

#[test]
fn capability_getters_verify_contracts() {
    let registry = Registry::new();
    registry.register(Arc::new(MockAdapter::new("sendonly").with_sender()));
    let ty = ChannelType::new("sendonly");

    assert!(registry.get_sender(&ty).is_ok());
    assert!(matches!(
        registry.get_receiver(&ty),
        Err(ChannelError::Capability { .. })
    ));
    assert!(matches!(
        registry.get_stream_sender(&ty),
        Err(ChannelError::Capability { .. })
    ));
    assert!(matches!(
        registry.get_directory(&ty),
        Err(ChannelError::Capability { .. })
    ));
    assert!(matches!(
        registry.get_processing_status(&ty),
        Err(ChannelError::Capability { .. })
    ));
}

#[test]
fn normalize_config_empty_input_is_empty_map() {
    let registry = Registry::new();
    registry.register(Arc::new(MockAdapter::new("chan")));
    let ty = ChannelType::new("chan");

    let out = registry.normalize_config(&ty, &Map::new()).unwrap();
    assert!(out.is_empty());

    // No adapter normalizer: passthrough.
    let mut input = Map::new();
    input.insert("token".into(), json!("x"));
    let out = registry.normalize_config(&ty, &input).unwrap();
    assert_eq!(out, input);
}

#[test]
fn normalize_target_is_idempotent() {
    let registry = Registry::new();
    registry.register(Arc::new(MockAdapter::new("chan").with_target_resolver()));
    let ty = ChannelType::new("chan");

    let raw = Target::new("  Conv-42 ");
    let once = registry.normalize_target(&ty, &raw).unwrap();
    let twice = registry.normalize_target(&ty, &once).unwrap();
    assert_eq!(once.id, "conv-42");
    assert_eq!(once, twice);
}

#[test]
fn resolve_target_uses_binding_config() {
    let registry = Registry::new();
    registry.register(Arc::new(MockAdapter::new("chan").with_target_resolver()));
    let ty = ChannelType::new("chan");

    let mut binding = Map::new();
    binding.insert("open_id".into(), json!("ou-77"));
    let target = registry.resolve_target(&ty, &binding).unwrap();
    assert_eq!(target.id, "ou-77");

    assert!(matches!(
        registry.resolve_target(&ty, &Map::new()),
        Err(ChannelError::Config(_))
    ));
}

#[test]
fn match_binding_defaults_to_subset_equality() {
    let registry = Registry::new();
    registry.register(Arc::new(MockAdapter::new("chan")));
    let ty = ChannelType::new("chan");

    let mut config = Map::new();
    config.insert("open_id".into(), json!("a"));
    config.insert("union_id".into(), json!("b"));

    let mut criteria = Map::new();
    criteria.insert("open_id".into(), json!("a"));
    assert!(registry.match_binding(&ty, &config, &criteria).unwrap());

    criteria.insert("union_id".into(), json!("wrong"));
    assert!(!registry.match_binding(&ty, &config, &criteria).unwrap());
}
