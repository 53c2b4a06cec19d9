//! Route resolution: maps a platform conversation to an internal chat container.
//!
//! Deliberately abstract — deployments bind their own route storage; only
//! `resolve_conversation(input) -> { chat_id, route_id }` is contracted.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::descriptor::ChannelType;
use crate::error::ChannelError;
use crate::message::Target;

/// Everything known about the conversation at resolution time.
#[derive(Clone, Debug)]
pub struct ResolveInput {
    pub bot_id: String,
    pub platform: ChannelType,
    pub conversation_id: String,
    pub thread_id: Option<String>,
    pub conversation_kind: String,
    pub channel_identity_id: String,
    pub channel_config_id: String,
    pub reply_target: Option<Target>,
}

/// Resolved route: the chat container and the persistent route record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteBinding {
    pub chat_id: String,
    pub route_id: String,
}

/// Consumed contract for route storage.
#[async_trait]
pub trait RouteResolver: Send + Sync {
    async fn resolve_conversation(&self, input: &ResolveInput) -> Result<RouteBinding, ChannelError>;
}

/// Deterministic resolver for tests and single-tenant deployments: derives
/// stable ids from the input and records every call.
#[derive(Default)]
pub struct StaticRouteResolver {
    calls: Mutex<Vec<ResolveInput>>,
}

impl StaticRouteResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ResolveInput> {
        self.calls.lock().expect("route resolver poisoned").clone()
    }
}

#[async_trait]
impl RouteResolver for StaticRouteResolver {
    async fn resolve_conversation(&self, input: &ResolveInput) -> Result<RouteBinding, ChannelError> {
        self.calls
            .lock()
            .expect("route resolver poisoned")
            .push(input.clone());
        Ok(RouteBinding {
            chat_id: format!("chat:{}:{}", input.bot_id, input.conversation_id),
            route_id: format!(
                "route:{}:{}:{}",
                input.bot_id, input.platform, input.conversation_id
            ),
        })
    }
}
