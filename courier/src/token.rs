//! Token minting contract. The runtime consumes this; real deployments bind a
//! JWT service. Chat tokens carry the reply context for downstream calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Claims carried by a short-lived chat token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatTokenClaims {
    pub bot_id: String,
    pub chat_id: String,
    pub route_id: String,
    pub user_id: String,
    pub channel_identity_id: String,
}

/// Consumed contract for auth token minting.
#[async_trait]
pub trait TokenMinter: Send + Sync {
    /// Short-lived token scoped to one reply context.
    async fn mint_chat_token(
        &self,
        claims: &ChatTokenClaims,
        ttl: Duration,
    ) -> Result<String, ChannelError>;

    /// User-scoped JWT for downstream calls. Callers fall back to the chat
    /// token as bearer when this fails.
    async fn mint_user_token(&self, user_id: &str) -> Result<String, ChannelError>;
}

/// Unsigned minter for tests and demos: encodes claims as plain strings.
/// `deny_user_tokens` exercises the chat-token bearer fallback.
#[derive(Default)]
pub struct StaticTokenMinter {
    deny_user_tokens: AtomicBool,
}

impl StaticTokenMinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_user_tokens(&self) {
        self.deny_user_tokens.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TokenMinter for StaticTokenMinter {
    async fn mint_chat_token(
        &self,
        claims: &ChatTokenClaims,
        ttl: Duration,
    ) -> Result<String, ChannelError> {
        Ok(format!(
            "chat:{}:{}:{}:{}",
            claims.bot_id,
            claims.chat_id,
            claims.user_id,
            ttl.as_secs()
        ))
    }

    async fn mint_user_token(&self, user_id: &str) -> Result<String, ChannelError> {
        if self.deny_user_tokens.load(Ordering::SeqCst) {
            return Err(ChannelError::Token("user tokens disabled".into()));
        }
        Ok(format!("user:{user_id}"))
    }
}
