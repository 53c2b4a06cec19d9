//! Channel configuration model and the consumed `ConfigStore` contract.
//!
//! The runtime never owns config persistence; it consumes this trait. The repo
//! ships an in-memory binding (tests, demos) and a SQLite binding.

mod memory;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::descriptor::ChannelType;
use crate::error::ChannelError;

pub use memory::InMemoryConfigStore;
pub use sqlite::SqliteConfigStore;

/// Well-known config status values. Statuses are free-form strings compared
/// case-insensitively; anything outside the active set keeps the connection
/// down.
pub mod status {
    pub const PENDING: &str = "pending";
    pub const ACTIVE: &str = "active";
    pub const VERIFIED: &str = "verified";
    pub const DISABLED: &str = "disabled";
}

/// Live channel configuration for one bot on one platform.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    pub bot_id: String,
    pub channel_type: ChannelType,
    #[serde(default)]
    pub credentials: Map<String, Value>,
    /// External identity string (e.g. the bot's platform account id).
    #[serde(default)]
    pub external_id: String,
    #[serde(default)]
    pub self_identity: Map<String, Value>,
    #[serde(default)]
    pub routing: Map<String, Value>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChannelConfig {
    pub fn new(id: impl Into<String>, bot_id: impl Into<String>, channel_type: ChannelType) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            bot_id: bot_id.into(),
            channel_type,
            credentials: Map::new(),
            external_id: String::new(),
            self_identity: Map::new(),
            routing: Map::new(),
            status: status::ACTIVE.to_string(),
            verified_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// An active connection exists iff status is empty, `active`, or
    /// `verified` (case-insensitive) and a receiver is registered for the type.
    pub fn is_active(&self) -> bool {
        let s = self.status.trim().to_ascii_lowercase();
        s.is_empty() || s == status::ACTIVE || s == status::VERIFIED
    }

    /// Synthetic config for configless types: `ID = "<type>:<botID>"`.
    pub fn synthetic(bot_id: &str, channel_type: &ChannelType) -> Self {
        Self::new(
            format!("{}:{}", channel_type, bot_id),
            bot_id,
            channel_type.clone(),
        )
    }
}

/// Per-user binding config on one platform: resolves a platform-native subject
/// (e.g. an `open_id`) into an internal user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserBinding {
    pub user_id: String,
    pub channel_type: ChannelType,
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// Store-level failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store backend: {0}")]
    Backend(String),
}

impl From<StoreError> for ChannelError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ChannelError::NotFound(what),
            StoreError::Backend(msg) => ChannelError::Store(msg),
        }
    }
}

/// Consumed persistence contract for channel configs and user bindings.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Effective config for `(bot, type)`. Configless types yield a synthetic
    /// config when nothing is stored; everything else is `NotFound`.
    async fn resolve_effective_config(
        &self,
        bot_id: &str,
        channel_type: &ChannelType,
    ) -> Result<ChannelConfig, StoreError>;

    async fn list_configs_by_type(
        &self,
        channel_type: &ChannelType,
    ) -> Result<Vec<ChannelConfig>, StoreError>;

    async fn get_user_config(
        &self,
        user_id: &str,
        channel_type: &ChannelType,
    ) -> Result<Map<String, Value>, StoreError>;

    async fn upsert_user_config(
        &self,
        user_id: &str,
        channel_type: &ChannelType,
        config: Map<String, Value>,
    ) -> Result<(), StoreError>;

    /// Resolves a user id from platform-native criteria (e.g. an `open_id`).
    async fn resolve_user_binding(
        &self,
        channel_type: &ChannelType,
        criteria: &Map<String, Value>,
    ) -> Result<String, StoreError>;
}
