//! In-memory `ConfigStore`: tests, demos, single-process deployments.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::descriptor::ChannelType;
use crate::store::{ChannelConfig, ConfigStore, StoreError, UserBinding};

#[derive(Default)]
struct Inner {
    configs: HashMap<String, ChannelConfig>,
    user_configs: HashMap<(String, ChannelType), Map<String, Value>>,
    bindings: Vec<UserBinding>,
    configless: HashSet<ChannelType>,
}

/// In-memory store. All mutations go through `&self` (internally locked) so it
/// can be shared behind an `Arc` like any other store.
#[derive(Default)]
pub struct InMemoryConfigStore {
    inner: Mutex<Inner>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a config (keyed by id).
    pub fn put_config(&self, config: ChannelConfig) {
        let mut inner = self.inner.lock().expect("config store poisoned");
        inner.configs.insert(config.id.clone(), config);
    }

    pub fn remove_config(&self, id: &str) {
        let mut inner = self.inner.lock().expect("config store poisoned");
        inner.configs.remove(id);
    }

    /// Marks a type configless: `resolve_effective_config` synthesizes when
    /// nothing is stored.
    pub fn mark_configless(&self, channel_type: ChannelType) {
        let mut inner = self.inner.lock().expect("config store poisoned");
        inner.configless.insert(channel_type);
    }

    pub fn put_binding(&self, binding: UserBinding) {
        let mut inner = self.inner.lock().expect("config store poisoned");
        inner.bindings.push(binding);
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn resolve_effective_config(
        &self,
        bot_id: &str,
        channel_type: &ChannelType,
    ) -> Result<ChannelConfig, StoreError> {
        let inner = self.inner.lock().expect("config store poisoned");
        let found = inner
            .configs
            .values()
            .filter(|c| c.bot_id == bot_id && &c.channel_type == channel_type)
            .max_by_key(|c| c.updated_at)
            .cloned();
        match found {
            Some(cfg) => Ok(cfg),
            None if inner.configless.contains(channel_type) => {
                Ok(ChannelConfig::synthetic(bot_id, channel_type))
            }
            None => Err(StoreError::NotFound(format!(
                "config for bot {bot_id} on {channel_type}"
            ))),
        }
    }

    async fn list_configs_by_type(
        &self,
        channel_type: &ChannelType,
    ) -> Result<Vec<ChannelConfig>, StoreError> {
        let inner = self.inner.lock().expect("config store poisoned");
        let mut out: Vec<ChannelConfig> = inner
            .configs
            .values()
            .filter(|c| &c.channel_type == channel_type)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn get_user_config(
        &self,
        user_id: &str,
        channel_type: &ChannelType,
    ) -> Result<Map<String, Value>, StoreError> {
        let inner = self.inner.lock().expect("config store poisoned");
        inner
            .user_configs
            .get(&(user_id.to_string(), channel_type.clone()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("user config {user_id} on {channel_type}")))
    }

    async fn upsert_user_config(
        &self,
        user_id: &str,
        channel_type: &ChannelType,
        config: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("config store poisoned");
        inner
            .user_configs
            .insert((user_id.to_string(), channel_type.clone()), config.clone());
        inner.bindings.push(UserBinding {
            user_id: user_id.to_string(),
            channel_type: channel_type.clone(),
            config,
        });
        Ok(())
    }

    async fn resolve_user_binding(
        &self,
        channel_type: &ChannelType,
        criteria: &Map<String, Value>,
    ) -> Result<String, StoreError> {
        let inner = self.inner.lock().expect("config store poisoned");
        inner
            .bindings
            .iter()
            .rev()
            .find(|b| {
                &b.channel_type == channel_type
                    && criteria.iter().all(|(k, v)| b.config.get(k) == Some(v))
            })
            .map(|b| b.user_id.clone())
            .ok_or_else(|| StoreError::NotFound(format!("user binding on {channel_type}")))
    }
}
