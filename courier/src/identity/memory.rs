//! In-memory `IdentityStore`: tests, demos, single-process deployments.
//!
//! Also carries the issuance side (bind codes, preauth keys, bot profiles,
//! membership seeding) as inherent methods; the trait stays the consumed
//! contract.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{Map, Value};

use crate::descriptor::ChannelType;
use crate::identity::{
    BindCode, BotProfile, ChannelIdentity, IdentityError, IdentityStore, PreauthKey,
};

#[derive(Default)]
struct Inner {
    identities: HashMap<(ChannelType, String), ChannelIdentity>,
    bind_codes: HashMap<String, BindCode>,
    preauth_keys: HashMap<String, PreauthKey>,
    profiles: HashMap<String, BotProfile>,
    members: HashSet<(String, String)>,
    next_identity: u64,
}

/// In-memory identity store.
#[derive(Default)]
pub struct InMemoryIdentityStore {
    inner: Mutex<Inner>,
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bot_profile(&self, profile: BotProfile) {
        let mut inner = self.inner.lock().expect("identity store poisoned");
        inner.profiles.insert(profile.bot_id.clone(), profile);
    }

    pub fn add_member(&self, bot_id: &str, user_id: &str) {
        let mut inner = self.inner.lock().expect("identity store poisoned");
        inner.members.insert((bot_id.to_string(), user_id.to_string()));
    }

    /// Issues a bind code for `(platform, bot, user)` with the given lifetime.
    pub fn issue_bind_code(
        &self,
        channel_type: ChannelType,
        bot_id: &str,
        user_id: &str,
        ttl: Duration,
    ) -> BindCode {
        let code = BindCode {
            token: random_token(8),
            channel_type,
            bot_id: bot_id.to_string(),
            user_id: user_id.to_string(),
            expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
            consumed_at: None,
        };
        let mut inner = self.inner.lock().expect("identity store poisoned");
        inner.bind_codes.insert(code.token.clone(), code.clone());
        code
    }

    pub fn issue_preauth_key(&self, bot_id: &str, ttl: Duration) -> PreauthKey {
        let key = PreauthKey {
            key: random_token(12),
            bot_id: bot_id.to_string(),
            expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
            used_at: None,
        };
        let mut inner = self.inner.lock().expect("identity store poisoned");
        inner.preauth_keys.insert(key.key.clone(), key.clone());
        key
    }

    /// Test hook: backdates a bind code so it reads as expired.
    pub fn expire_bind_code(&self, token: &str) {
        let mut inner = self.inner.lock().expect("identity store poisoned");
        if let Some(code) = inner.bind_codes.get_mut(token) {
            code.expires_at = Utc::now() - chrono::Duration::seconds(1);
        }
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn upsert_channel_identity(
        &self,
        channel_type: &ChannelType,
        subject_id: &str,
        display_name: &str,
        attributes: &Map<String, Value>,
    ) -> Result<ChannelIdentity, IdentityError> {
        let mut inner = self.inner.lock().expect("identity store poisoned");
        let key = (channel_type.clone(), subject_id.to_string());
        if let Some(existing) = inner.identities.get_mut(&key) {
            if !display_name.trim().is_empty() {
                existing.display_name = display_name.to_string();
            }
            for (k, v) in attributes {
                existing.metadata.insert(k.clone(), v.clone());
            }
            return Ok(existing.clone());
        }
        inner.next_identity += 1;
        let identity = ChannelIdentity {
            id: format!("ci-{}", inner.next_identity),
            channel_type: channel_type.clone(),
            subject_id: subject_id.to_string(),
            display_name: display_name.to_string(),
            avatar_url: None,
            user_id: None,
            metadata: attributes.clone(),
        };
        inner.identities.insert(key, identity.clone());
        Ok(identity)
    }

    async fn update_identity_profile(
        &self,
        identity_id: &str,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<(), IdentityError> {
        let mut inner = self.inner.lock().expect("identity store poisoned");
        let identity = inner
            .identities
            .values_mut()
            .find(|i| i.id == identity_id)
            .ok_or_else(|| IdentityError::NotFound(format!("identity {identity_id}")))?;
        if let Some(name) = display_name {
            if !name.trim().is_empty() {
                identity.display_name = name.to_string();
            }
        }
        if let Some(avatar) = avatar_url {
            identity.avatar_url = Some(avatar.to_string());
            identity
                .metadata
                .insert("avatar_url".to_string(), Value::String(avatar.to_string()));
        }
        Ok(())
    }

    async fn find_identity(
        &self,
        channel_type: &ChannelType,
        subject_id: &str,
    ) -> Result<Option<ChannelIdentity>, IdentityError> {
        let inner = self.inner.lock().expect("identity store poisoned");
        Ok(inner
            .identities
            .get(&(channel_type.clone(), subject_id.to_string()))
            .cloned())
    }

    async fn link_identity_to_user(
        &self,
        identity_id: &str,
        user_id: &str,
    ) -> Result<(), IdentityError> {
        let mut inner = self.inner.lock().expect("identity store poisoned");
        let identity = inner
            .identities
            .values_mut()
            .find(|i| i.id == identity_id)
            .ok_or_else(|| IdentityError::NotFound(format!("identity {identity_id}")))?;
        identity.user_id = Some(user_id.to_string());
        Ok(())
    }

    async fn find_live_bind_code(&self, token: &str) -> Result<Option<BindCode>, IdentityError> {
        let inner = self.inner.lock().expect("identity store poisoned");
        Ok(inner
            .bind_codes
            .get(token)
            .filter(|c| c.consumed_at.is_none())
            .cloned())
    }

    async fn consume_bind_code(&self, token: &str) -> Result<(), IdentityError> {
        let mut inner = self.inner.lock().expect("identity store poisoned");
        let code = inner
            .bind_codes
            .get_mut(token)
            .ok_or_else(|| IdentityError::NotFound("bind code".into()))?;
        code.consumed_at = Some(Utc::now());
        Ok(())
    }

    async fn find_preauth_key(&self, key: &str) -> Result<Option<PreauthKey>, IdentityError> {
        let inner = self.inner.lock().expect("identity store poisoned");
        Ok(inner.preauth_keys.get(key).cloned())
    }

    async fn mark_preauth_used(&self, key: &str) -> Result<(), IdentityError> {
        let mut inner = self.inner.lock().expect("identity store poisoned");
        let entry = inner
            .preauth_keys
            .get_mut(key)
            .ok_or_else(|| IdentityError::NotFound("preauth key".into()))?;
        entry.used_at = Some(Utc::now());
        Ok(())
    }

    async fn bot_profile(&self, bot_id: &str) -> Result<Option<BotProfile>, IdentityError> {
        let inner = self.inner.lock().expect("identity store poisoned");
        Ok(inner.profiles.get(bot_id).cloned())
    }

    async fn is_member(&self, bot_id: &str, user_id: &str) -> Result<bool, IdentityError> {
        let inner = self.inner.lock().expect("identity store poisoned");
        Ok(inner
            .members
            .contains(&(bot_id.to_string(), user_id.to_string())))
    }

    async fn upsert_member(&self, bot_id: &str, user_id: &str) -> Result<(), IdentityError> {
        let mut inner = self.inner.lock().expect("identity store poisoned");
        inner
            .members
            .insert((bot_id.to_string(), user_id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_is_idempotent_per_subject() {
        let store = InMemoryIdentityStore::new();
        let ty = ChannelType::new("telegram");
        let a = store
            .upsert_channel_identity(&ty, "u-1", "Ada", &Map::new())
            .await
            .unwrap();
        let b = store
            .upsert_channel_identity(&ty, "u-1", "Ada L.", &Map::new())
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.display_name, "Ada L.");
    }

    #[tokio::test]
    async fn bind_code_lifecycle() {
        let store = InMemoryIdentityStore::new();
        let ty = ChannelType::new("telegram");
        let code = store.issue_bind_code(ty.clone(), "b1", "user-1", Duration::from_secs(600));
        assert!(store.find_live_bind_code(&code.token).await.unwrap().is_some());
        store.consume_bind_code(&code.token).await.unwrap();
        assert!(store.find_live_bind_code(&code.token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn membership() {
        let store = InMemoryIdentityStore::new();
        assert!(!store.is_member("b1", "u1").await.unwrap());
        store.upsert_member("b1", "u1").await.unwrap();
        assert!(store.is_member("b1", "u1").await.unwrap());
    }
}
