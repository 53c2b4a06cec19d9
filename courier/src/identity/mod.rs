//! Identity resolution: the gate between raw inbound messages and the AI pipeline.
//!
//! Canonicalizes platform subjects into channel identities, consumes bind
//! codes and preauth keys, enforces the personal-bot owner guard, and applies
//! the membership/guest policy. The outcome is either a resolved
//! [`InboundIdentity`] or a [`Decision`] to stop (with an optional reply,
//! emitted only in direct conversations).

pub mod memory;
pub mod middleware;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::descriptor::ChannelType;
use crate::error::ChannelError;
use crate::message::inbound::InboundMessage;
use crate::message::Message;
use crate::registry::Registry;
use crate::store::ChannelConfig;

pub use memory::InMemoryIdentityStore;
pub use middleware::IdentityMiddleware;
pub use sqlite::SqliteIdentityStore;

/// Canonical internal identity for one `(platform, subject)` pair. May be
/// linked to an internal user; unlinked identities act as their own user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelIdentity {
    pub id: String,
    pub channel_type: ChannelType,
    pub subject_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// One-shot token linking a platform identity to the issuing user. Issued per
/// platform; consumable on any bot of that platform.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BindCode {
    pub token: String,
    pub channel_type: ChannelType,
    pub bot_id: String,
    /// The user the code was issued by; consumption links to this user.
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub consumed_at: Option<DateTime<Utc>>,
}

/// One-shot key granting bot membership to whoever presents it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreauthKey {
    pub key: String,
    pub bot_id: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub used_at: Option<DateTime<Utc>>,
}

/// Bot ownership model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotKind {
    /// Owned by one user; only the owner may talk to it.
    Personal,
    /// Open to members (and guests when policy allows).
    Shared,
}

/// Policy-relevant bot attributes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BotProfile {
    pub bot_id: String,
    pub kind: BotKind,
    #[serde(default)]
    pub owner_user_id: Option<String>,
    #[serde(default)]
    pub allow_guests: bool,
}

impl BotProfile {
    /// Default profile when nothing is stored: shared, members only.
    pub fn shared(bot_id: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            kind: BotKind::Shared,
            owner_user_id: None,
            allow_guests: false,
        }
    }

    pub fn personal(bot_id: impl Into<String>, owner_user_id: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            kind: BotKind::Personal,
            owner_user_id: Some(owner_user_id.into()),
            allow_guests: false,
        }
    }
}

/// Identity-store failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IdentityError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("identity backend: {0}")]
    Backend(String),
}

impl From<IdentityError> for ChannelError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::NotFound(what) => ChannelError::NotFound(what),
            IdentityError::Backend(msg) => ChannelError::Store(msg),
        }
    }
}

/// Consumed persistence contract for identities, bind codes, preauth keys,
/// membership, and bot profiles.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Upserts the identity for `(platform, subject)`, refreshing display name
    /// and attributes. Returns the canonical record.
    async fn upsert_channel_identity(
        &self,
        channel_type: &ChannelType,
        subject_id: &str,
        display_name: &str,
        attributes: &Map<String, Value>,
    ) -> Result<ChannelIdentity, IdentityError>;

    /// Directory enrichment: overwrite display name / avatar when provided.
    async fn update_identity_profile(
        &self,
        identity_id: &str,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<(), IdentityError>;

    async fn find_identity(
        &self,
        channel_type: &ChannelType,
        subject_id: &str,
    ) -> Result<Option<ChannelIdentity>, IdentityError>;

    async fn link_identity_to_user(
        &self,
        identity_id: &str,
        user_id: &str,
    ) -> Result<(), IdentityError>;

    /// Live (unconsumed) bind code by exact token, regardless of bot.
    async fn find_live_bind_code(&self, token: &str) -> Result<Option<BindCode>, IdentityError>;

    async fn consume_bind_code(&self, token: &str) -> Result<(), IdentityError>;

    async fn find_preauth_key(&self, key: &str) -> Result<Option<PreauthKey>, IdentityError>;

    async fn mark_preauth_used(&self, key: &str) -> Result<(), IdentityError>;

    async fn bot_profile(&self, bot_id: &str) -> Result<Option<BotProfile>, IdentityError>;

    async fn is_member(&self, bot_id: &str, user_id: &str) -> Result<bool, IdentityError>;

    async fn upsert_member(&self, bot_id: &str, user_id: &str) -> Result<(), IdentityError>;
}

/// Resolved sender context handed to the processor.
#[derive(Clone, Debug)]
pub struct InboundIdentity {
    pub bot_id: String,
    pub channel_identity_id: String,
    /// Linked user id; equals the channel identity id for unlinked senders.
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub channel_config_id: String,
    /// Reply without a mention/command trigger (personal-bot owner in DMs).
    pub force_reply: bool,
}

/// Stop outcome. An empty reply means silent drop.
#[derive(Clone, Debug, Default)]
pub struct Decision {
    pub reply: Option<Message>,
}

impl Decision {
    pub fn silent() -> Self {
        Self { reply: None }
    }

    fn replying(direct: bool, text: &str) -> Self {
        Self {
            reply: direct.then(|| Message::text(text)),
        }
    }
}

/// Outcome of identity resolution.
#[derive(Clone, Debug)]
pub enum Resolution {
    Pass(InboundIdentity),
    Stop(Decision),
}

/// Attribute precedence for resolving a sender to a user through
/// channel-identity links. The subject id always goes first.
const OWNER_ATTRIBUTE_ORDER: [&str; 2] = ["open_id", "user_id"];

/// Gate between raw inbound and the AI pipeline.
pub struct IdentityResolver {
    store: Arc<dyn IdentityStore>,
    registry: Arc<Registry>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn IdentityStore>, registry: Arc<Registry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    /// Runs the per-message state machine: canonicalize, bind code, preauth,
    /// personal guard, membership policy.
    pub async fn resolve(
        &self,
        config: &ChannelConfig,
        msg: &InboundMessage,
    ) -> Result<Resolution, ChannelError> {
        let identity = self.canonicalize(config, msg).await?;
        let direct = msg.conversation.is_direct();
        let text = msg.message.plain_text();
        let token = text.trim();

        // Bind codes run before membership shortcuts so a human can re-bind a
        // shadow identity even if it is already a bot member.
        if !token.is_empty() {
            if let Some(code) = self.store.find_live_bind_code(token).await? {
                let now = Utc::now();
                if code.expires_at <= now || code.channel_type != msg.channel {
                    tracing::info!(
                        channel = %msg.channel,
                        bot_id = %config.bot_id,
                        "bind code expired or platform mismatch, dropping"
                    );
                    return Ok(Resolution::Stop(Decision::silent()));
                }
                self.store.consume_bind_code(token).await?;
                self.store
                    .link_identity_to_user(&identity.id, &code.user_id)
                    .await?;
                tracing::info!(
                    channel = %msg.channel,
                    bot_id = %config.bot_id,
                    user_id = %code.user_id,
                    identity_id = %identity.id,
                    "bind code consumed, identity linked"
                );
                return Ok(Resolution::Stop(Decision::replying(direct, "Account linked.")));
            }

            if let Some(key) = self.store.find_preauth_key(token).await? {
                if key.used_at.is_none() && key.expires_at > Utc::now() {
                    self.store.mark_preauth_used(token).await?;
                    let user_id = identity
                        .user_id
                        .clone()
                        .unwrap_or_else(|| identity.id.clone());
                    self.store.upsert_member(&key.bot_id, &user_id).await?;
                    tracing::info!(
                        channel = %msg.channel,
                        bot_id = %key.bot_id,
                        user_id = %user_id,
                        "preauth key consumed, membership granted"
                    );
                    return Ok(Resolution::Stop(Decision::replying(direct, "Access granted.")));
                }
            }
        }

        let profile = self
            .store
            .bot_profile(&config.bot_id)
            .await?
            .unwrap_or_else(|| BotProfile::shared(&config.bot_id));

        if profile.kind == BotKind::Personal {
            return self.personal_guard(config, msg, &identity, &profile).await;
        }

        let user_id = identity
            .user_id
            .clone()
            .unwrap_or_else(|| identity.id.clone());

        if !self.store.is_member(&config.bot_id, &user_id).await? {
            if !profile.allow_guests {
                tracing::debug!(
                    channel = %msg.channel,
                    bot_id = %config.bot_id,
                    user_id = %user_id,
                    "sender is not a member and guests are not allowed"
                );
                return Ok(Resolution::Stop(Decision::replying(
                    direct,
                    "You are not a member of this bot yet. Send a bind code to link your account.",
                )));
            }
            // Guests pass without a membership upsert.
        }

        Ok(Resolution::Pass(InboundIdentity {
            bot_id: config.bot_id.clone(),
            channel_identity_id: identity.id.clone(),
            user_id,
            display_name: identity.display_name.clone(),
            avatar_url: identity.avatar_url.clone(),
            channel_config_id: config.id.clone(),
            force_reply: false,
        }))
    }

    /// Upserts the channel identity and enriches it via the directory adapter
    /// when available. Directory failures never substitute a different
    /// subject id; they leave the profile as stored.
    async fn canonicalize(
        &self,
        config: &ChannelConfig,
        msg: &InboundMessage,
    ) -> Result<ChannelIdentity, ChannelError> {
        let mut identity = self
            .store
            .upsert_channel_identity(
                &msg.channel,
                &msg.sender.subject_id,
                &msg.sender.display_name,
                &msg.sender.attributes,
            )
            .await?;

        let adapter = self.registry.get(&msg.channel);
        if let Some(dir) = adapter.as_deref().and_then(|a| a.directory()) {
            match dir.lookup_subject(config, &msg.sender.subject_id).await {
                Ok(entry) => {
                    self.store
                        .update_identity_profile(
                            &identity.id,
                            entry.display_name.as_deref(),
                            entry.avatar_url.as_deref(),
                        )
                        .await?;
                    if let Some(name) = entry.display_name {
                        identity.display_name = name;
                    }
                    if let Some(avatar) = entry.avatar_url {
                        identity
                            .metadata
                            .insert("avatar_url".to_string(), Value::String(avatar.clone()));
                        identity.avatar_url = Some(avatar);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        channel = %msg.channel,
                        subject_id = %msg.sender.subject_id,
                        error = %e,
                        "directory lookup failed, keeping stored profile"
                    );
                }
            }
        }
        Ok(identity)
    }

    /// Personal bots answer only to their owner. In groups the owner still
    /// needs a mention or command to trigger a reply.
    async fn personal_guard(
        &self,
        config: &ChannelConfig,
        msg: &InboundMessage,
        identity: &ChannelIdentity,
        profile: &BotProfile,
    ) -> Result<Resolution, ChannelError> {
        let Some(owner) = profile.owner_user_id.as_deref() else {
            tracing::warn!(bot_id = %config.bot_id, "personal bot without owner, dropping");
            return Ok(Resolution::Stop(Decision::silent()));
        };

        let sender_user = self.sender_user(msg, identity).await?;
        let is_owner = sender_user.as_deref() == Some(owner);
        if !is_owner {
            tracing::debug!(
                channel = %msg.channel,
                bot_id = %config.bot_id,
                "non-owner message to personal bot, dropping"
            );
            return Ok(Resolution::Stop(Decision::silent()));
        }

        Ok(Resolution::Pass(InboundIdentity {
            bot_id: config.bot_id.clone(),
            channel_identity_id: identity.id.clone(),
            user_id: owner.to_string(),
            display_name: identity.display_name.clone(),
            avatar_url: identity.avatar_url.clone(),
            channel_config_id: config.id.clone(),
            force_reply: msg.conversation.is_direct(),
        }))
    }

    /// Resolves the sender to a linked user, trying the subject id first and
    /// then the fallback attributes in [`OWNER_ATTRIBUTE_ORDER`].
    async fn sender_user(
        &self,
        msg: &InboundMessage,
        identity: &ChannelIdentity,
    ) -> Result<Option<String>, ChannelError> {
        if let Some(user) = identity.user_id.clone() {
            return Ok(Some(user));
        }
        for attr in OWNER_ATTRIBUTE_ORDER {
            let Some(candidate) = msg.sender.attribute(attr) else {
                continue;
            };
            if candidate == msg.sender.subject_id {
                continue;
            }
            if let Some(found) = self.store.find_identity(&msg.channel, candidate).await? {
                if let Some(user) = found.user_id {
                    return Ok(Some(user));
                }
            }
        }
        Ok(None)
    }
}
