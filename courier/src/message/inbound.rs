//! Inbound message context: sender identity, conversation, session identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::descriptor::ChannelType;
use crate::identity::InboundIdentity;
use crate::message::{Message, Target};

/// Raw sender triple as reported by the platform.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Identity {
    pub subject_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl Identity {
    pub fn new(subject_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            display_name: display_name.into(),
            attributes: Map::new(),
        }
    }

    /// String attribute lookup, blank values treated as absent.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }
}

/// Conversation kinds that count as one-on-one for the session identity.
const SOLO_KINDS: [&str; 3] = ["", "p2p", "private"];

/// Conversation kinds that count as direct for the reply trigger test.
const DIRECT_KINDS: [&str; 4] = ["", "p2p", "private", "direct"];

/// The conversation a message arrived in.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Platform conversation kind: `p2p`, `private`, `direct`, `group`, ...
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            thread_id: None,
            metadata: Map::new(),
        }
    }

    /// Direct conversations always trigger a reply.
    pub fn is_direct(&self) -> bool {
        let kind = self.kind.trim().to_ascii_lowercase();
        DIRECT_KINDS.contains(&kind.as_str())
    }

    /// One-on-one conversations omit the sender segment from the session id.
    fn is_solo(&self) -> bool {
        let kind = self.kind.trim().to_ascii_lowercase();
        SOLO_KINDS.contains(&kind.as_str())
    }
}

/// A message received from a platform, as handed to the inbound pipeline.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub channel: ChannelType,
    pub message: Message,
    pub bot_id: String,
    pub reply_target: Option<Target>,
    pub sender: Identity,
    pub conversation: Conversation,
    pub received_at: DateTime<Utc>,
    pub metadata: Map<String, Value>,
    /// Filled by the identity middleware once the sender has been resolved.
    pub identity: Option<InboundIdentity>,
}

impl InboundMessage {
    pub fn new(
        channel: ChannelType,
        bot_id: impl Into<String>,
        sender: Identity,
        conversation: Conversation,
        message: Message,
    ) -> Self {
        Self {
            channel,
            message,
            bot_id: bot_id.into(),
            reply_target: None,
            sender,
            conversation,
            received_at: Utc::now(),
            metadata: Map::new(),
            identity: None,
        }
    }

    /// Deterministic session identity: `platform:bot:conversation`, with the
    /// sender segment appended for anything that is not a one-on-one
    /// conversation.
    pub fn session_id(&self) -> String {
        let base = format!("{}:{}:{}", self.channel, self.bot_id, self.conversation.id);
        if self.conversation.is_solo() {
            base
        } else {
            format!("{}:{}", base, self.sender.subject_id)
        }
    }

    /// Boolean metadata lookup (`is_mentioned`, `is_reply_to_bot`, ...).
    pub fn metadata_flag(&self, key: &str) -> bool {
        self.metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}
