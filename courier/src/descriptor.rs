//! Per-type adapter metadata: capability matrix, outbound policy, config schemas.
//!
//! A [`Descriptor`] is what the registry hands to callers that must decide
//! whether a message can be delivered on a channel (capability gating in
//! [`crate::outbound`]) and how to shape it (chunk limit, media order, retries).

use serde::{Deserialize, Serialize};

/// Opaque platform identifier, e.g. `"telegram"`. Construction trims and
/// ASCII-lowercases so lookups are case-insensitive.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ChannelType(String);

impl ChannelType {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for ChannelType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ChannelType::new(raw))
    }
}

/// Feature matrix for one channel type. Gates outbound delivery.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub text: bool,
    pub markdown: bool,
    pub rich_text: bool,
    pub attachments: bool,
    /// Audio/video/voice/gif payloads (stricter than plain attachments).
    pub media: bool,
    pub buttons: bool,
    pub threads: bool,
    pub reply: bool,
    pub streaming: bool,
    pub edit: bool,
    pub unsend: bool,
    pub native_commands: bool,
    /// Platform can only stream whole blocks, not token deltas.
    pub block_streaming: bool,
    /// Conversation kinds the platform exposes (e.g. `p2p`, `group`).
    #[serde(default)]
    pub chat_types: Vec<String>,
}

impl Capabilities {
    /// Everything on; the usual starting point for rich test adapters.
    pub fn full() -> Self {
        Self {
            text: true,
            markdown: true,
            rich_text: true,
            attachments: true,
            media: true,
            buttons: true,
            threads: true,
            reply: true,
            streaming: true,
            edit: true,
            unsend: true,
            native_commands: true,
            block_streaming: false,
            chat_types: vec!["p2p".into(), "group".into()],
        }
    }

    /// Plain-text-only channel.
    pub fn text_only() -> Self {
        Self {
            text: true,
            ..Self::default()
        }
    }
}

/// Which chunker the outbound pipeline uses for long text.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkerMode {
    /// Split on lines.
    #[default]
    Text,
    /// Split on `\n\n` paragraphs.
    Markdown,
}

/// Relative ordering of media and text messages in one outbound batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaOrder {
    #[default]
    MediaFirst,
    TextFirst,
}

/// Per-type outbound shaping policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboundPolicy {
    /// Chunk limit in runes (Unicode scalar values); 0 disables chunking.
    pub text_chunk_limit: usize,
    pub media_order: MediaOrder,
    pub retry_max: u32,
    pub retry_backoff_ms: u64,
    pub chunker_mode: ChunkerMode,
}

impl Default for OutboundPolicy {
    fn default() -> Self {
        Self {
            text_chunk_limit: 2000,
            media_order: MediaOrder::MediaFirst,
            retry_max: 3,
            retry_backoff_ms: 500,
            chunker_mode: ChunkerMode::Text,
        }
    }
}

/// One field of a config schema.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// Field kind as shown to config UIs (`string`, `secret`, `bool`, ...).
    pub kind: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            required: true,
            label: None,
        }
    }

    pub fn optional(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            required: false,
            label: None,
        }
    }
}

/// Versioned field map describing a channel (or per-user) configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigSchema {
    pub version: u32,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

/// What a delivery target looks like on this platform.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Target kinds the adapter accepts (e.g. `chat_id`, `open_id`).
    #[serde(default)]
    pub kinds: Vec<String>,
    /// Human hint for config UIs.
    #[serde(default)]
    pub hint: String,
}

/// Per-type metadata registered alongside an adapter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Descriptor {
    pub display_name: String,
    /// Type needs no per-bot credentials; configs are synthesized.
    pub configless: bool,
    pub capabilities: Capabilities,
    pub outbound: OutboundPolicy,
    pub config_schema: ConfigSchema,
    pub user_config_schema: ConfigSchema,
    pub target: TargetSpec,
}

impl Descriptor {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            configless: false,
            capabilities: Capabilities::default(),
            outbound: OutboundPolicy::default(),
            config_schema: ConfigSchema::default(),
            user_config_schema: ConfigSchema::default(),
            target: TargetSpec::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_outbound(mut self, outbound: OutboundPolicy) -> Self {
        self.outbound = outbound;
        self
    }

    pub fn configless(mut self) -> Self {
        self.configless = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_type_normalizes() {
        assert_eq!(ChannelType::new("  Telegram "), ChannelType::new("telegram"));
        assert_eq!(ChannelType::new("FEISHU").as_str(), "feishu");
    }

    #[test]
    fn outbound_policy_defaults() {
        let p = OutboundPolicy::default();
        assert_eq!(p.text_chunk_limit, 2000);
        assert_eq!(p.media_order, MediaOrder::MediaFirst);
        assert_eq!(p.retry_max, 3);
        assert_eq!(p.retry_backoff_ms, 500);
        assert_eq!(p.chunker_mode, ChunkerMode::Text);
    }

    #[test]
    fn channel_type_deserializes_normalized() {
        let ty: ChannelType = serde_json::from_str("\" Discord \"").unwrap();
        assert_eq!(ty.as_str(), "discord");
    }
}
