//! Channel message model: text, rich parts, attachments, actions, targets.
//!
//! One [`Message`] type flows both directions; inbound-only context
//! (sender, conversation, bot) lives in [`inbound`].

pub mod inbound;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message text format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    Plain,
    Markdown,
    Rich,
}

/// Inline styling on a text part.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartStyle {
    Bold,
    Italic,
    Strikethrough,
    Code,
}

/// One element of a rich message body.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        styles: Vec<PartStyle>,
    },
    Link {
        text: String,
        url: String,
    },
    CodeBlock {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
    Mention {
        subject_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    Emoji {
        name: String,
    },
}

impl Part {
    /// Plain-text projection of this part.
    pub fn plain_text(&self) -> String {
        match self {
            Part::Text { text, .. } => text.clone(),
            Part::Link { text, url } => {
                if text.is_empty() {
                    url.clone()
                } else {
                    text.clone()
                }
            }
            Part::CodeBlock { code, .. } => code.clone(),
            Part::Mention {
                subject_id,
                display_name,
            } => display_name.clone().unwrap_or_else(|| subject_id.clone()),
            Part::Emoji { name } => format!(":{name}:"),
        }
    }
}

/// Attachment payload kind, inferred from MIME type first, file extension second.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Audio,
    Video,
    Voice,
    File,
    Gif,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Audio => "audio",
            AttachmentKind::Video => "video",
            AttachmentKind::Voice => "voice",
            AttachmentKind::File => "file",
            AttachmentKind::Gif => "gif",
        }
    }

    /// True for payloads that need the `media` capability on top of `attachments`.
    pub fn is_media(&self) -> bool {
        matches!(
            self,
            AttachmentKind::Audio | AttachmentKind::Video | AttachmentKind::Voice | AttachmentKind::Gif
        )
    }

    /// Infers the kind from MIME type, falling back to the extension of
    /// `reference` (a file name or URL). Unknown inputs yield `File`.
    pub fn infer(mime: Option<&str>, reference: Option<&str>) -> Self {
        if let Some(mime) = mime {
            let mime = mime.trim().to_ascii_lowercase();
            if mime == "image/gif" {
                return AttachmentKind::Gif;
            }
            if let Some(prefix) = mime.split('/').next() {
                match prefix {
                    "image" => return AttachmentKind::Image,
                    "audio" => return AttachmentKind::Audio,
                    "video" => return AttachmentKind::Video,
                    _ => {}
                }
            }
        }
        if let Some(reference) = reference {
            let ext = reference
                .rsplit('.')
                .next()
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase();
            match ext.as_str() {
                "png" | "jpg" | "jpeg" | "webp" | "bmp" | "heic" => return AttachmentKind::Image,
                "gif" => return AttachmentKind::Gif,
                "mp3" | "wav" | "flac" | "m4a" => return AttachmentKind::Audio,
                "ogg" | "oga" | "amr" => return AttachmentKind::Voice,
                "mp4" | "mov" | "mkv" | "webm" => return AttachmentKind::Video,
                _ => {}
            }
        }
        AttachmentKind::File
    }
}

/// One attachment on a message. `reference` is a platform file id or URL.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<AttachmentKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Attachment {
    /// Kind as stored, or inferred from MIME/extension.
    pub fn effective_kind(&self) -> AttachmentKind {
        self.kind
            .unwrap_or_else(|| AttachmentKind::infer(self.mime.as_deref(), self.reference.as_deref()))
    }

    /// Human label: name, else reference, else `unknown`.
    pub fn label(&self) -> &str {
        self.name
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or(self.reference.as_deref())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("unknown")
    }
}

/// Interactive action (button) attached to a message.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Thread the message belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRef {
    pub id: String,
}

/// Delivery address on a platform; normalization is adapter-supplied.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl Target {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: None,
            thread_id: None,
        }
    }
}

/// Reference to the message being replied to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRef {
    pub target: Target,
    pub message_id: String,
}

/// A channel message.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<ThreadRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyRef>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Message {
    /// Plain-text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Markdown message.
    pub fn markdown(text: impl Into<String>) -> Self {
        Self {
            format: Some(Format::Markdown),
            text: text.into(),
            ..Self::default()
        }
    }

    /// True iff text is blank and parts, attachments, and actions are all empty.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
            && self.parts.is_empty()
            && self.attachments.is_empty()
            && self.actions.is_empty()
    }

    /// Plain-text projection: `text`, else concatenated part texts.
    pub fn plain_text(&self) -> String {
        if !self.text.is_empty() {
            return self.text.clone();
        }
        self.parts
            .iter()
            .map(Part::plain_text)
            .collect::<Vec<_>>()
            .join("")
    }
}

/// A message addressed to a target.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub target: Target,
    pub message: Message,
}

impl OutboundMessage {
    pub fn new(target: Target, message: Message) -> Self {
        Self { target, message }
    }
}
