//! Outbound pipeline: normalization, chunking, media/text ordering, capability
//! gating, and delivery with retries.
//!
//! [`plan`] turns one outbound message into the ordered list actually sent;
//! [`deliver`] runs the plan against an adapter. Gate failures never retry;
//! transport failures retry with linearly-increasing backoff.

pub mod chunker;

use std::time::Duration;

use crate::adapter::{Adapter, Sender};
use crate::descriptor::{Capabilities, ChannelType, ChunkerMode, MediaOrder, OutboundPolicy};
use crate::error::ChannelError;
use crate::message::{Format, Message, OutboundMessage};
use crate::store::ChannelConfig;

pub use chunker::{chunk_markdown_text, chunk_text};

/// Expands one outbound message into the ordered send list.
///
/// - Format is inferred when absent: `rich` with parts, else `plain` with text.
/// - Text is chunked when parts are empty, text is non-blank, and the limit is
///   positive; actions ride only the last chunk; every chunk inherits
///   id/format/thread/reply/metadata.
/// - Attachments move to their own message, ordered per
///   [`MediaOrder`].
pub fn plan(
    message: &OutboundMessage,
    policy: &OutboundPolicy,
) -> Result<Vec<OutboundMessage>, ChannelError> {
    let m = &message.message;
    if m.is_empty() {
        return Err(ChannelError::EmptyMessage);
    }

    let format = m.format.or_else(|| {
        if !m.parts.is_empty() {
            Some(Format::Rich)
        } else if !m.text.trim().is_empty() {
            Some(Format::Plain)
        } else {
            None
        }
    });

    let mut text_list: Vec<OutboundMessage> = Vec::new();
    let text_blank = m.text.trim().is_empty();
    if m.parts.is_empty() && !text_blank && policy.text_chunk_limit > 0 {
        let mode = if format == Some(Format::Markdown) {
            ChunkerMode::Markdown
        } else {
            policy.chunker_mode
        };
        let chunks = match mode {
            ChunkerMode::Text => chunker::chunk_text(&m.text, policy.text_chunk_limit),
            ChunkerMode::Markdown => {
                chunker::chunk_markdown_text(&m.text, policy.text_chunk_limit)
            }
        };
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let part = Message {
                id: m.id.clone(),
                format,
                text: chunk,
                parts: Vec::new(),
                attachments: Vec::new(),
                actions: if i == last { m.actions.clone() } else { Vec::new() },
                thread: m.thread.clone(),
                reply: m.reply.clone(),
                metadata: m.metadata.clone(),
            };
            text_list.push(OutboundMessage::new(message.target.clone(), part));
        }
    } else {
        let mut stripped = m.clone();
        stripped.format = format;
        stripped.attachments = Vec::new();
        if !stripped.is_empty() {
            text_list.push(OutboundMessage::new(message.target.clone(), stripped));
        }
    }

    let mut media_list: Vec<OutboundMessage> = Vec::new();
    if !m.attachments.is_empty() {
        let media = Message {
            attachments: m.attachments.clone(),
            thread: m.thread.clone(),
            reply: m.reply.clone(),
            metadata: m.metadata.clone(),
            ..Message::default()
        };
        media_list.push(OutboundMessage::new(message.target.clone(), media));
    }

    let ordered: Vec<OutboundMessage> = match policy.media_order {
        MediaOrder::MediaFirst => media_list.into_iter().chain(text_list).collect(),
        MediaOrder::TextFirst => text_list.into_iter().chain(media_list).collect(),
    };
    if ordered.is_empty() {
        return Err(ChannelError::EmptyMessage);
    }
    Ok(ordered)
}

/// Verifies the message only uses features the channel has. A failed gate is
/// final; nothing is retried.
pub fn gate(
    message: &Message,
    caps: &Capabilities,
    channel: &ChannelType,
) -> Result<(), ChannelError> {
    let missing = |capability: &str| ChannelError::Capability {
        channel: channel.to_string(),
        capability: capability.to_string(),
    };

    let has_body = !message.text.trim().is_empty() || !message.parts.is_empty();
    if has_body {
        match message.format.unwrap_or(Format::Plain) {
            Format::Plain => {
                if !caps.text {
                    return Err(missing("text"));
                }
            }
            Format::Markdown => {
                if !caps.markdown && !caps.rich_text {
                    return Err(missing("markdown"));
                }
            }
            Format::Rich => {
                if !caps.rich_text {
                    return Err(missing("rich text"));
                }
            }
        }
    }
    if !message.parts.is_empty() && !caps.rich_text {
        return Err(missing("rich text"));
    }
    if !message.attachments.is_empty() {
        if !caps.attachments {
            return Err(missing("attachments"));
        }
        let needs_media = message
            .attachments
            .iter()
            .any(|a| a.effective_kind().is_media());
        if needs_media && !caps.media {
            return Err(missing("media"));
        }
    }
    if !message.actions.is_empty() && !caps.buttons {
        return Err(missing("buttons"));
    }
    if message.thread.is_some() && !caps.threads {
        return Err(missing("threads"));
    }
    if message.reply.is_some() && !caps.reply {
        return Err(missing("reply"));
    }
    Ok(())
}

/// Plans, gates, and sends one outbound message through the adapter.
pub async fn deliver(
    adapter: &dyn Adapter,
    config: &ChannelConfig,
    message: &OutboundMessage,
) -> Result<(), ChannelError> {
    let channel = adapter.channel_type();
    let descriptor = adapter.descriptor();
    let Some(sender) = adapter.sender() else {
        return Err(ChannelError::Capability {
            channel: channel.to_string(),
            capability: "sending".to_string(),
        });
    };
    let items = plan(message, &descriptor.outbound)?;
    for item in &items {
        gate(&item.message, &descriptor.capabilities, &channel)?;
        send_with_retry(sender, config, item, &descriptor.outbound, &channel).await?;
    }
    Ok(())
}

/// Sends with up to `retry_max` attempts, sleeping `(i+1) * retry_backoff_ms`
/// between them. The final failure wraps the last cause.
pub async fn send_with_retry(
    sender: &dyn Sender,
    config: &ChannelConfig,
    message: &OutboundMessage,
    policy: &OutboundPolicy,
    channel: &ChannelType,
) -> Result<(), ChannelError> {
    let attempts = policy.retry_max.max(1);
    let mut last: Option<ChannelError> = None;
    for i in 0..attempts {
        match sender.send(config, message).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(
                    channel = %channel,
                    config_id = %config.id,
                    attempt = i + 1,
                    error = %e,
                    "send attempt failed"
                );
                last = Some(e);
                if i + 1 < attempts {
                    tokio::time::sleep(Duration::from_millis(
                        u64::from(i + 1) * policy.retry_backoff_ms,
                    ))
                    .await;
                }
            }
        }
    }
    Err(ChannelError::SendRetriesExhausted {
        attempts,
        last: Box::new(last.unwrap_or(ChannelError::Transport("send failed".into()))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Action, Attachment, AttachmentKind, Target};

    fn outbound(message: Message) -> OutboundMessage {
        OutboundMessage::new(Target::new("t1"), message)
    }

    #[test]
    fn empty_message_is_an_error() {
        let err = plan(&outbound(Message::default()), &OutboundPolicy::default());
        assert!(matches!(err, Err(ChannelError::EmptyMessage)));
    }

    #[test]
    fn infers_plain_format() {
        let out = plan(&outbound(Message::text("hi")), &OutboundPolicy::default()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message.format, Some(Format::Plain));
    }

    #[test]
    fn chunking_keeps_actions_on_last_chunk() {
        let mut m = Message::text("aaa\nbbb\nccc\nddd");
        m.actions.push(Action {
            id: "a1".into(),
            label: "Go".into(),
            ..Action::default()
        });
        let policy = OutboundPolicy {
            text_chunk_limit: 10,
            ..OutboundPolicy::default()
        };
        let out = plan(&outbound(m), &policy).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].message.text, "aaa\nbbb");
        assert!(out[0].message.actions.is_empty());
        assert_eq!(out[1].message.text, "ccc\nddd");
        assert_eq!(out[1].message.actions.len(), 1);
    }

    #[test]
    fn media_first_ordering() {
        let mut m = Message::text("caption");
        m.attachments.push(Attachment {
            kind: Some(AttachmentKind::Image),
            ..Attachment::default()
        });
        let out = plan(&outbound(m.clone()), &OutboundPolicy::default()).unwrap();
        assert_eq!(out.len(), 2);
        assert!(!out[0].message.attachments.is_empty());
        assert!(out[0].message.text.is_empty());
        assert_eq!(out[1].message.text, "caption");

        let policy = OutboundPolicy {
            media_order: MediaOrder::TextFirst,
            ..OutboundPolicy::default()
        };
        let out = plan(&outbound(m), &policy).unwrap();
        assert_eq!(out[0].message.text, "caption");
        assert!(!out[1].message.attachments.is_empty());
    }

    #[test]
    fn markdown_format_picks_paragraph_chunker() {
        let m = Message::markdown("para one\n\npara two\n\npara three");
        let policy = OutboundPolicy {
            text_chunk_limit: 20,
            ..OutboundPolicy::default()
        };
        let out = plan(&outbound(m), &policy).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].message.text, "para one\n\npara two");
    }

    #[test]
    fn gate_rejects_unsupported_features() {
        let caps = Capabilities::text_only();
        let ty = ChannelType::new("basic");

        assert!(gate(&Message::text("ok"), &caps, &ty).is_ok());
        assert!(matches!(
            gate(&Message::markdown("# no"), &caps, &ty),
            Err(ChannelError::Capability { .. })
        ));

        let mut with_button = Message::text("hi");
        with_button.actions.push(Action {
            id: "b".into(),
            label: "x".into(),
            ..Action::default()
        });
        assert!(matches!(
            gate(&with_button, &caps, &ty),
            Err(ChannelError::Capability { .. })
        ));

        let mut voice = Message::default();
        voice.attachments.push(Attachment {
            kind: Some(AttachmentKind::Voice),
            ..Attachment::default()
        });
        let mut attach_only = Capabilities::text_only();
        attach_only.attachments = true;
        assert!(matches!(
            gate(&voice, &attach_only, &ty),
            Err(ChannelError::Capability { .. })
        ));
        attach_only.media = true;
        assert!(gate(&voice, &attach_only, &ty).is_ok());
    }

    #[test]
    fn markdown_allowed_via_rich_text() {
        let mut caps = Capabilities::text_only();
        caps.rich_text = true;
        assert!(gate(&Message::markdown("# ok"), &caps, &ChannelType::new("c")).is_ok());
    }
}
