//! Reply extraction and filtering: query building, trigger helpers, NO_REPLY
//! suppression, markdown inference, tool-sent duplicate detection.

use std::sync::OnceLock;

use regex::RegexSet;
use serde_json::Value;

use crate::message::Message;

/// Marker the engine uses to decline replying.
pub const NO_REPLY_TOKEN: &str = "NO_REPLY";

/// Minimum collapsed length for duplicate-of-tool-text suppression.
const DUPLICATE_MIN_LEN: usize = 10;

/// Builds the engine query: trimmed plain text plus one
/// `[attachment:<kind>] <label>` line per attachment.
pub fn build_query(message: &Message) -> String {
    let mut query = message.plain_text().trim().to_string();
    for attachment in &message.attachments {
        let line = format!(
            "[attachment:{}] {}",
            attachment.effective_kind().as_str(),
            attachment.label()
        );
        if query.is_empty() {
            query = line;
        } else {
            query.push('\n');
            query.push_str(&line);
        }
    }
    query
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// True when `NO_REPLY` sits at a word boundary at the start or end of the
/// trimmed text.
pub fn is_no_reply(text: &str) -> bool {
    let t = text.trim();
    if t == NO_REPLY_TOKEN {
        return true;
    }
    if let Some(rest) = t.strip_prefix(NO_REPLY_TOKEN) {
        if !rest.chars().next().map(is_word_char).unwrap_or(false) {
            return true;
        }
    }
    if let Some(rest) = t.strip_suffix(NO_REPLY_TOKEN) {
        if !rest.chars().next_back().map(is_word_char).unwrap_or(false) {
            return true;
        }
    }
    false
}

fn markdown_patterns() -> &'static RegexSet {
    static PATTERNS: OnceLock<RegexSet> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        RegexSet::new([
            r"(?m)^#{1,6}\s",          // headings
            r"\*\*[^*\n]+\*\*",        // bold
            r"```",                    // fenced code
            r"`[^`\n]+`",              // inline code
            r"\[[^\]\n]+\]\([^)\n]+\)", // links
            r"(?m)^\s*[-*+]\s",        // bullet lists
            r"(?m)^\s*\d+\.\s",        // ordered lists
            r"(?m)^>\s",               // block quotes
        ])
        .expect("static markdown pattern set")
    })
}

/// Small pattern set: headings, emphasis, code, links, lists, quotes.
pub fn looks_like_markdown(text: &str) -> bool {
    markdown_patterns().is_match(text)
}

/// Collapses all whitespace runs to single spaces.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// True when the candidate reply duplicates a text already sent via a
/// `send_message` tool call: collapsed substring either way, minimum length
/// applied after collapsing.
pub fn duplicates_tool_text(candidate: &str, tool_texts: &[String]) -> bool {
    let collapsed = collapse_whitespace(candidate);
    if collapsed.len() < DUPLICATE_MIN_LEN {
        return false;
    }
    tool_texts.iter().any(|tool_text| {
        let tool = collapse_whitespace(tool_text);
        if tool.len() < DUPLICATE_MIN_LEN {
            return false;
        }
        collapsed.contains(&tool) || tool.contains(&collapsed)
    })
}

/// A `send_message` tool call found in the engine transcript.
#[derive(Clone, Debug, Default)]
pub struct SendMessageCall {
    pub platform: Option<String>,
    pub target: Option<String>,
    pub text: String,
}

fn value_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| {
        value
            .get(k)
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|s| !s.trim().is_empty())
    })
}

/// Scans transcript messages for `send_message` tool calls. Arguments may be
/// a JSON object or a JSON-encoded string.
pub fn send_message_calls(messages: &[Value]) -> Vec<SendMessageCall> {
    let mut out = Vec::new();
    for message in messages {
        let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) else {
            continue;
        };
        for call in tool_calls {
            let function = call.get("function").unwrap_or(call);
            let name = function
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if name != "send_message" {
                continue;
            }
            let arguments = function.get("arguments").cloned().unwrap_or(Value::Null);
            let arguments = match arguments {
                Value::String(raw) => serde_json::from_str::<Value>(&raw).unwrap_or(Value::Null),
                other => other,
            };
            out.push(SendMessageCall {
                platform: value_str(&arguments, &["platform", "channel"]),
                target: value_str(&arguments, &["target", "chat_id", "conversation_id"]),
                text: value_str(&arguments, &["text", "message", "content"]).unwrap_or_default(),
            });
        }
    }
    out
}

/// Assistant outputs: the trailing run of assistant messages in the
/// transcript, as plain strings. Content may be a string or an array of
/// `{type: "text", text}` blocks.
pub fn extract_assistant_texts(messages: &[Value]) -> Vec<String> {
    let mut tail = Vec::new();
    for message in messages.iter().rev() {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("");
        if role != "assistant" {
            break;
        }
        if let Some(text) = content_text(message.get("content")) {
            if !text.trim().is_empty() {
                tail.push(text);
            }
        }
    }
    tail.reverse();
    tail
}

fn content_text(content: Option<&Value>) -> Option<String> {
    match content? {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let joined = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            Some(joined)
        }
        _ => None,
    }
}
