//! Chat engine contract: `stream_chat` returns a channel of JSON envelopes.
//!
//! Each chunk is an envelope `{type, delta, error, message, data, messages}`.
//! `text_delta` / `reasoning_delta` carry incremental text; `error` a terminal
//! failure; any envelope may carry a trailing `messages` array with the full
//! model transcript — consumers retain the last one seen.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::ChannelError;

/// Envelope chunk kinds.
pub mod chunk_kind {
    pub const TEXT_DELTA: &str = "text_delta";
    pub const REASONING_DELTA: &str = "reasoning_delta";
    pub const ERROR: &str = "error";
}

/// One streamed envelope from the engine.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatChunk {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub delta: String,
    #[serde(default)]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Full model transcript; the last array seen wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Value>>,
}

impl ChatChunk {
    pub fn text_delta(delta: impl Into<String>) -> Self {
        Self {
            kind: chunk_kind::TEXT_DELTA.to_string(),
            delta: delta.into(),
            ..Self::default()
        }
    }

    pub fn reasoning_delta(delta: impl Into<String>) -> Self {
        Self {
            kind: chunk_kind::REASONING_DELTA.to_string(),
            delta: delta.into(),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: chunk_kind::ERROR.to_string(),
            error: message.into(),
            ..Self::default()
        }
    }

    pub fn with_messages(mut self, messages: Vec<Value>) -> Self {
        self.messages = Some(messages);
        self
    }
}

/// One chat request against the engine.
#[derive(Clone, Debug, Default)]
pub struct ChatRequest {
    pub bot_id: String,
    pub chat_id: String,
    pub route_id: String,
    pub session_id: String,
    pub user_id: String,
    pub channel_identity_id: String,
    pub query: String,
    pub bearer_token: Option<String>,
    pub chat_token: Option<String>,
    /// The inbound user message is already stored; the engine must not
    /// double-store it.
    pub user_message_persisted: bool,
    pub metadata: Map<String, Value>,
}

/// Consumed conversational engine.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn stream_chat(
        &self,
        request: ChatRequest,
    ) -> Result<mpsc::Receiver<Result<ChatChunk, ChannelError>>, ChannelError>;
}

/// Scripted engine for tests: replays a fixed chunk sequence, optionally
/// ending with a stream-level error.
pub struct MockRunner {
    chunks: Vec<ChatChunk>,
    trailing_error: Option<String>,
    requests: std::sync::Mutex<Vec<ChatRequest>>,
}

impl MockRunner {
    pub fn new(chunks: Vec<ChatChunk>) -> Self {
        Self {
            chunks,
            trailing_error: None,
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Streams the text as one delta and finishes with a transcript whose last
    /// assistant message is the full text.
    pub fn replying(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(vec![
            ChatChunk::text_delta(text.clone()),
            ChatChunk::default().with_messages(vec![serde_json::json!({
                "role": "assistant",
                "content": text,
            })]),
        ])
    }

    pub fn with_trailing_error(mut self, message: impl Into<String>) -> Self {
        self.trailing_error = Some(message.into());
        self
    }

    /// Requests seen so far.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().expect("mock runner poisoned").clone()
    }
}

#[async_trait]
impl Runner for MockRunner {
    async fn stream_chat(
        &self,
        request: ChatRequest,
    ) -> Result<mpsc::Receiver<Result<ChatChunk, ChannelError>>, ChannelError> {
        self.requests
            .lock()
            .expect("mock runner poisoned")
            .push(request);
        let (tx, rx) = mpsc::channel(16);
        let chunks = self.chunks.clone();
        let trailing = self.trailing_error.clone();
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            if let Some(message) = trailing {
                let _ = tx.send(Err(ChannelError::Engine(message))).await;
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_envelope_parses() {
        let raw = r#"{"type":"text_delta","delta":"hi","messages":[{"role":"assistant","content":"hi"}]}"#;
        let chunk: ChatChunk = serde_json::from_str(raw).unwrap();
        assert_eq!(chunk.kind, chunk_kind::TEXT_DELTA);
        assert_eq!(chunk.delta, "hi");
        assert_eq!(chunk.messages.as_ref().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn mock_runner_replays_script() {
        let runner = MockRunner::replying("hello there");
        let mut rx = runner.stream_chat(ChatRequest::default()).await.unwrap();
        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.delta, "hello there");
        let second = rx.recv().await.unwrap().unwrap();
        assert!(second.messages.is_some());
        assert!(rx.recv().await.is_none());
        assert_eq!(runner.requests().len(), 1);
    }

    #[tokio::test]
    async fn mock_runner_trailing_error() {
        let runner = MockRunner::new(vec![ChatChunk::text_delta("x")])
            .with_trailing_error("backend exploded");
        let mut rx = runner.stream_chat(ChatRequest::default()).await.unwrap();
        assert!(rx.recv().await.unwrap().is_ok());
        let err = rx.recv().await.unwrap().unwrap_err();
        assert!(matches!(err, ChannelError::Engine(_)));
    }
}
