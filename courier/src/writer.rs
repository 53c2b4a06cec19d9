//! Message persistence contract: stores inbound user messages with role,
//! JSON-encoded content, and routing metadata.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::ChannelError;

/// Trigger-mode metadata values.
pub mod trigger_mode {
    /// Message persisted for history only; no reply was produced.
    pub const PASSIVE_SYNC: &str = "passive_sync";
    /// Message entered the reply pipeline.
    pub const ACTIVE_CHAT: &str = "active_chat";
}

/// One persisted message.
#[derive(Clone, Debug)]
pub struct PersistInput {
    pub role: String,
    /// JSON-encoded model message.
    pub content: Value,
    /// `route_id`, `platform`, `trigger_mode`, ...
    pub metadata: Map<String, Value>,
}

/// Consumed persistence contract.
#[async_trait]
pub trait MessageWriter: Send + Sync {
    async fn persist(&self, input: PersistInput) -> Result<(), ChannelError>;
}

/// Recording writer for tests.
#[derive(Default)]
pub struct InMemoryMessageWriter {
    records: Mutex<Vec<PersistInput>>,
}

impl InMemoryMessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PersistInput> {
        self.records.lock().expect("message writer poisoned").clone()
    }
}

#[async_trait]
impl MessageWriter for InMemoryMessageWriter {
    async fn persist(&self, input: PersistInput) -> Result<(), ChannelError> {
        self.records
            .lock()
            .expect("message writer poisoned")
            .push(input);
        Ok(())
    }
}
