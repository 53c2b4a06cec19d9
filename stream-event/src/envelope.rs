//! Envelope (session_id, event_id) injected into each wire event.
//! `EnvelopeState` tracks the per-stream sequence and stamps each event.

use crate::event::WireEvent;
use serde_json::Value;

/// Envelope fields stamped onto each serialized event.
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    /// Session ID; constant within a stream.
    pub session_id: Option<String>,
    /// Per-event sequence number; monotonically increasing within a stream.
    pub event_id: Option<u64>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_event_id(mut self, id: u64) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Merges envelope fields into the given JSON object (top-level only).
    /// Does not overwrite existing keys.
    pub fn inject_into(&self, obj: &mut Value) {
        let Some(obj) = obj.as_object_mut() else {
            return;
        };
        if let Some(ref id) = self.session_id {
            obj.entry("session_id")
                .or_insert_with(|| Value::String(id.clone()));
        }
        if let Some(id) = self.event_id {
            obj.entry("event_id")
                .or_insert_with(|| Value::Number(serde_json::Number::from(id)));
        }
    }
}

/// Envelope state for one stream: session_id plus the next event_id.
pub struct EnvelopeState {
    pub session_id: String,
    pub next_event_id: u64,
}

impl EnvelopeState {
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            next_event_id: 1,
        }
    }

    /// Injects envelope into the event value and advances the sequence.
    pub fn inject_into(&mut self, value: &mut Value) {
        let env = Envelope::new()
            .with_session_id(&self.session_id)
            .with_event_id(self.next_event_id);
        self.next_event_id += 1;
        env.inject_into(value);
    }
}

/// Converts a wire event to JSON and injects the envelope using the given state.
/// Returns the final value (type + payload + session_id, event_id).
pub fn to_json(event: &WireEvent, state: &mut EnvelopeState) -> Result<Value, serde_json::Error> {
    let mut value = event.to_value()?;
    state.inject_into(&mut value);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{StatusState, WireEvent};

    #[test]
    fn envelope_inject() {
        let mut obj = serde_json::json!({"type":"delta","text":"hi"});
        let env = Envelope::new().with_session_id("sess-1").with_event_id(1);
        env.inject_into(&mut obj);
        assert_eq!(obj["session_id"], "sess-1");
        assert_eq!(obj["event_id"], 1);
        assert_eq!(obj["type"], "delta");
    }

    #[test]
    fn envelope_does_not_overwrite() {
        let mut obj = serde_json::json!({"type":"delta","session_id":"keep"});
        let env = Envelope::new().with_session_id("sess-1").with_event_id(7);
        env.inject_into(&mut obj);
        assert_eq!(obj["session_id"], "keep");
        assert_eq!(obj["event_id"], 7);
    }

    #[test]
    fn to_json_sequences_event_ids() {
        let mut state = EnvelopeState::new("tg:bot-1:chat-9".to_string());
        let a = to_json(
            &WireEvent::Status {
                state: StatusState::Started,
            },
            &mut state,
        )
        .unwrap();
        let b = to_json(
            &WireEvent::Delta {
                text: "x".into(),
                phase: None,
            },
            &mut state,
        )
        .unwrap();
        assert_eq!(a["event_id"], 1);
        assert_eq!(b["event_id"], 2);
        assert_eq!(a["session_id"], "tg:bot-1:chat-9");
        assert_eq!(b["session_id"], "tg:bot-1:chat-9");
    }
}
