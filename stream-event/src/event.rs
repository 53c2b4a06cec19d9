//! Wire-level event types: top-level `type` tag + payload.
//! Variants that carry channel messages or attachments use `serde_json::Value`;
//! the bridge in courier serializes its typed message into that.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state carried by a `status` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    Started,
    Completed,
    Failed,
}

/// Wire shape for one stream event (type + payload).
/// Envelope (session_id, event_id) is applied separately.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    Status {
        state: StatusState,
    },
    Delta {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        phase: Option<String>,
    },
    ToolCallStart {
        name: String,
    },
    ToolCallEnd {
        name: String,
    },
    Attachment {
        attachment: Value,
    },
    Final {
        message: Value,
    },
    Error {
        message: String,
    },
}

impl WireEvent {
    /// Serializes this event to a JSON object (type + payload only; no envelope).
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// True when this event terminates its stream (`status:completed`,
    /// `status:failed`, or `error`).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WireEvent::Status {
                state: StatusState::Completed | StatusState::Failed
            } | WireEvent::Error { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_started_format() {
        let v = WireEvent::Status {
            state: StatusState::Started,
        }
        .to_value()
        .unwrap();
        assert_eq!(v["type"], "status");
        assert_eq!(v["state"], "started");
    }

    #[test]
    fn delta_omits_phase_when_none() {
        let v = WireEvent::Delta {
            text: "hi".into(),
            phase: None,
        }
        .to_value()
        .unwrap();
        assert_eq!(v["type"], "delta");
        assert_eq!(v["text"], "hi");
        assert!(v.get("phase").is_none());
    }

    #[test]
    fn delta_carries_reasoning_phase() {
        let v = WireEvent::Delta {
            text: "thinking".into(),
            phase: Some("reasoning".into()),
        }
        .to_value()
        .unwrap();
        assert_eq!(v["phase"], "reasoning");
    }

    #[test]
    fn final_wraps_message_value() {
        let v = WireEvent::Final {
            message: serde_json::json!({"text": "done"}),
        }
        .to_value()
        .unwrap();
        assert_eq!(v["type"], "final");
        assert_eq!(v["message"]["text"], "done");
    }

    #[test]
    fn terminal_classification() {
        assert!(WireEvent::Status {
            state: StatusState::Completed
        }
        .is_terminal());
        assert!(WireEvent::Error {
            message: "x".into()
        }
        .is_terminal());
        assert!(!WireEvent::Status {
            state: StatusState::Started
        }
        .is_terminal());
        assert!(!WireEvent::Delta {
            text: "t".into(),
            phase: None
        }
        .is_terminal());
    }

    #[test]
    fn round_trips_through_serde() {
        let ev = WireEvent::ToolCallStart {
            name: "send_message".into(),
        };
        let s = serde_json::to_string(&ev).unwrap();
        let back: WireEvent = serde_json::from_str(&s).unwrap();
        match back {
            WireEvent::ToolCallStart { name } => assert_eq!(name, "send_message"),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
