//! SSE framing: each event is one `data: <json>\n\n` line.
//! A stream ends after `status:completed` / `status:failed` or `error`.

use crate::envelope::{to_json, EnvelopeState};
use crate::event::WireEvent;

/// Serializes one event as a single SSE data line with envelope applied.
pub fn to_sse_line(
    event: &WireEvent,
    state: &mut EnvelopeState,
) -> Result<String, serde_json::Error> {
    let value = to_json(event, state)?;
    Ok(format!("data: {}\n\n", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StatusState;

    #[test]
    fn one_data_line_per_event() {
        let mut state = EnvelopeState::new("s".to_string());
        let line = to_sse_line(
            &WireEvent::Status {
                state: StatusState::Started,
            },
            &mut state,
        )
        .unwrap();
        assert!(line.starts_with("data: {"));
        assert!(line.ends_with("\n\n"));
        assert_eq!(line.matches('\n').count(), 2);

        let json = line.trim_start_matches("data: ").trim_end();
        let v: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(v["type"], "status");
        assert_eq!(v["state"], "started");
        assert_eq!(v["event_id"], 1);
    }

    #[test]
    fn terminal_line_carries_completed() {
        let mut state = EnvelopeState::new("s".to_string());
        let ev = WireEvent::Status {
            state: StatusState::Completed,
        };
        assert!(ev.is_terminal());
        let line = to_sse_line(&ev, &mut state).unwrap();
        assert!(line.contains("\"completed\""));
    }
}
