//! Runtime control messages.
//!
//! Operators publish either a bare literal (`pause`, `resume`, `stop`) or a
//! JSON command (`{"command": "set_workers", "count": n}`) on the control
//! topic. Payloads are decoded once at the boundary into [`ControlMessage`];
//! anything unrecognized becomes [`ControlMessage::Ignored`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Worker pool size, always within `[WorkerCount::MIN, WorkerCount::MAX]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerCount(usize);

impl WorkerCount {
    pub const MIN: usize = 1;
    pub const MAX: usize = 8;

    /// Create a worker count, clamping into the allowed range.
    pub fn clamped(count: i64) -> Self {
        let clamped = count.clamp(Self::MIN as i64, Self::MAX as i64);
        Self(clamped as usize)
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

impl Default for WorkerCount {
    fn default() -> Self {
        Self(2)
    }
}

impl fmt::Display for WorkerCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Decoded control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Pause,
    Resume,
    Stop,
    SetWorkers(WorkerCount),
    /// Payload was not a recognized command
    Ignored,
}

#[derive(Debug, Serialize, Deserialize)]
struct StructuredCommand {
    command: String,
    /// Integer, or a number some producers send as a string
    count: serde_json::Value,
}

fn coerce_count(count: &serde_json::Value) -> Option<i64> {
    match count {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

const SET_WORKERS: &str = "set_workers";

impl ControlMessage {
    /// Decode a raw payload from the control topic.
    ///
    /// Structured JSON is tried first; on failure the payload is compared
    /// against the plain literals.
    pub fn parse(payload: &str) -> Self {
        let payload = payload.trim();

        if let Ok(cmd) = serde_json::from_str::<StructuredCommand>(payload) {
            if cmd.command == SET_WORKERS {
                if let Some(count) = coerce_count(&cmd.count) {
                    return ControlMessage::SetWorkers(WorkerCount::clamped(count));
                }
            }
        }

        match payload {
            "pause" => ControlMessage::Pause,
            "resume" => ControlMessage::Resume,
            "stop" => ControlMessage::Stop,
            _ => ControlMessage::Ignored,
        }
    }

    /// Encode as a control-topic payload. `Ignored` has no wire form.
    pub fn to_payload(&self) -> Option<String> {
        match self {
            ControlMessage::Pause => Some("pause".to_string()),
            ControlMessage::Resume => Some("resume".to_string()),
            ControlMessage::Stop => Some("stop".to_string()),
            ControlMessage::SetWorkers(count) => serde_json::to_string(&StructuredCommand {
                command: SET_WORKERS.to_string(),
                count: serde_json::Value::from(count.get()),
            })
            .ok(),
            ControlMessage::Ignored => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_literals() {
        assert_eq!(ControlMessage::parse("pause"), ControlMessage::Pause);
        assert_eq!(ControlMessage::parse("resume"), ControlMessage::Resume);
        assert_eq!(ControlMessage::parse("stop\n"), ControlMessage::Stop);
    }

    #[test]
    fn test_parse_set_workers_clamps() {
        assert_eq!(
            ControlMessage::parse(r#"{"command":"set_workers","count":4}"#),
            ControlMessage::SetWorkers(WorkerCount::clamped(4))
        );
        assert_eq!(
            ControlMessage::parse(r#"{"command":"set_workers","count":32}"#),
            ControlMessage::SetWorkers(WorkerCount::clamped(8))
        );
        assert_eq!(
            ControlMessage::parse(r#"{"command":"set_workers","count":-3}"#),
            ControlMessage::SetWorkers(WorkerCount::clamped(1))
        );
    }

    #[test]
    fn test_parse_set_workers_numeric_string() {
        assert_eq!(
            ControlMessage::parse(r#"{"command":"set_workers","count":"4"}"#),
            ControlMessage::SetWorkers(WorkerCount::clamped(4))
        );
        assert_eq!(
            ControlMessage::parse(r#"{"command":"set_workers","count":3.0}"#),
            ControlMessage::SetWorkers(WorkerCount::clamped(3))
        );
    }

    #[test]
    fn test_unknown_payloads_are_ignored() {
        for payload in [
            "",
            "PAUSE",
            "restart",
            "\"pause\"",
            r#"{"command":"set_workers"}"#,
            r#"{"command":"set_workers","count":"four"}"#,
            r#"{"command":"set_workers","count":null}"#,
            r#"{"command":"reboot","count":2}"#,
            "{not json",
        ] {
            assert_eq!(ControlMessage::parse(payload), ControlMessage::Ignored, "{payload}");
        }
    }

    #[test]
    fn test_payload_encoding_decodes_back() {
        for msg in [
            ControlMessage::Pause,
            ControlMessage::Resume,
            ControlMessage::Stop,
            ControlMessage::SetWorkers(WorkerCount::clamped(5)),
        ] {
            let payload = msg.to_payload().unwrap();
            assert_eq!(ControlMessage::parse(&payload), msg);
        }
        assert!(ControlMessage::Ignored.to_payload().is_none());
    }

    #[test]
    fn test_worker_count_bounds() {
        assert_eq!(WorkerCount::clamped(0).get(), 1);
        assert_eq!(WorkerCount::clamped(8).get(), 8);
        assert_eq!(WorkerCount::clamped(9).get(), 8);
        assert_eq!(WorkerCount::default().get(), 2);
    }
}
