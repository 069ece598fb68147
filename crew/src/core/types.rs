//! Shared deterministic types for crew core logic.
//!
//! These types define stable contracts between core components and the
//! orchestration layer. They must not depend on external state or I/O.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task file.
///
/// Transitions are monotonic: `Pending -> Claimed -> {Completed | Failed}`.
/// A terminal task is never reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Whether this status is terminal (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Worker-declared outcome written into the done-signal file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoneStatus {
    Completed,
    Failed,
}

/// Payload of a worker's done-signal file.
///
/// The done signal is the worker's only structured return channel; the
/// pane's text stream is never parsed as a protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneSignal {
    pub status: DoneStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// How a worker's agent binary receives its initial instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// The full instruction is inlined as a process argument. Required when
    /// the agent cannot reliably receive simulated keystrokes (alternate
    /// screen) or when its file-visibility rules may exclude the inbox file.
    Prompt,
    /// The agent is launched bare; the instruction is delivered as literal
    /// keystrokes (referencing the inbox path) once the pane looks ready.
    Interactive,
}

/// Non-fatal advisory attached to an otherwise successful operation.
///
/// Fail-open heuristics (readiness timeout, untrusted binary path) surface
/// here so a stricter caller can escalate them without changing the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Advisory {
    /// The pane never matched the ready pattern within its window; the
    /// instruction was sent anyway.
    ReadinessTimeout { pane: String, timeout_ms: u64 },
    /// The resolved agent binary lives outside every trusted prefix.
    UntrustedBinary { binary: String, resolved: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_terminality() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Claimed.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn done_signal_round_trips_without_summary() {
        let signal = DoneSignal {
            status: DoneStatus::Completed,
            summary: None,
        };
        let json = serde_json::to_string(&signal).expect("serialize");
        assert_eq!(json, r#"{"status":"completed"}"#);
        let parsed: DoneSignal = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, signal);
    }

    #[test]
    fn advisory_serializes_with_kind_tag() {
        let advisory = Advisory::ReadinessTimeout {
            pane: "%3".to_string(),
            timeout_ms: 15000,
        };
        let json = serde_json::to_string(&advisory).expect("serialize");
        assert!(json.contains(r#""kind":"readiness_timeout""#));
    }
}
