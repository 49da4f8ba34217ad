//! Event types for the run timeline.
//!
//! Every state transition of a run is recorded as an immutable event in an
//! append-only, per-run log. Sequence numbers are assigned by the timeline at
//! append time and are gapless, starting at 1.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::phase::Phase;

/// A single event in a run's timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The run this event belongs to
    pub run_id: Uuid,

    /// Position in the run's timeline (1-based, gapless)
    pub seq: u64,

    /// When the event was appended
    pub timestamp: DateTime<Utc>,

    /// What happened
    pub kind: EventKind,

    /// Structured details (phase, attempt, error, ...)
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    /// Create an event stamped with the current time
    pub fn new(run_id: Uuid, seq: u64, kind: EventKind, payload: Value) -> Self {
        Self {
            run_id,
            seq,
            timestamp: Utc::now(),
            kind,
            payload,
        }
    }

    /// Phase named in the payload, if any
    pub fn phase(&self) -> Option<Phase> {
        self.payload
            .get("phase")
            .and_then(|p| serde_json::from_value(p.clone()).ok())
    }

    /// Whether this is a `phase_failed` event that ended the run
    pub fn is_fatal(&self) -> bool {
        self.kind == EventKind::PhaseFailed
            && self
                .payload
                .get("fatal")
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }

    /// Whether no further events can follow this one
    pub fn is_terminal(&self) -> bool {
        match self.kind {
            EventKind::Finalized | EventKind::Rejected | EventKind::Cancelled => true,
            EventKind::PhaseFailed => self.is_fatal(),
            _ => false,
        }
    }
}

/// Kinds of timeline events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// An executor call for a phase is about to start
    PhaseStarted,

    /// A phase finished and its checkpoint is durable
    PhaseCompleted,

    /// A phase attempt failed (`fatal` in the payload says whether the run ended)
    PhaseFailed,

    /// The run paused at a gated phase boundary
    AwaitingApproval,

    /// A pending approval was granted
    Approved,

    /// A pending approval was denied; the run failed
    Rejected,

    /// QA failed its threshold and content is being generated again
    Regenerating,

    /// The run completed
    Finalized,

    /// The run was cancelled
    Cancelled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PhaseStarted => "phase_started",
            EventKind::PhaseCompleted => "phase_completed",
            EventKind::PhaseFailed => "phase_failed",
            EventKind::AwaitingApproval => "awaiting_approval",
            EventKind::Approved => "approved",
            EventKind::Rejected => "rejected",
            EventKind::Regenerating => "regenerating",
            EventKind::Finalized => "finalized",
            EventKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            Uuid::new_v4(),
            1,
            EventKind::PhaseStarted,
            json!({ "phase": "brainstorm", "attempt": 1 }),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"phase_started\""));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.phase(), Some(Phase::Brainstorm));
    }

    #[test]
    fn test_terminal_events() {
        let run_id = Uuid::new_v4();
        let recoverable = Event::new(
            run_id,
            3,
            EventKind::PhaseFailed,
            json!({ "phase": "research", "fatal": false }),
        );
        let fatal = Event::new(
            run_id,
            4,
            EventKind::PhaseFailed,
            json!({ "phase": "research", "fatal": true }),
        );

        assert!(!recoverable.is_terminal());
        assert!(fatal.is_terminal());
        assert!(Event::new(run_id, 5, EventKind::Finalized, Value::Null).is_terminal());
        assert!(!Event::new(run_id, 5, EventKind::Regenerating, Value::Null).is_terminal());
    }

    #[test]
    fn test_missing_payload_defaults_to_null() {
        let raw = format!(
            r#"{{"run_id":"{}","seq":7,"timestamp":"2026-01-01T00:00:00Z","kind":"approved"}}"#,
            Uuid::nil()
        );
        let parsed: Event = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.kind, EventKind::Approved);
        assert!(parsed.payload.is_null());
        assert_eq!(parsed.phase(), None);
    }
}
