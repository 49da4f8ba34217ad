//! Domain types for the deckrun pipeline.
//!
//! This module contains the core data structures:
//! - Phase: the ordered pipeline stages
//! - Run: pipeline execution state
//! - Checkpoint: durable per-phase snapshots
//! - Events: immutable timeline records
//! - Approval: pending human decisions
//! - Quality: the QA report consulted for regeneration

pub mod approval;
pub mod checkpoint;
pub mod events;
pub mod phase;
pub mod quality;
pub mod run;

// Re-export commonly used types
pub use approval::{ApprovalRequest, Resolution};
pub use checkpoint::{Checkpoint, CheckpointMeta, Snapshot};
pub use events::{Event, EventKind};
pub use phase::{Phase, UnknownPhase};
pub use quality::QualityReport;
pub use run::{AttemptCounts, FailureReason, Run, RunOptions, RunStatus, RunSummary, StateMap};
