//! Core orchestration logic.
//!
//! This module contains:
//! - CheckpointStore: durable per-phase snapshots and run records
//! - EventTimeline: append-only per-run event logs with live readers
//! - ApprovalGate: pending human decisions
//! - PhaseRegistry: phase to executor lookup
//! - PipelineEngine: advances a run one phase at a time
//! - RunManager: owns runs and drives them

pub mod checkpoint_store;
pub mod engine;
pub mod error;
pub mod gate;
pub mod manager;
pub mod pipeline;
pub mod registry;
pub mod timeline;

// Re-export commonly used types
pub use checkpoint_store::{CheckpointStore, DriverLease, FsCheckpointStore};
pub use engine::{Advance, CancelSignal, PipelineEngine};
pub use error::{EngineError, StoreError};
pub use gate::ApprovalGate;
pub use manager::{RunDetail, RunManager};
pub use pipeline::{PipelineSettings, RetryPolicy};
pub use registry::PhaseRegistry;
pub use timeline::{EventCursor, EventTimeline};
