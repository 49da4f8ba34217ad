//! Error types for the engine and its stores.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Phase, RunStatus};

/// Errors raised by the checkpoint store and the event timeline
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Checkpoint {id} already exists for run {run_id}")]
    CheckpointExists { run_id: Uuid, id: u64 },

    #[error("Run {0} is being driven by another process")]
    Locked(Uuid),

    #[error("Timeline for run {0} is closed")]
    Closed(Uuid),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors surfaced by the engine, the approval gate and the run manager
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Run {run_id} is {status}; cannot {operation}")]
    InvalidState {
        run_id: Uuid,
        status: RunStatus,
        operation: &'static str,
    },

    #[error("Run {0} has no pending approval")]
    NoPendingApproval(Uuid),

    #[error("Run {run_id} already awaits approval for phase '{pending}'")]
    ApprovalConflict { run_id: Uuid, pending: Phase },

    #[error("Checkpoint write failed for run {run_id} after phase '{phase}': {source}")]
    CheckpointWrite {
        run_id: Uuid,
        phase: Phase,
        #[source]
        source: StoreError,
    },

    #[error("Run {0} not found")]
    RunNotFound(Uuid),

    #[error("No executor registered for phase '{0}'")]
    UnknownPhase(Phase),

    #[error("Run {0} is being driven elsewhere")]
    RunBusy(Uuid),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Timeline error: {0}")]
    Timeline(#[source] StoreError),
}

impl EngineError {
    pub fn invalid_state(run_id: Uuid, status: RunStatus, operation: &'static str) -> Self {
        Self::InvalidState {
            run_id,
            status,
            operation,
        }
    }
}
