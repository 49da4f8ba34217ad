//! Run state.
//!
//! A Run is one end-to-end execution of the phase pipeline. It is created by
//! the run manager and mutated only by the engine while a single driver holds
//! it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::approval::ApprovalRequest;
use super::checkpoint::{Checkpoint, Snapshot};
use super::phase::Phase;

/// Accumulated phase outputs, one slice per phase
pub type StateMap = BTreeMap<Phase, Value>;

/// Successful executions per phase
pub type AttemptCounts = BTreeMap<Phase, u32>;

/// A pipeline execution run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Lifecycle status
    pub status: RunStatus,

    /// Phase about to execute (or last attempted)
    pub current_phase: Phase,

    /// How many times each phase has completed for this run
    #[serde(default)]
    pub attempt_count: AttemptCounts,

    /// Original request payload (immutable after creation)
    pub input: Value,

    /// Outputs of completed phases, keyed by the phase that produced them
    #[serde(default)]
    pub state: StateMap,

    /// Routing parameters fixed at creation
    pub options: RunOptions,

    /// Last fatal error (only when failed)
    pub error: Option<String>,

    /// Why the run failed (only when failed)
    pub failure: Option<FailureReason>,

    /// Generation number; bumped when the run is cancelled
    #[serde(default)]
    pub epoch: u64,

    /// Outstanding approval request while paused
    pub pending_approval: Option<ApprovalRequest>,

    /// Notes attached to the most recent approval decision
    pub approval_notes: Option<String>,

    /// Id of the newest checkpoint reflected in this record
    pub last_checkpoint: Option<u64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Create a pending run positioned at the first phase
    pub fn new(input: Value, options: RunOptions) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: RunStatus::Pending,
            current_phase: Phase::first(),
            attempt_count: AttemptCounts::new(),
            input,
            state: StateMap::new(),
            options,
            error: None,
            failure: None,
            epoch: 0,
            pending_approval: None,
            approval_notes: None,
            last_checkpoint: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Number of completed executions of a phase
    pub fn attempts(&self, phase: Phase) -> u32 {
        self.attempt_count.get(&phase).copied().unwrap_or(0)
    }

    /// Store a phase's output under its own key and count the execution
    pub fn record_output(&mut self, phase: Phase, slice: Value) {
        self.state.insert(phase, slice);
        *self.attempt_count.entry(phase).or_insert(0) += 1;
    }

    /// The part of the run a checkpoint captures
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            next_phase: self.current_phase,
            attempt_count: self.attempt_count.clone(),
            state: self.state.clone(),
        }
    }

    /// Adopt a checkpoint newer than this record (crash between checkpoint
    /// write and run record write).
    pub fn apply_checkpoint(&mut self, checkpoint: &Checkpoint) {
        self.state = checkpoint.snapshot.state.clone();
        self.attempt_count = checkpoint.snapshot.attempt_count.clone();
        self.current_phase = checkpoint.snapshot.next_phase;
        self.status = checkpoint.status;
        self.last_checkpoint = Some(checkpoint.id);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether the engine may advance this run
    pub fn can_advance(&self) -> bool {
        matches!(self.status, RunStatus::Pending | RunStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Rendered-document reference produced by the design phase
    pub fn artifact(&self) -> Option<&Value> {
        self.state.get(&Phase::Design)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id,
            status: self.status,
            current_phase: self.current_phase,
            created_at: self.created_at,
            updated_at: self.updated_at,
            error: self.error.clone(),
        }
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet advanced
    Pending,

    /// Being (or ready to be) advanced
    Running,

    /// Blocked on an approval decision
    PausedAwaitingApproval,

    /// Finalized successfully
    Completed,

    /// Ended with an error, a rejection or a cancellation
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::PausedAwaitingApproval => "paused_awaiting_approval",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run ended in `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// An executor reported a fatal error (or none was registered)
    Executor,

    /// A checkpoint could not be persisted
    Checkpoint,

    /// Recoverable failures outlasted the retry policy
    RetriesExhausted,

    /// An approval request was rejected
    Rejected,

    /// The run was cancelled
    Cancelled,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::Executor => "executor",
            FailureReason::Checkpoint => "checkpoint",
            FailureReason::RetriesExhausted => "retries_exhausted",
            FailureReason::Rejected => "rejected",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

/// Routing parameters supplied when a run is created
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Minimum score every QA dimension must reach
    pub quality_threshold: f64,

    /// Upper bound on content executions before QA failures fall through to finalize
    pub max_regenerations: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            quality_threshold: 3.0,
            max_regenerations: 3,
        }
    }
}

/// Lightweight view used for listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub status: RunStatus,
    pub current_phase: Phase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}
