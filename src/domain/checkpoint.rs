//! Checkpoints: immutable snapshots taken after each phase completes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::phase::Phase;
use super::run::{AttemptCounts, RunStatus, StateMap};

/// Everything needed to resume a run after the phase that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Phase to execute on resume
    pub next_phase: Phase,

    pub attempt_count: AttemptCounts,

    pub state: StateMap,
}

impl Snapshot {
    /// SHA-256 of the serialized state (hex)
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(&self.state).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }
}

/// A durable snapshot of a run, written once and never modified
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Per-run sequence, starting at 1
    pub id: u64,

    pub run_id: Uuid,

    /// Phase whose completion this checkpoint records
    pub phase: Phase,

    /// Run status at the time of the checkpoint (running or paused)
    pub status: RunStatus,

    pub created_at: DateTime<Utc>,

    /// Integrity check over `snapshot.state`
    pub state_digest: String,

    #[serde(flatten)]
    pub snapshot: Snapshot,
}

impl Checkpoint {
    pub fn new(id: u64, run_id: Uuid, phase: Phase, status: RunStatus, snapshot: Snapshot) -> Self {
        Self {
            id,
            run_id,
            phase,
            status,
            created_at: Utc::now(),
            state_digest: snapshot.digest(),
            snapshot,
        }
    }

    /// Whether the stored digest still matches the state
    pub fn verify(&self) -> bool {
        self.snapshot.digest() == self.state_digest
    }

    pub fn meta(&self) -> CheckpointMeta {
        CheckpointMeta {
            id: self.id,
            phase: self.phase,
            status: self.status,
            next_phase: self.snapshot.next_phase,
            created_at: self.created_at,
            state_digest: self.state_digest.clone(),
        }
    }
}

/// Checkpoint header without the state payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub id: u64,
    pub phase: Phase,
    pub status: RunStatus,
    pub next_phase: Phase,
    pub created_at: DateTime<Utc>,
    pub state_digest: String,
}
