//! Approval requests raised at gated phase boundaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::phase::Phase;

/// A pending human decision blocking a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub run_id: Uuid,

    /// Phase that just completed and awaits sign-off
    pub phase: Phase,

    pub requested_at: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn new(run_id: Uuid, phase: Phase) -> Self {
        Self {
            run_id,
            phase,
            requested_at: Utc::now(),
        }
    }
}

/// Outcome of resolving a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub request: ApprovalRequest,
    pub approved: bool,
    pub notes: Option<String>,
    pub resolved_at: DateTime<Utc>,
}
