//! Approval gate: at most one outstanding approval request per run.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use super::error::EngineError;
use crate::domain::{ApprovalRequest, Phase, Resolution};

/// Registry of pending approval requests
#[derive(Default)]
pub struct ApprovalGate {
    pending: Mutex<HashMap<Uuid, ApprovalRequest>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `run_id` awaits a decision on `phase`.
    ///
    /// Repeating the request for the same phase returns the existing one; a
    /// request for a different phase while one is outstanding is rejected.
    pub async fn request(&self, run_id: Uuid, phase: Phase) -> Result<ApprovalRequest, EngineError> {
        let mut pending = self.pending.lock().await;

        if let Some(existing) = pending.get(&run_id) {
            if existing.phase == phase {
                return Ok(existing.clone());
            }
            return Err(EngineError::ApprovalConflict {
                run_id,
                pending: existing.phase,
            });
        }

        let request = ApprovalRequest::new(run_id, phase);
        pending.insert(run_id, request.clone());
        info!(%run_id, %phase, "Approval requested");
        Ok(request)
    }

    /// Re-register a request loaded from storage
    pub async fn restore(&self, request: ApprovalRequest) {
        self.pending.lock().await.insert(request.run_id, request);
    }

    /// Decide the outstanding request. Exactly one caller wins; later calls
    /// see `NoPendingApproval`.
    pub async fn resolve(
        &self,
        run_id: Uuid,
        approved: bool,
        notes: Option<String>,
    ) -> Result<Resolution, EngineError> {
        let request = self
            .pending
            .lock()
            .await
            .remove(&run_id)
            .ok_or(EngineError::NoPendingApproval(run_id))?;

        info!(%run_id, phase = %request.phase, approved, "Approval resolved");
        Ok(Resolution {
            request,
            approved,
            notes,
            resolved_at: Utc::now(),
        })
    }

    pub async fn pending(&self, run_id: Uuid) -> Option<ApprovalRequest> {
        self.pending.lock().await.get(&run_id).cloned()
    }

    /// Drop a request without deciding it (the run was cancelled)
    pub async fn withdraw(&self, run_id: Uuid) -> Option<ApprovalRequest> {
        self.pending.lock().await.remove(&run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_is_idempotent_per_phase() {
        let gate = ApprovalGate::new();
        let run_id = Uuid::new_v4();

        let first = gate.request(run_id, Phase::Brainstorm).await.unwrap();
        let again = gate.request(run_id, Phase::Brainstorm).await.unwrap();
        assert_eq!(first, again);

        let conflict = gate.request(run_id, Phase::Research).await.unwrap_err();
        assert!(matches!(
            conflict,
            EngineError::ApprovalConflict { pending: Phase::Brainstorm, .. }
        ));
    }

    #[tokio::test]
    async fn test_resolve_consumes_request() {
        let gate = ApprovalGate::new();
        let run_id = Uuid::new_v4();
        gate.request(run_id, Phase::Design).await.unwrap();

        let resolution = gate
            .resolve(run_id, true, Some("ship it".to_string()))
            .await
            .unwrap();
        assert!(resolution.approved);
        assert_eq!(resolution.request.phase, Phase::Design);
        assert_eq!(resolution.notes.as_deref(), Some("ship it"));

        let err = gate.resolve(run_id, false, None).await.unwrap_err();
        assert!(matches!(err, EngineError::NoPendingApproval(id) if id == run_id));
        assert!(gate.pending(run_id).await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_resolves_have_one_winner() {
        let gate = std::sync::Arc::new(ApprovalGate::new());
        let run_id = Uuid::new_v4();
        gate.request(run_id, Phase::Research).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.resolve(run_id, i % 2 == 0, None).await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_withdraw() {
        let gate = ApprovalGate::new();
        let run_id = Uuid::new_v4();
        assert!(gate.withdraw(run_id).await.is_none());

        gate.request(run_id, Phase::Brainstorm).await.unwrap();
        assert_eq!(gate.withdraw(run_id).await.map(|r| r.phase), Some(Phase::Brainstorm));
        assert!(gate.pending(run_id).await.is_none());
    }
}
