//! Pipeline engine: advances a run by exactly one step.
//!
//! One call to [`PipelineEngine::advance`] executes the current phase (or
//! finalizes), applies the QA routing rule, persists a checkpoint, appends
//! the matching timeline events and reports what the driver should do next.
//! Retrying, looping and waiting are the run manager's business.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{ExecutorError, StateSlice};
use crate::domain::{
    EventKind, FailureReason, Phase, QualityReport, Resolution, Run, RunStatus,
};

use super::checkpoint_store::CheckpointStore;
use super::error::EngineError;
use super::gate::ApprovalGate;
use super::registry::PhaseRegistry;
use super::timeline::EventTimeline;

/// What the driver should do after one `advance`
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// A phase completed; call `advance` again
    Continue,

    /// A recoverable failure; the same phase may be retried
    Retry { phase: Phase, error: ExecutorError },

    /// The run stopped at a gated boundary
    Paused { phase: Phase },

    /// The run finalized
    Completed,

    /// The run ended in `failed`
    Failed { reason: FailureReason, error: String },
}

impl Advance {
    /// Whether the driver loop should stop
    pub fn is_stop(&self) -> bool {
        matches!(
            self,
            Advance::Paused { .. } | Advance::Completed | Advance::Failed { .. }
        )
    }
}

/// Where a run goes after a successful QA phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Regenerate,
    Finalize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CancelState {
    epoch: u64,
    reason: Option<String>,
}

/// Per-run cancellation signal.
///
/// Cancelling bumps the epoch; a driver working on an older epoch abandons
/// its current executor call and fails the run as cancelled.
#[derive(Debug)]
pub struct CancelSignal {
    tx: watch::Sender<CancelState>,
}

impl CancelSignal {
    pub fn new(epoch: u64) -> Self {
        let (tx, _) = watch::channel(CancelState {
            epoch,
            reason: None,
        });
        Self { tx }
    }

    pub fn epoch(&self) -> u64 {
        self.tx.borrow().epoch
    }

    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().reason.clone()
    }

    /// Whether the signal has moved past `epoch`
    pub fn is_cancelled(&self, epoch: u64) -> bool {
        self.epoch() != epoch
    }

    /// Request cancellation; returns the new epoch
    pub fn cancel(&self, reason: impl Into<String>) -> u64 {
        let reason = reason.into();
        self.tx.send_modify(|state| {
            state.epoch += 1;
            state.reason = Some(reason);
        });
        self.epoch()
    }

    /// Resolves once the signal has moved past `epoch`
    pub async fn cancelled(&self, epoch: u64) {
        let mut rx = self.tx.subscribe();
        if rx.wait_for(|state| state.epoch != epoch).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Drives runs through the phase pipeline
pub struct PipelineEngine {
    registry: PhaseRegistry,
    checkpoints: Arc<dyn CheckpointStore>,
    timeline: Arc<EventTimeline>,
    gate: Arc<ApprovalGate>,
    approval_phases: BTreeSet<Phase>,
}

impl PipelineEngine {
    pub fn new(
        registry: PhaseRegistry,
        checkpoints: Arc<dyn CheckpointStore>,
        timeline: Arc<EventTimeline>,
        gate: Arc<ApprovalGate>,
    ) -> Self {
        Self {
            registry,
            checkpoints,
            timeline,
            gate,
            approval_phases: BTreeSet::new(),
        }
    }

    /// Phases after which runs pause for approval (only brainstorm,
    /// research and design can be gated)
    pub fn with_approval_phases(mut self, phases: impl IntoIterator<Item = Phase>) -> Self {
        self.approval_phases = phases.into_iter().filter(|phase| phase.is_gateable()).collect();
        self
    }

    /// Execute the current phase of `run` (or finalize it)
    #[instrument(skip(self, run, cancel), fields(run_id = %run.id, phase = %run.current_phase))]
    pub async fn advance(&self, run: &mut Run, cancel: &CancelSignal) -> Result<Advance, EngineError> {
        if !run.can_advance() {
            return Err(EngineError::invalid_state(run.id, run.status, "advance"));
        }

        if cancel.is_cancelled(run.epoch) {
            return self.cancel_run(run, cancel).await;
        }

        if run.status == RunStatus::Pending {
            run.status = RunStatus::Running;
            run.touch();
        }

        let phase = run.current_phase;
        if phase == Phase::Finalize {
            return self.finalize(run).await;
        }

        let Some(executor) = self.registry.get(phase) else {
            let message = EngineError::UnknownPhase(phase).to_string();
            return self.fail_run(run, FailureReason::Executor, message).await;
        };

        let attempt = run.attempts(phase) + 1;
        self.emit(
            run.id,
            EventKind::PhaseStarted,
            json!({ "phase": phase, "attempt": attempt, "executor": executor.name() }),
        )
        .await?;
        debug!(attempt, executor = executor.name(), "Phase started");

        let epoch = run.epoch;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled(epoch) => None,
            result = executor.execute(phase, &run.input, &run.state) => Some(result),
        };

        // A result that arrives after cancellation is discarded
        let result = match result {
            Some(result) if !cancel.is_cancelled(epoch) => result,
            _ => {
                info!("Cancelled during phase execution");
                return self.cancel_run(run, cancel).await;
            }
        };

        match result {
            Ok(slice) => self.complete_phase(run, phase, slice).await,
            Err(e) if e.is_recoverable() => {
                warn!(attempt, error = %e, "Phase failed (recoverable)");
                self.emit(
                    run.id,
                    EventKind::PhaseFailed,
                    json!({
                        "phase": phase,
                        "attempt": attempt,
                        "error": e.message(),
                        "fatal": false,
                    }),
                )
                .await?;
                Ok(Advance::Retry { phase, error: e })
            }
            Err(e) => {
                self.fail_run(run, FailureReason::Executor, e.message().to_string())
                    .await
            }
        }
    }

    /// Record a successful phase: route, checkpoint, commit, announce
    async fn complete_phase(
        &self,
        run: &mut Run,
        phase: Phase,
        slice: StateSlice,
    ) -> Result<Advance, EngineError> {
        let mut next = run.clone();
        next.record_output(phase, slice);

        let route = (phase == Phase::Qa).then(|| self.route_after_qa(&next));
        next.current_phase = match route {
            Some(Route::Regenerate) => Phase::Content,
            Some(Route::Finalize) => Phase::Finalize,
            None => phase.next().unwrap_or(Phase::Finalize),
        };

        let gated = self.approval_phases.contains(&phase);
        next.status = if gated {
            RunStatus::PausedAwaitingApproval
        } else {
            RunStatus::Running
        };
        next.touch();

        let checkpoint_id = match self
            .checkpoints
            .save(next.id, phase, &next.snapshot(), next.status)
            .await
        {
            Ok(id) => id,
            Err(source) => {
                let err = EngineError::CheckpointWrite {
                    run_id: run.id,
                    phase,
                    source,
                };
                return self
                    .fail_run(run, FailureReason::Checkpoint, err.to_string())
                    .await;
            }
        };
        next.last_checkpoint = Some(checkpoint_id);

        if gated {
            next.pending_approval = Some(self.gate.request(next.id, phase).await?);
        }

        *run = next;
        self.persist(run).await;

        self.emit(
            run.id,
            EventKind::PhaseCompleted,
            json!({
                "phase": phase,
                "attempt": run.attempts(phase),
                "checkpoint_id": checkpoint_id,
                "next_phase": run.current_phase,
            }),
        )
        .await?;
        info!(checkpoint_id, next_phase = %run.current_phase, "Phase completed");

        if route == Some(Route::Regenerate) {
            let scores = run.state.get(&Phase::Qa).and_then(QualityReport::from_slice);
            self.emit(
                run.id,
                EventKind::Regenerating,
                json!({
                    "phase": Phase::Content,
                    "attempt": run.attempts(Phase::Content) + 1,
                    "min_score": scores.map(|report| report.min_score()),
                    "threshold": run.options.quality_threshold,
                }),
            )
            .await?;
            info!(
                content_attempts = run.attempts(Phase::Content),
                "Quality below threshold, regenerating content"
            );
        }

        if gated {
            self.emit(
                run.id,
                EventKind::AwaitingApproval,
                json!({ "phase": phase, "next_phase": run.current_phase }),
            )
            .await?;
            info!("Awaiting approval");
            return Ok(Advance::Paused { phase });
        }

        if run.current_phase == Phase::Finalize {
            return self.finalize(run).await;
        }

        Ok(Advance::Continue)
    }

    /// QA routing: regenerate content while the report fails and the bound
    /// allows it. A slice without a report finalizes.
    fn route_after_qa(&self, run: &Run) -> Route {
        let Some(report) = run.state.get(&Phase::Qa).and_then(QualityReport::from_slice) else {
            warn!(run_id = %run.id, "QA produced no quality report, finalizing");
            return Route::Finalize;
        };

        let passed = report.passes(run.options.quality_threshold);
        if !passed && run.attempts(Phase::Content) < run.options.max_regenerations {
            Route::Regenerate
        } else {
            Route::Finalize
        }
    }

    /// Seal the run as completed
    async fn finalize(&self, run: &mut Run) -> Result<Advance, EngineError> {
        run.current_phase = Phase::Finalize;
        run.status = RunStatus::Completed;
        run.touch();
        self.persist(run).await;

        self.emit(
            run.id,
            EventKind::Finalized,
            json!({
                "artifact": run.artifact().cloned().unwrap_or(Value::Null),
                "content_attempts": run.attempts(Phase::Content),
            }),
        )
        .await?;
        info!(run_id = %run.id, "Run completed successfully");

        Ok(Advance::Completed)
    }

    /// Fail the run after a fatal error in its current phase
    pub async fn fail_run(
        &self,
        run: &mut Run,
        reason: FailureReason,
        error: String,
    ) -> Result<Advance, EngineError> {
        let payload = json!({
            "phase": run.current_phase,
            "attempt": run.attempts(run.current_phase) + 1,
            "error": error,
            "reason": reason.as_str(),
            "fatal": true,
        });
        self.terminate(run, reason, error, EventKind::PhaseFailed, payload)
            .await
    }

    /// Fail the run because recoverable failures outlasted the retry policy
    pub async fn give_up(
        &self,
        run: &mut Run,
        attempts: u32,
        last_error: &ExecutorError,
    ) -> Result<Advance, EngineError> {
        let error = format!(
            "phase '{}' failed {} times: {}",
            run.current_phase,
            attempts,
            last_error.message()
        );
        self.fail_run(run, FailureReason::RetriesExhausted, error).await
    }

    /// Fail the run as cancelled, adopting the signal's epoch
    pub async fn cancel_run(&self, run: &mut Run, cancel: &CancelSignal) -> Result<Advance, EngineError> {
        if run.is_terminal() {
            return Err(EngineError::invalid_state(run.id, run.status, "cancel"));
        }

        run.epoch = cancel.epoch();
        let reason = cancel.reason().unwrap_or_else(|| "cancelled".to_string());
        let payload = json!({ "phase": run.current_phase, "reason": reason });
        self.terminate(
            run,
            FailureReason::Cancelled,
            format!("cancelled: {}", reason),
            EventKind::Cancelled,
            payload,
        )
        .await
    }

    /// Apply an approval decision to a paused run
    #[instrument(skip(self, run, resolution), fields(run_id = %run.id, approved = resolution.approved))]
    pub async fn apply_resolution(
        &self,
        run: &mut Run,
        resolution: Resolution,
    ) -> Result<Advance, EngineError> {
        if run.status != RunStatus::PausedAwaitingApproval {
            return Err(EngineError::invalid_state(run.id, run.status, "resolve approval"));
        }

        let phase = resolution.request.phase;
        let payload = json!({ "phase": phase, "notes": resolution.notes });
        run.approval_notes = resolution.notes;

        if !resolution.approved {
            let error = format!("approval rejected after phase '{}'", phase);
            return self
                .terminate(run, FailureReason::Rejected, error, EventKind::Rejected, payload)
                .await;
        }

        run.status = RunStatus::Running;
        run.pending_approval = None;
        run.touch();
        self.checkpoints.save_run(run).await?;

        self.emit(run.id, EventKind::Approved, payload).await?;
        info!(%phase, next_phase = %run.current_phase, "Approval granted");

        Ok(Advance::Continue)
    }

    /// Move the run to `failed` and append its terminal event
    async fn terminate(
        &self,
        run: &mut Run,
        reason: FailureReason,
        error: String,
        kind: EventKind,
        payload: Value,
    ) -> Result<Advance, EngineError> {
        run.status = RunStatus::Failed;
        run.error = Some(error.clone());
        run.failure = Some(reason);
        run.pending_approval = None;
        run.touch();

        self.gate.withdraw(run.id).await;
        self.persist(run).await;
        self.emit(run.id, kind, payload).await?;

        error!(run_id = %run.id, reason = reason.as_str(), %error, "Run failed");
        Ok(Advance::Failed { reason, error })
    }

    /// Write the run record. The checkpoint is authoritative for resume, so
    /// a failure here is logged and recovery rolls forward.
    async fn persist(&self, run: &Run) {
        if let Err(e) = self.checkpoints.save_run(run).await {
            warn!(run_id = %run.id, error = %e, "Failed to persist run record");
        }
    }

    async fn emit(&self, run_id: Uuid, kind: EventKind, payload: Value) -> Result<u64, EngineError> {
        self.timeline
            .append(run_id, kind, payload)
            .await
            .map(|event| event.seq)
            .map_err(EngineError::Timeline)
    }
}
