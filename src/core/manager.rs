//! Run manager: owns runs and serializes their drivers.
//!
//! Every run has a slot holding its latest committed record, an async
//! driver mutex and a cancellation signal. Only the task holding the driver
//! mutex (and, across processes, the run's `driver.lock` file) mutates the
//! run; everyone else reads the committed record.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::checkpoint_store::{CheckpointStore, DriverLease, FsCheckpointStore};
use super::engine::{Advance, CancelSignal, PipelineEngine};
use super::error::{EngineError, StoreError};
use super::gate::ApprovalGate;
use super::pipeline::PipelineSettings;
use super::registry::PhaseRegistry;
use super::timeline::{EventCursor, EventTimeline};
use crate::domain::{
    ApprovalRequest, CheckpointMeta, Event, EventKind, FailureReason, Run, RunOptions, RunStatus,
    RunSummary,
};

struct RunSlot {
    driver: Mutex<()>,
    run: RwLock<Run>,
    cancel: CancelSignal,
}

impl RunSlot {
    fn new(run: Run) -> Arc<Self> {
        Arc::new(Self {
            driver: Mutex::new(()),
            cancel: CancelSignal::new(run.epoch),
            run: RwLock::new(run),
        })
    }

    async fn snapshot(&self) -> Run {
        self.run.read().await.clone()
    }

    async fn commit(&self, run: &Run) {
        *self.run.write().await = run.clone();
    }
}

/// Run record plus the data a detail view needs
#[derive(Debug, Clone, Serialize)]
pub struct RunDetail {
    pub run: Run,
    pub checkpoints: Vec<CheckpointMeta>,
    pub last_seq: u64,
}

/// Creates, drives and tracks runs
pub struct RunManager {
    engine: PipelineEngine,
    checkpoints: Arc<dyn CheckpointStore>,
    timeline: Arc<EventTimeline>,
    gate: Arc<ApprovalGate>,
    settings: PipelineSettings,
    runs: RwLock<HashMap<Uuid, Arc<RunSlot>>>,
}

impl RunManager {
    /// Manager with no runs loaded
    pub fn new(
        registry: PhaseRegistry,
        checkpoints: Arc<dyn CheckpointStore>,
        timeline: Arc<EventTimeline>,
        settings: PipelineSettings,
    ) -> Self {
        let gate = Arc::new(ApprovalGate::new());
        let engine = PipelineEngine::new(
            registry,
            Arc::clone(&checkpoints),
            Arc::clone(&timeline),
            Arc::clone(&gate),
        )
        .with_approval_phases(settings.approval_phases.iter().copied());

        Self {
            engine,
            checkpoints,
            timeline,
            gate,
            settings,
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Manager over existing storage, with every stored run recovered
    pub async fn open(
        registry: PhaseRegistry,
        checkpoints: Arc<dyn CheckpointStore>,
        timeline: Arc<EventTimeline>,
        settings: PipelineSettings,
    ) -> Result<Self, EngineError> {
        let manager = Self::new(registry, checkpoints, timeline, settings);
        manager.recover().await?;
        Ok(manager)
    }

    /// File-backed manager rooted at a runs directory
    pub async fn open_dir(
        root: impl Into<PathBuf>,
        registry: PhaseRegistry,
        settings: PipelineSettings,
    ) -> Result<Self, EngineError> {
        let root = root.into();
        Self::open(
            registry,
            Arc::new(FsCheckpointStore::new(&root)),
            Arc::new(EventTimeline::persistent(&root)),
            settings,
        )
        .await
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    async fn slot(&self, run_id: Uuid) -> Result<Arc<RunSlot>, EngineError> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(EngineError::RunNotFound(run_id))
    }

    /// Create a pending run positioned at the first phase
    #[instrument(skip(self, input, options))]
    pub async fn create(&self, input: Value, options: Option<RunOptions>) -> Result<Uuid, EngineError> {
        let run = Run::new(input, options.unwrap_or_else(|| self.settings.run_options()));
        let run_id = run.id;

        self.checkpoints.save_run(&run).await?;
        self.runs.write().await.insert(run_id, RunSlot::new(run));

        info!(%run_id, "Run created");
        Ok(run_id)
    }

    pub async fn get(&self, run_id: Uuid) -> Result<Run, EngineError> {
        Ok(self.slot(run_id).await?.snapshot().await)
    }

    /// Summaries of all runs, oldest first
    pub async fn list(&self) -> Vec<RunSummary> {
        let slots: Vec<_> = self.runs.read().await.values().cloned().collect();

        let mut summaries = Vec::with_capacity(slots.len());
        for slot in slots {
            summaries.push(slot.run.read().await.summary());
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        summaries
    }

    /// Run record with checkpoint headers and timeline position
    pub async fn detail(&self, run_id: Uuid) -> Result<RunDetail, EngineError> {
        let run = self.get(run_id).await?;
        let checkpoints = self.checkpoints.list(run_id).await?;
        let last_seq = self
            .timeline
            .last_seq(run_id)
            .await
            .map_err(EngineError::Timeline)?;

        Ok(RunDetail {
            run,
            checkpoints,
            last_seq,
        })
    }

    /// Runs that a driver could pick up (pending or running)
    pub async fn resumable(&self) -> Vec<Uuid> {
        self.list()
            .await
            .into_iter()
            .filter(|summary| matches!(summary.status, RunStatus::Pending | RunStatus::Running))
            .map(|summary| summary.id)
            .collect()
    }

    async fn lease(&self, run_id: Uuid) -> Result<DriverLease, EngineError> {
        self.checkpoints
            .acquire_driver(run_id)
            .await
            .map_err(|e| match e {
                StoreError::Locked(id) => EngineError::RunBusy(id),
                other => EngineError::Store(other),
            })
    }

    /// Advance a run until it pauses or reaches a terminal state.
    ///
    /// Recoverable failures are retried per the configured retry policy;
    /// once it is exhausted the run fails. Driving a paused or terminal run
    /// returns it unchanged.
    #[instrument(skip(self))]
    pub async fn drive(&self, run_id: Uuid) -> Result<Run, EngineError> {
        let slot = self.slot(run_id).await?;
        let _driver = slot.driver.lock().await;
        let _lease = self.lease(run_id).await?;

        let mut run = self.refresh(&slot).await?;
        if !run.can_advance() {
            return Ok(run);
        }

        let retry = &self.settings.retry;
        let mut failures = 0u32;

        loop {
            let outcome = self.engine.advance(&mut run, &slot.cancel).await;
            slot.commit(&run).await;

            match outcome? {
                Advance::Continue => failures = 0,
                Advance::Retry { phase, error } => {
                    failures += 1;
                    if !retry.should_retry(failures) {
                        let gave_up = self.engine.give_up(&mut run, failures, &error).await;
                        slot.commit(&run).await;
                        gave_up?;
                        break;
                    }

                    let delay = retry.delay_for_attempt(failures);
                    warn!(
                        %phase,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Phase failed, retrying"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = slot.cancel.cancelled(run.epoch) => {}
                    }
                }
                Advance::Paused { .. } | Advance::Completed | Advance::Failed { .. } => break,
            }
        }

        self.release_if_done(&run).await;
        Ok(run)
    }

    /// Drive a run on a background task
    pub fn spawn(self: &Arc<Self>, run_id: Uuid) -> JoinHandle<Result<Run, EngineError>> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.drive(run_id).await })
    }

    /// Approve or reject the pending request of a paused run.
    ///
    /// The decision is taken under the run's driver lease against the stored
    /// record, so it happens once even across processes. The run is left
    /// `running` (approved) or `failed` (rejected); callers continue an
    /// approved run with [`drive`](Self::drive) or [`spawn`](Self::spawn).
    #[instrument(skip(self, notes))]
    pub async fn resolve_approval(
        &self,
        run_id: Uuid,
        approve: bool,
        notes: Option<String>,
    ) -> Result<Run, EngineError> {
        let slot = self.slot(run_id).await?;
        let _driver = slot.driver.lock().await;
        let _lease = self.lease(run_id).await?;

        let mut run = self.refresh(&slot).await?;
        if run.status != RunStatus::PausedAwaitingApproval {
            return Err(EngineError::invalid_state(run_id, run.status, "resolve approval"));
        }

        let resolution = self.gate.resolve(run_id, approve, notes).await?;
        let outcome = self.engine.apply_resolution(&mut run, resolution).await;
        slot.commit(&run).await;
        outcome?;

        self.release_if_done(&run).await;
        Ok(run)
    }

    /// Cancel a non-terminal run.
    ///
    /// An in-flight executor call is abandoned; the run ends `failed` with a
    /// `cancelled` event either way.
    #[instrument(skip(self, reason))]
    pub async fn cancel(&self, run_id: Uuid, reason: impl Into<String>) -> Result<Run, EngineError> {
        let slot = self.slot(run_id).await?;

        let status = slot.run.read().await.status;
        if status.is_terminal() {
            return Err(EngineError::invalid_state(run_id, status, "cancel"));
        }

        slot.cancel.cancel(reason);

        // An active driver notices the new epoch and fails the run itself
        let _driver = slot.driver.lock().await;
        let _lease = self.lease(run_id).await?;

        let mut run = self.refresh(&slot).await?;
        if run.is_terminal() {
            if run.failure == Some(FailureReason::Cancelled) {
                return Ok(run);
            }
            return Err(EngineError::invalid_state(run_id, run.status, "cancel"));
        }

        let outcome = self.engine.cancel_run(&mut run, &slot.cancel).await;
        slot.commit(&run).await;
        outcome?;

        self.release_if_done(&run).await;
        Ok(run)
    }

    /// Pending approval request of a run, if any
    pub async fn pending_approval(&self, run_id: Uuid) -> Option<ApprovalRequest> {
        self.gate.pending(run_id).await
    }

    /// Cursor over a run's events starting at `from` (0 or 1 = everything)
    pub async fn events(&self, run_id: Uuid, from: u64) -> Result<EventCursor, EngineError> {
        let slot = self.slot(run_id).await?;
        if slot.run.read().await.is_terminal() {
            // Ends the cursor even when the log was reloaded without a
            // terminal event
            self.timeline.close(run_id).await.map_err(EngineError::Timeline)?;
        }
        self.timeline
            .read_from(run_id, from)
            .await
            .map_err(EngineError::Timeline)
    }

    /// Events already stored, starting at `from`
    pub async fn event_snapshot(&self, run_id: Uuid, from: u64) -> Result<Vec<Event>, EngineError> {
        self.slot(run_id).await?;
        self.timeline
            .snapshot(run_id, from)
            .await
            .map_err(EngineError::Timeline)
    }

    /// Artifact reference (the design slice) of a completed run
    pub async fn artifact(&self, run_id: Uuid) -> Result<Value, EngineError> {
        let run = self.get(run_id).await?;
        if run.status != RunStatus::Completed {
            return Err(EngineError::invalid_state(run_id, run.status, "fetch artifact"));
        }
        Ok(run.artifact().cloned().unwrap_or(Value::Null))
    }

    /// Load every stored run, rolling forward records that lag behind their
    /// latest checkpoint
    #[instrument(skip(self))]
    async fn recover(&self) -> Result<(), EngineError> {
        let mut recovered = 0usize;
        let mut skipped = 0usize;

        for run_id in self.checkpoints.list_runs().await? {
            match self.recover_run(run_id).await {
                Ok(Some(run)) => {
                    self.runs.write().await.insert(run_id, RunSlot::new(run));
                    recovered += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(%run_id, error = %e, "Skipping run that failed to load");
                    skipped += 1;
                }
            }
        }

        let pruned = self.timeline.prune().await;
        info!(recovered, skipped, pruned, "Runs recovered");
        Ok(())
    }

    /// Load one stored run. Rolling forward appends events and rewrites the
    /// record, so it only happens when no other process drives the run.
    async fn recover_run(&self, run_id: Uuid) -> Result<Option<Run>, EngineError> {
        let Some(mut run) = self.checkpoints.load_run(run_id).await? else {
            return Ok(None);
        };

        if !run.is_terminal() {
            match self.checkpoints.acquire_driver(run_id).await {
                Ok(_lease) => {
                    self.timeline.sync(run_id).await.map_err(EngineError::Timeline)?;
                    self.roll_forward(&mut run).await?;
                }
                Err(StoreError::Locked(_)) => {
                    debug!(%run_id, "Run is driven elsewhere, not rolling forward");
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.sync_gate(&run).await;
        if run.is_terminal() {
            self.timeline.close(run_id).await.map_err(EngineError::Timeline)?;
        }

        Ok(Some(run))
    }

    /// Reconcile a slot with storage before deciding anything about its run.
    /// Another process may have advanced, resolved or cancelled it since this
    /// manager last looked. Call only while holding the run's lease.
    async fn refresh(&self, slot: &RunSlot) -> Result<Run, EngineError> {
        let mut run = slot.snapshot().await;

        let foreign = self.timeline.sync(run.id).await.map_err(EngineError::Timeline)?;
        if let Some(stored) = self.checkpoints.load_run(run.id).await? {
            if foreign > 0 || stored.updated_at > run.updated_at {
                debug!(run_id = %run.id, foreign, "Adopting stored run record");
                run = stored;
            }
        }

        if !run.is_terminal() {
            self.roll_forward(&mut run).await?;
        }
        self.sync_gate(&run).await;

        slot.commit(&run).await;
        Ok(run)
    }

    /// Make the gate agree with the run record
    async fn sync_gate(&self, run: &Run) {
        if run.status != RunStatus::PausedAwaitingApproval {
            self.gate.withdraw(run.id).await;
            return;
        }

        let request = run
            .pending_approval
            .clone()
            .unwrap_or_else(|| ApprovalRequest::new(run.id, run.current_phase));
        self.gate.restore(request).await;
    }

    /// Let go of a finished run's in-memory timeline
    async fn release_if_done(&self, run: &Run) {
        if run.is_terminal() {
            self.timeline.prune().await;
        }
    }

    /// Adopt a checkpoint newer than the run record (crash between the
    /// checkpoint write and the record write)
    async fn roll_forward(&self, run: &mut Run) -> Result<(), EngineError> {
        let Some(checkpoint) = self.checkpoints.load_latest(run.id).await? else {
            return Ok(());
        };
        if run.last_checkpoint.is_some_and(|id| id >= checkpoint.id) {
            return Ok(());
        }

        warn!(
            run_id = %run.id,
            checkpoint_id = checkpoint.id,
            phase = %checkpoint.phase,
            "Run record behind checkpoint, rolling forward"
        );
        run.apply_checkpoint(&checkpoint);
        if run.status == RunStatus::PausedAwaitingApproval {
            run.pending_approval = Some(ApprovalRequest::new(run.id, checkpoint.phase));
        }
        self.checkpoints.save_run(run).await?;

        let announced = self
            .timeline
            .snapshot(run.id, 1)
            .await
            .map_err(EngineError::Timeline)?
            .iter()
            .any(|event| {
                event.kind == EventKind::PhaseCompleted
                    && event.payload.get("checkpoint_id").and_then(Value::as_u64)
                        == Some(checkpoint.id)
            });

        if !announced {
            self.timeline
                .append(
                    run.id,
                    EventKind::PhaseCompleted,
                    json!({
                        "phase": checkpoint.phase,
                        "attempt": run.attempts(checkpoint.phase),
                        "checkpoint_id": checkpoint.id,
                        "next_phase": run.current_phase,
                        "recovered": true,
                    }),
                )
                .await
                .map_err(EngineError::Timeline)?;

            if run.status == RunStatus::PausedAwaitingApproval {
                self.timeline
                    .append(
                        run.id,
                        EventKind::AwaitingApproval,
                        json!({ "phase": checkpoint.phase, "next_phase": run.current_phase }),
                    )
                    .await
                    .map_err(EngineError::Timeline)?;
            }
        }

        Ok(())
    }
}
