//! Shared fixtures: scripted executors and a file-backed manager in a temp dir.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use uuid::Uuid;

use deckrun::core::{
    CheckpointStore, DriverLease, FsCheckpointStore, PhaseRegistry, PipelineSettings,
    RetryPolicy, RunManager, StoreError,
};
use deckrun::domain::{Checkpoint, CheckpointMeta, Event, EventKind, Phase, Run, RunStatus, Snapshot, StateMap};
use deckrun::{ExecutorError, PhaseExecutor, StateSlice};

/// What a scripted executor does on one call
#[derive(Debug, Clone)]
pub enum Outcome {
    Slice(Value),
    Recoverable(&'static str),
    Fatal(&'static str),
    /// Never returns (until the call is abandoned)
    Hang,
}

/// QA slice with the given content score and passing design/coherence scores
pub fn qa(content_score: f64) -> Outcome {
    Outcome::Slice(json!({
        "content_score": content_score,
        "design_score": 4.5,
        "coherence_score": 4.5,
    }))
}

/// Executor that plays back per-phase scripts, then falls back to a
/// deterministic default slice (QA defaults to a passing report)
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<Phase, VecDeque<Outcome>>>,
    calls: Mutex<Vec<Phase>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, phase: Phase, outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(phase)
            .or_default()
            .extend(outcomes);
        self
    }

    pub fn calls(&self) -> Vec<Phase> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, phase: Phase) -> usize {
        self.calls().iter().filter(|p| **p == phase).count()
    }
}

pub fn default_slice(phase: Phase, input: &Value, state: &StateMap) -> Value {
    match phase {
        Phase::Qa => json!({
            "content_score": 4.5,
            "design_score": 4.5,
            "coherence_score": 4.5,
        }),
        Phase::Design => json!({ "document": format!("{}.pptx", input["topic"].as_str().unwrap_or("deck")) }),
        _ => json!({
            "phase": phase,
            "topic": input["topic"],
            "seen": state.keys().collect::<Vec<_>>(),
        }),
    }
}

#[async_trait]
impl PhaseExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(
        &self,
        phase: Phase,
        input: &Value,
        state: &StateMap,
    ) -> Result<StateSlice, ExecutorError> {
        self.calls.lock().unwrap().push(phase);
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&phase)
            .and_then(VecDeque::pop_front);

        match next {
            None => Ok(default_slice(phase, input, state)),
            Some(Outcome::Slice(slice)) => Ok(slice),
            Some(Outcome::Recoverable(msg)) => Err(ExecutorError::recoverable(msg)),
            Some(Outcome::Fatal(msg)) => Err(ExecutorError::fatal(msg)),
            Some(Outcome::Hang) => std::future::pending().await,
        }
    }
}

/// Settings with the given gates and immediate retries (3 attempts)
pub fn settings(gated: &[Phase]) -> PipelineSettings {
    PipelineSettings {
        approval_phases: gated.iter().copied().collect(),
        retry: RetryPolicy::immediate(3),
        ..Default::default()
    }
}

pub fn registry(executor: &Arc<ScriptedExecutor>) -> PhaseRegistry {
    PhaseRegistry::new().with_all(executor.clone())
}

/// Manager over a fresh temp runs directory
pub struct Harness {
    pub temp: TempDir,
    pub executor: Arc<ScriptedExecutor>,
    pub manager: Arc<RunManager>,
}

impl Harness {
    pub async fn new(executor: ScriptedExecutor, settings: PipelineSettings) -> Self {
        let temp = TempDir::new().unwrap();
        let executor = Arc::new(executor);
        let manager = RunManager::open_dir(runs_dir(&temp), registry(&executor), settings)
            .await
            .unwrap();

        Self {
            temp,
            executor,
            manager: Arc::new(manager),
        }
    }

    pub fn runs_dir(&self) -> std::path::PathBuf {
        runs_dir(&self.temp)
    }

    pub fn store(&self) -> FsCheckpointStore {
        FsCheckpointStore::new(self.runs_dir())
    }

    pub async fn create(&self) -> Uuid {
        self.manager
            .create(json!({ "topic": "tidal energy" }), None)
            .await
            .unwrap()
    }

    pub async fn events(&self, run_id: Uuid) -> Vec<Event> {
        self.manager.event_snapshot(run_id, 1).await.unwrap()
    }
}

pub fn runs_dir(temp: &TempDir) -> std::path::PathBuf {
    temp.path().join("runs")
}

/// Open a second manager over the same storage (a restarted process)
pub async fn reopen(
    root: &Path,
    executor: &Arc<ScriptedExecutor>,
    settings: PipelineSettings,
) -> RunManager {
    RunManager::open_dir(root, registry(executor), settings)
        .await
        .unwrap()
}

pub fn kinds(events: &[Event]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

pub fn count(events: &[Event], kind: EventKind) -> usize {
    events.iter().filter(|e| e.kind == kind).count()
}

pub fn assert_gapless(events: &[Event]) {
    for (index, event) in events.iter().enumerate() {
        assert_eq!(event.seq, index as u64 + 1, "gap before {:?}", event);
    }
}

/// Wait (bounded) until the run's timeline contains a matching event
pub async fn wait_for_event<F>(manager: &RunManager, run_id: Uuid, predicate: F) -> Event
where
    F: Fn(&Event) -> bool,
{
    let mut cursor = manager.events(run_id, 1).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match cursor.next().await {
                Some(event) if predicate(&event) => return event,
                Some(_) => continue,
                None => panic!("timeline closed before the expected event"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Checkpoint store that refuses to save after a given phase
pub struct FailingStore {
    inner: FsCheckpointStore,
    fail_on: Phase,
}

impl FailingStore {
    pub fn new(inner: FsCheckpointStore, fail_on: Phase) -> Self {
        Self { inner, fail_on }
    }
}

#[async_trait]
impl CheckpointStore for FailingStore {
    async fn save(
        &self,
        run_id: Uuid,
        phase: Phase,
        snapshot: &Snapshot,
        status: RunStatus,
    ) -> Result<u64, StoreError> {
        if phase == self.fail_on {
            return Err(StoreError::io(
                self.inner.run_dir(run_id),
                std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            ));
        }
        self.inner.save(run_id, phase, snapshot, status).await
    }

    async fn load_latest(&self, run_id: Uuid) -> Result<Option<Checkpoint>, StoreError> {
        self.inner.load_latest(run_id).await
    }

    async fn load_at(&self, run_id: Uuid, phase: Phase) -> Result<Option<Checkpoint>, StoreError> {
        self.inner.load_at(run_id, phase).await
    }

    async fn list(&self, run_id: Uuid) -> Result<Vec<CheckpointMeta>, StoreError> {
        self.inner.list(run_id).await
    }

    async fn save_run(&self, run: &Run) -> Result<(), StoreError> {
        self.inner.save_run(run).await
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        self.inner.load_run(run_id).await
    }

    async fn list_runs(&self) -> Result<Vec<Uuid>, StoreError> {
        self.inner.list_runs().await
    }

    async fn acquire_driver(&self, run_id: Uuid) -> Result<DriverLease, StoreError> {
        self.inner.acquire_driver(run_id).await
    }
}
