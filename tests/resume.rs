//! Restart and resume tests.
//!
//! A "restart" drops the manager and opens a new one over the same runs
//! directory, the way a new process would.

mod common;

use std::sync::Arc;

use deckrun::core::{CheckpointStore, EngineError};
use deckrun::domain::{EventKind, Phase, RunStatus};

use common::{count, reopen, settings, wait_for_event, Harness, Outcome, ScriptedExecutor};

#[tokio::test]
async fn test_resume_after_crash_matches_uninterrupted_run() {
    // Reference: a run that never stops
    let reference = Harness::new(ScriptedExecutor::new(), settings(&[])).await;
    let reference_id = reference.create().await;
    let expected = reference.manager.drive(reference_id).await.unwrap();

    // Crash while content is executing
    let h = Harness::new(
        ScriptedExecutor::new().script(Phase::Content, [Outcome::Hang]),
        settings(&[]),
    )
    .await;
    let run_id = h.create().await;
    let driver = h.manager.spawn(run_id);
    wait_for_event(&h.manager, run_id, |e| {
        e.kind == EventKind::PhaseStarted && e.phase() == Some(Phase::Content)
    })
    .await;
    driver.abort();
    let _ = driver.await;

    let stored = h.store().load_run(run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Running);
    assert_eq!(stored.current_phase, Phase::Content);

    // Restart with a fresh executor
    let fresh = Arc::new(ScriptedExecutor::new());
    let manager = reopen(&h.runs_dir(), &fresh, settings(&[])).await;
    assert_eq!(manager.resumable().await, vec![run_id]);

    let resumed = manager.drive(run_id).await.unwrap();

    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.state, expected.state);
    assert_eq!(resumed.attempt_count, expected.attempt_count);
    assert_eq!(fresh.call_count(Phase::Brainstorm), 0);
    assert_eq!(fresh.call_count(Phase::Research), 0);
    assert_eq!(fresh.call_count(Phase::Content), 1);

    let events = manager.event_snapshot(run_id, 1).await.unwrap();
    common::assert_gapless(&events);
    assert_eq!(count(&events, EventKind::PhaseCompleted), 5);
    assert_eq!(count(&events, EventKind::Finalized), 1);
}

#[tokio::test]
async fn test_pause_survives_restart() {
    let h = Harness::new(ScriptedExecutor::new(), settings(&[Phase::Research])).await;
    let run_id = h.create().await;
    let paused = h.manager.drive(run_id).await.unwrap();
    assert_eq!(paused.status, RunStatus::PausedAwaitingApproval);

    let fresh = Arc::new(ScriptedExecutor::new());
    let manager = reopen(&h.runs_dir(), &fresh, settings(&[Phase::Research])).await;

    let run = manager.get(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::PausedAwaitingApproval);
    assert_eq!(run.current_phase, Phase::Content);
    assert_eq!(
        manager.pending_approval(run_id).await.map(|r| r.phase),
        Some(Phase::Research)
    );
    assert!(manager.resumable().await.is_empty());

    // Driving does not skip the gate
    let still = manager.drive(run_id).await.unwrap();
    assert_eq!(still.status, RunStatus::PausedAwaitingApproval);
    assert!(fresh.calls().is_empty());

    manager
        .resolve_approval(run_id, true, Some("sources check out".to_string()))
        .await
        .unwrap();
    let done = manager.drive(run_id).await.unwrap();

    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.approval_notes.as_deref(), Some("sources check out"));
    assert_eq!(
        fresh.calls(),
        vec![Phase::Content, Phase::Design, Phase::Qa]
    );
}

#[tokio::test]
async fn test_stale_run_record_rolls_forward() {
    let h = Harness::new(ScriptedExecutor::new(), settings(&[Phase::Research])).await;
    let run_id = h.create().await;
    let stale = h.manager.get(run_id).await.unwrap();

    h.manager.drive(run_id).await.unwrap();

    // Simulate a crash between the checkpoint write and the record write
    h.store().save_run(&stale).await.unwrap();

    let fresh = Arc::new(ScriptedExecutor::new());
    let manager = reopen(&h.runs_dir(), &fresh, settings(&[Phase::Research])).await;
    let run = manager.get(run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::PausedAwaitingApproval);
    assert_eq!(run.current_phase, Phase::Content);
    assert_eq!(run.last_checkpoint, Some(2));
    assert_eq!(run.attempts(Phase::Brainstorm), 1);
    assert_eq!(run.attempts(Phase::Research), 1);
    assert_eq!(
        manager.pending_approval(run_id).await.map(|r| r.phase),
        Some(Phase::Research)
    );

    // Events were already written; recovery does not repeat them
    let events = manager.event_snapshot(run_id, 1).await.unwrap();
    assert_eq!(count(&events, EventKind::PhaseCompleted), 2);
    assert_eq!(count(&events, EventKind::AwaitingApproval), 1);
}

#[tokio::test]
async fn test_recovery_announces_unlogged_checkpoint() {
    let h = Harness::new(ScriptedExecutor::new(), settings(&[Phase::Brainstorm])).await;
    let run_id = h.create().await;
    let stale = h.manager.get(run_id).await.unwrap();
    h.manager.drive(run_id).await.unwrap();

    // Crash right after the checkpoint: neither the record nor the events
    // made it to disk
    h.store().save_run(&stale).await.unwrap();
    std::fs::remove_file(h.runs_dir().join(run_id.to_string()).join("events.jsonl")).unwrap();

    let fresh = Arc::new(ScriptedExecutor::new());
    let manager = reopen(&h.runs_dir(), &fresh, settings(&[Phase::Brainstorm])).await;

    let events = manager.event_snapshot(run_id, 1).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, EventKind::PhaseCompleted);
    assert_eq!(events[0].payload["recovered"], serde_json::json!(true));
    assert_eq!(events[1].kind, EventKind::AwaitingApproval);

    let run = manager.get(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::PausedAwaitingApproval);
}

#[tokio::test]
async fn test_terminal_runs_stay_terminal_after_restart() {
    let h = Harness::new(ScriptedExecutor::new(), settings(&[])).await;
    let run_id = h.create().await;
    h.manager.drive(run_id).await.unwrap();

    let fresh = Arc::new(ScriptedExecutor::new());
    let manager = reopen(&h.runs_dir(), &fresh, settings(&[])).await;

    let run = manager.drive(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(fresh.calls().is_empty());

    // A reader of a finished run gets the backlog and then the end
    let mut cursor = manager.events(run_id, 0).await.unwrap();
    let mut seen = 0;
    while cursor.next().await.is_some() {
        seen += 1;
    }
    assert_eq!(seen, 11);
}

#[tokio::test]
async fn test_unreadable_run_does_not_block_restart() {
    let h = Harness::new(ScriptedExecutor::new(), settings(&[])).await;
    let broken = h.create().await;
    let healthy = h.create().await;
    h.manager.drive(broken).await.unwrap();
    h.manager.drive(healthy).await.unwrap();

    let log = h.runs_dir().join(broken.to_string()).join("events.jsonl");
    let stored = std::fs::read_to_string(&log).unwrap();
    std::fs::write(&log, format!("{{not an event}}\n{}", stored)).unwrap();

    let manager = reopen(&h.runs_dir(), &h.executor, settings(&[])).await;

    assert!(matches!(
        manager.get(broken).await,
        Err(EngineError::RunNotFound(id)) if id == broken
    ));
    assert_eq!(manager.get(healthy).await.unwrap().status, RunStatus::Completed);
    assert_eq!(manager.list().await.len(), 1);
}
