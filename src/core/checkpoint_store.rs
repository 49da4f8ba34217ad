//! Durable checkpoint and run-record storage.
//!
//! Layout under the runs directory:
//!
//! ```text
//! <run_id>/run.json                      latest run record (rewritten atomically)
//! <run_id>/checkpoints/000001-brainstorm.json
//! <run_id>/checkpoints/000002-research.json   immutable, one per completed phase
//! <run_id>/driver.lock                   held while a driver advances the run
//! ```
//!
//! Every write goes to a temp file in the target directory, is fsynced and
//! then renamed into place, so a reader sees either the previous file or the
//! complete new one.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use tempfile::NamedTempFile;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::StoreError;
use crate::domain::{Checkpoint, CheckpointMeta, Phase, Run, RunStatus, Snapshot};

/// Storage for checkpoints and run records
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a new checkpoint after `phase` completed; returns its id
    async fn save(
        &self,
        run_id: Uuid,
        phase: Phase,
        snapshot: &Snapshot,
        status: RunStatus,
    ) -> Result<u64, StoreError>;

    /// Most recent checkpoint for the run
    async fn load_latest(&self, run_id: Uuid) -> Result<Option<Checkpoint>, StoreError>;

    /// Most recent checkpoint written for a given phase
    async fn load_at(&self, run_id: Uuid, phase: Phase) -> Result<Option<Checkpoint>, StoreError>;

    /// Headers of all checkpoints, oldest first
    async fn list(&self, run_id: Uuid) -> Result<Vec<CheckpointMeta>, StoreError>;

    /// Persist the run record (overwrites the previous one)
    async fn save_run(&self, run: &Run) -> Result<(), StoreError>;

    async fn load_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError>;

    /// Ids of all runs with a stored record
    async fn list_runs(&self) -> Result<Vec<Uuid>, StoreError>;

    /// Exclusive, cross-process right to advance a run
    async fn acquire_driver(&self, run_id: Uuid) -> Result<DriverLease, StoreError>;
}

/// Held while a driver advances a run; released on drop
#[derive(Debug)]
pub struct DriverLease {
    file: Option<File>,
}

impl DriverLease {
    /// A lease that guards nothing (for stores without cross-process access)
    pub fn unlocked() -> Self {
        Self { file: None }
    }
}

impl Drop for DriverLease {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                warn!(error = %e, "Failed to release driver lock");
            }
        }
    }
}

/// File-based checkpoint store
#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    root: PathBuf,
}

impl FsCheckpointStore {
    /// Create a store rooted at `root` (the runs directory)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    fn checkpoints_dir(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join("checkpoints")
    }

    fn run_path(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join("run.json")
    }

    /// Checkpoint files as (id, phase, path), ordered by id
    async fn scan(&self, run_id: Uuid) -> Result<Vec<(u64, Phase, PathBuf)>, StoreError> {
        let dir = self.checkpoints_dir(run_id);
        if !fs::try_exists(&dir).await.map_err(|e| StoreError::io(&dir, e))? {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        let mut entries = fs::read_dir(&dir).await.map_err(|e| StoreError::io(&dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&dir, e))?
        {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            // Skips in-flight temp files as well
            if let Some((id, phase)) = parse_checkpoint_name(&name) {
                found.push((id, phase, entry.path()));
            }
        }

        found.sort_by_key(|(id, _, _)| *id);
        Ok(found)
    }

    async fn read_checkpoint(&self, path: &Path) -> Result<Checkpoint, StoreError> {
        let bytes = fs::read(path).await.map_err(|e| StoreError::io(path, e))?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;
        if !checkpoint.verify() {
            return Err(StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: "state digest mismatch".to_string(),
            });
        }
        Ok(checkpoint)
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn save(
        &self,
        run_id: Uuid,
        phase: Phase,
        snapshot: &Snapshot,
        status: RunStatus,
    ) -> Result<u64, StoreError> {
        let id = self
            .scan(run_id)
            .await?
            .last()
            .map(|(id, _, _)| id + 1)
            .unwrap_or(1);

        let checkpoint = Checkpoint::new(id, run_id, phase, status, snapshot.clone());
        let bytes = serde_json::to_vec_pretty(&checkpoint)?;
        let path = self
            .checkpoints_dir(run_id)
            .join(checkpoint_name(id, phase));

        let written = path.clone();
        blocking(&path, move || write_atomic(&written, &bytes, false))
            .await
            .map_err(|e| match e {
                StoreError::Io { source, .. }
                    if source.kind() == std::io::ErrorKind::AlreadyExists =>
                {
                    StoreError::CheckpointExists { run_id, id }
                }
                other => other,
            })?;

        debug!(%run_id, %phase, checkpoint_id = id, "Checkpoint written");
        Ok(id)
    }

    async fn load_latest(&self, run_id: Uuid) -> Result<Option<Checkpoint>, StoreError> {
        match self.scan(run_id).await?.last() {
            Some((_, _, path)) => Ok(Some(self.read_checkpoint(path).await?)),
            None => Ok(None),
        }
    }

    async fn load_at(&self, run_id: Uuid, phase: Phase) -> Result<Option<Checkpoint>, StoreError> {
        let files = self.scan(run_id).await?;
        match files.iter().rev().find(|(_, p, _)| *p == phase) {
            Some((_, _, path)) => Ok(Some(self.read_checkpoint(path).await?)),
            None => Ok(None),
        }
    }

    async fn list(&self, run_id: Uuid) -> Result<Vec<CheckpointMeta>, StoreError> {
        let mut metas = Vec::new();
        for (_, _, path) in self.scan(run_id).await? {
            metas.push(self.read_checkpoint(&path).await?.meta());
        }
        Ok(metas)
    }

    async fn save_run(&self, run: &Run) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(run)?;
        let path = self.run_path(run.id);
        let written = path.clone();
        blocking(&path, move || write_atomic(&written, &bytes, true)).await
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        let path = self.run_path(run_id);
        if !fs::try_exists(&path).await.map_err(|e| StoreError::io(&path, e))? {
            return Ok(None);
        }

        let bytes = fs::read(&path).await.map_err(|e| StoreError::io(&path, e))?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn list_runs(&self) -> Result<Vec<Uuid>, StoreError> {
        if !fs::try_exists(&self.root)
            .await
            .map_err(|e| StoreError::io(&self.root, e))?
        {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| StoreError::io(&self.root, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.root, e))?
        {
            let Some(run_id) = entry.file_name().to_str().and_then(|n| Uuid::parse_str(n).ok()) else {
                continue;
            };
            if fs::try_exists(self.run_path(run_id)).await.unwrap_or(false) {
                runs.push(run_id);
            }
        }

        Ok(runs)
    }

    async fn acquire_driver(&self, run_id: Uuid) -> Result<DriverLease, StoreError> {
        let path = self.run_dir(run_id).join("driver.lock");
        let lock_path = path.clone();

        blocking(&path, move || {
            if let Some(parent) = lock_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)
                .map_err(|e| StoreError::io(&lock_path, e))?;

            match file.try_lock_exclusive() {
                Ok(()) => Ok(DriverLease { file: Some(file) }),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    Err(StoreError::Locked(run_id))
                }
                Err(e) => Err(StoreError::io(&lock_path, e)),
            }
        })
        .await
    }
}

fn checkpoint_name(id: u64, phase: Phase) -> String {
    format!("{:06}-{}.json", id, phase)
}

fn parse_checkpoint_name(name: &str) -> Option<(u64, Phase)> {
    let stem = name.strip_suffix(".json")?;
    let (id, phase) = stem.split_once('-')?;
    Some((id.parse().ok()?, phase.parse().ok()?))
}

/// Run blocking filesystem work off the async runtime
async fn blocking<T, F>(path: &Path, work: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StoreError::io(path, std::io::Error::other(e.to_string())))?
}

/// Write via temp file + fsync + rename. With `overwrite = false` an existing
/// target is never replaced.
fn write_atomic(path: &Path, bytes: &[u8], overwrite: bool) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    let mut temp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    temp.write_all(bytes).map_err(|e| StoreError::io(temp.path(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(temp.path(), e))?;

    let persisted = if overwrite {
        temp.persist(path)
    } else {
        temp.persist_noclobber(path)
    };
    persisted.map_err(|e| StoreError::io(path, e.error))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunOptions, StateMap};
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (FsCheckpointStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FsCheckpointStore::new(temp_dir.path().join("runs"));
        (store, temp_dir)
    }

    fn snapshot(next_phase: Phase, outputs: &[(Phase, serde_json::Value)]) -> Snapshot {
        let state: StateMap = outputs.iter().cloned().collect();
        let attempt_count = outputs.iter().map(|(p, _)| (*p, 1)).collect();
        Snapshot {
            next_phase,
            attempt_count,
            state,
        }
    }

    #[tokio::test]
    async fn test_save_assigns_sequential_ids() {
        let (store, _temp) = create_test_store();
        let run_id = Uuid::new_v4();

        let first = store
            .save(
                run_id,
                Phase::Brainstorm,
                &snapshot(Phase::Research, &[(Phase::Brainstorm, json!("outline"))]),
                RunStatus::Running,
            )
            .await
            .unwrap();
        let second = store
            .save(
                run_id,
                Phase::Research,
                &snapshot(
                    Phase::Content,
                    &[
                        (Phase::Brainstorm, json!("outline")),
                        (Phase::Research, json!("claims")),
                    ],
                ),
                RunStatus::Running,
            )
            .await
            .unwrap();

        assert_eq!((first, second), (1, 2));

        let latest = store.load_latest(run_id).await.unwrap().unwrap();
        assert_eq!(latest.id, 2);
        assert_eq!(latest.snapshot.next_phase, Phase::Content);
        assert_eq!(latest.snapshot.state.len(), 2);
    }

    #[tokio::test]
    async fn test_earlier_checkpoints_are_untouched() {
        let (store, _temp) = create_test_store();
        let run_id = Uuid::new_v4();

        store
            .save(
                run_id,
                Phase::Brainstorm,
                &snapshot(Phase::Research, &[(Phase::Brainstorm, json!("v1"))]),
                RunStatus::PausedAwaitingApproval,
            )
            .await
            .unwrap();
        store
            .save(
                run_id,
                Phase::Research,
                &snapshot(
                    Phase::Content,
                    &[(Phase::Brainstorm, json!("v1")), (Phase::Research, json!("r"))],
                ),
                RunStatus::Running,
            )
            .await
            .unwrap();

        let at_brainstorm = store.load_at(run_id, Phase::Brainstorm).await.unwrap().unwrap();
        assert_eq!(at_brainstorm.id, 1);
        assert_eq!(at_brainstorm.status, RunStatus::PausedAwaitingApproval);
        assert_eq!(at_brainstorm.snapshot.state.len(), 1);

        assert!(store.load_at(run_id, Phase::Design).await.unwrap().is_none());

        let metas = store.list(run_id).await.unwrap();
        assert_eq!(
            metas.iter().map(|m| m.phase).collect::<Vec<_>>(),
            vec![Phase::Brainstorm, Phase::Research]
        );
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_rejected() {
        let (store, _temp) = create_test_store();
        let run_id = Uuid::new_v4();
        store
            .save(
                run_id,
                Phase::Brainstorm,
                &snapshot(Phase::Research, &[(Phase::Brainstorm, json!("outline"))]),
                RunStatus::Running,
            )
            .await
            .unwrap();

        let path = store.checkpoints_dir(run_id).join(checkpoint_name(1, Phase::Brainstorm));
        let mut value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        value["state"]["brainstorm"] = json!("tampered");
        std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

        let err = store.load_latest(run_id).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_run_record_round_trip() {
        let (store, _temp) = create_test_store();
        assert!(store.list_runs().await.unwrap().is_empty());

        let mut run = Run::new(json!({ "topic": "volcanoes" }), RunOptions::default());
        store.save_run(&run).await.unwrap();

        run.status = RunStatus::Running;
        store.save_run(&run).await.unwrap();

        let loaded = store.load_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.input, json!({ "topic": "volcanoes" }));
        assert_eq!(store.list_runs().await.unwrap(), vec![run.id]);
        assert!(store.load_run(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_driver_lease_is_exclusive() {
        let (store, _temp) = create_test_store();
        let run_id = Uuid::new_v4();

        let lease = store.acquire_driver(run_id).await.unwrap();
        let second = store.acquire_driver(run_id).await;
        assert!(matches!(second, Err(StoreError::Locked(id)) if id == run_id));

        drop(lease);
        assert!(store.acquire_driver(run_id).await.is_ok());
    }

    #[test]
    fn test_checkpoint_name_parsing() {
        assert_eq!(checkpoint_name(12, Phase::Qa), "000012-qa.json");
        assert_eq!(parse_checkpoint_name("000012-qa.json"), Some((12, Phase::Qa)));
        assert_eq!(parse_checkpoint_name(".tmpA1b2C3"), None);
        assert_eq!(parse_checkpoint_name("000001-render.json"), None);
    }
}
