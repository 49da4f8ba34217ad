//! Per-run event timeline with replay and live tail.
//!
//! Events are stored as newline-delimited JSON (JSONL) in
//! `<runs>/<run_id>/events.jsonl` and mirrored in memory. Sequence numbers are
//! assigned here, under a per-run writer lock, so they are gapless and start
//! at 1. Readers get an [`EventCursor`] that first replays the stored events
//! and then waits for new ones; the cursor ends once a terminal event has
//! been delivered.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, Stream};
use serde_json::Value;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::StoreError;
use crate::domain::{Event, EventKind};

/// Position of the newest event and whether the log accepts more
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct LogHead {
    last_seq: u64,
    closed: bool,
}

/// One run's log
struct RunLog {
    run_id: Uuid,
    path: Option<PathBuf>,
    events: RwLock<Vec<Event>>,
    head: watch::Sender<LogHead>,
    writer: Mutex<()>,
}

impl RunLog {
    fn new(run_id: Uuid, path: Option<PathBuf>, events: Vec<Event>) -> Self {
        let head = LogHead {
            last_seq: events.len() as u64,
            closed: events.last().map(Event::is_terminal).unwrap_or(false),
        };
        let (tx, _) = watch::channel(head);
        Self {
            run_id,
            path,
            events: RwLock::new(events),
            head: tx,
            writer: Mutex::new(()),
        }
    }
}

/// Append-only event timelines for all runs
pub struct EventTimeline {
    /// Runs directory; `None` keeps everything in memory
    root: Option<PathBuf>,
    logs: Mutex<HashMap<Uuid, Arc<RunLog>>>,
}

impl EventTimeline {
    /// Timelines persisted under `root/<run_id>/events.jsonl`
    pub fn persistent(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            logs: Mutex::new(HashMap::new()),
        }
    }

    /// Timelines that live only as long as this value
    pub fn in_memory() -> Self {
        Self {
            root: None,
            logs: Mutex::new(HashMap::new()),
        }
    }

    fn events_path(&self, run_id: Uuid) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|root| root.join(run_id.to_string()).join("events.jsonl"))
    }

    /// Get (loading from disk on first use) the log for a run
    async fn log(&self, run_id: Uuid) -> Result<Arc<RunLog>, StoreError> {
        if let Some(log) = self.logs.lock().await.get(&run_id) {
            return Ok(Arc::clone(log));
        }

        let path = self.events_path(run_id);
        let events = match &path {
            Some(path) => load_events(run_id, path).await?,
            None => Vec::new(),
        };

        let mut logs = self.logs.lock().await;
        let log = logs
            .entry(run_id)
            .or_insert_with(|| Arc::new(RunLog::new(run_id, path, events)));
        Ok(Arc::clone(log))
    }

    /// Append an event, assigning the next sequence number
    pub async fn append(
        &self,
        run_id: Uuid,
        kind: EventKind,
        payload: Value,
    ) -> Result<Event, StoreError> {
        let log = self.log(run_id).await?;
        let _writer = log.writer.lock().await;

        let head = *log.head.borrow();
        if head.closed {
            return Err(StoreError::Closed(run_id));
        }

        let event = Event::new(run_id, head.last_seq + 1, kind, payload);
        if let Some(path) = &log.path {
            append_line(path, &event).await?;
        }

        log.events.write().await.push(event.clone());
        let terminal = event.is_terminal();
        log.head.send_modify(|head| {
            head.last_seq = event.seq;
            head.closed |= terminal;
        });

        debug!(%run_id, seq = event.seq, kind = %event.kind, "Event appended");
        Ok(event)
    }

    /// Cursor delivering every event with `seq >= from`, then live events
    /// until the timeline closes
    pub async fn read_from(&self, run_id: Uuid, from: u64) -> Result<EventCursor, StoreError> {
        let log = self.log(run_id).await?;
        let rx = log.head.subscribe();
        Ok(EventCursor {
            log,
            rx,
            next_seq: from.max(1),
        })
    }

    /// Events already stored with `seq >= from`
    pub async fn snapshot(&self, run_id: Uuid, from: u64) -> Result<Vec<Event>, StoreError> {
        let log = self.log(run_id).await?;
        let events = log.events.read().await;
        let start = (from.max(1) - 1) as usize;
        Ok(events.iter().skip(start).cloned().collect())
    }

    /// Sequence number of the newest event (0 when empty)
    pub async fn last_seq(&self, run_id: Uuid) -> Result<u64, StoreError> {
        Ok(self.log(run_id).await?.head.borrow().last_seq)
    }

    /// Whether a terminal event has been appended (or the log was closed)
    pub async fn is_closed(&self, run_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.log(run_id).await?.head.borrow().closed)
    }

    /// Stop accepting events and release waiting readers
    pub async fn close(&self, run_id: Uuid) -> Result<(), StoreError> {
        let log = self.log(run_id).await?;
        let _writer = log.writer.lock().await;
        log.head.send_if_modified(|head| !std::mem::replace(&mut head.closed, true));
        Ok(())
    }

    /// Pick up events another process appended to the stored log; returns
    /// how many were new. Only sound while holding the run's driver lease.
    pub async fn sync(&self, run_id: Uuid) -> Result<usize, StoreError> {
        let log = self.log(run_id).await?;
        let Some(path) = &log.path else {
            return Ok(0);
        };
        let _writer = log.writer.lock().await;

        let stored = load_events(run_id, path).await?;
        let known = log.head.borrow().last_seq as usize;
        if stored.len() <= known {
            return Ok(0);
        }

        let fresh = &stored[known..];
        let last_seq = stored.len() as u64;
        let terminal = fresh.iter().any(Event::is_terminal);
        log.events.write().await.extend_from_slice(fresh);
        log.head.send_modify(|head| {
            head.last_seq = last_seq;
            head.closed |= terminal;
        });

        debug!(run_id = %log.run_id, fresh = fresh.len(), last_seq, "Timeline synced from disk");
        Ok(fresh.len())
    }

    /// Drop closed, persisted logs that no cursor is reading; they are
    /// reloaded from disk on next use. Returns how many were dropped.
    pub async fn prune(&self) -> usize {
        let mut logs = self.logs.lock().await;
        let before = logs.len();
        logs.retain(|_, log| {
            let idle = log.path.is_some()
                && log.head.borrow().closed
                && Arc::strong_count(log) == 1;
            !idle
        });
        before - logs.len()
    }
}

/// Reader over one run's timeline
pub struct EventCursor {
    log: Arc<RunLog>,
    rx: watch::Receiver<LogHead>,
    next_seq: u64,
}

impl EventCursor {
    /// Next event in sequence order; `None` once the timeline is closed and
    /// fully delivered
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            let head = *self.rx.borrow_and_update();

            if self.next_seq <= head.last_seq {
                let index = (self.next_seq - 1) as usize;
                let event = self.log.events.read().await.get(index).cloned();
                if let Some(event) = event {
                    self.next_seq += 1;
                    return Some(event);
                }
            }

            if head.closed {
                return None;
            }

            // Sender lives in the log, which this cursor keeps alive
            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Sequence number the next delivered event will carry
    pub fn position(&self) -> u64 {
        self.next_seq
    }

    pub fn into_stream(self) -> impl Stream<Item = Event> + Send {
        stream::unfold(self, |mut cursor| async move {
            cursor.next().await.map(|event| (event, cursor))
        })
    }
}

/// Write one event as a JSONL line
async fn append_line(path: &Path, event: &Event) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| StoreError::io(path, e))?;

    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    file.write_all(&line).await.map_err(|e| StoreError::io(path, e))?;
    file.sync_data().await.map_err(|e| StoreError::io(path, e))?;

    Ok(())
}

/// Read a stored timeline. A torn final line (crash mid-append) is cut off;
/// anything else out of place is corruption.
async fn load_events(run_id: Uuid, path: &Path) -> Result<Vec<Event>, StoreError> {
    if !fs::try_exists(path).await.map_err(|e| StoreError::io(path, e))? {
        return Ok(Vec::new());
    }

    let bytes = fs::read(path).await.map_err(|e| StoreError::io(path, e))?;
    let mut events = Vec::new();
    let mut valid_len = 0usize;

    for (index, raw) in bytes.split_inclusive(|b| *b == b'\n').enumerate() {
        let complete = raw.ends_with(b"\n");
        let line = raw.strip_suffix(b"\n").unwrap_or(raw);

        if line.iter().all(u8::is_ascii_whitespace) {
            valid_len += raw.len();
            continue;
        }

        let event: Event = match serde_json::from_slice(line) {
            Ok(event) => event,
            Err(_) if !complete => {
                warn!(%run_id, path = %path.display(), "Discarding torn final event line");
                break;
            }
            Err(e) => {
                return Err(StoreError::Corrupt {
                    path: path.to_path_buf(),
                    reason: format!("line {}: {}", index + 1, e),
                })
            }
        };

        let expected = events.len() as u64 + 1;
        if event.seq != expected || event.run_id != run_id {
            return Err(StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: format!(
                    "line {}: expected seq {} for run {}, found seq {} for run {}",
                    index + 1,
                    expected,
                    run_id,
                    event.seq,
                    event.run_id
                ),
            });
        }

        events.push(event);
        valid_len += raw.len();
    }

    if valid_len < bytes.len() {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        file.set_len(valid_len as u64)
            .await
            .map_err(|e| StoreError::io(path, e))?;
    }

    Ok(events)
}
