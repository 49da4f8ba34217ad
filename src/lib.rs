//! deckrun - Resumable multi-phase pipeline executor
//!
//! Drives runs through the phases brainstorm, research, content, design and
//! qa, with one bounded backward edge (qa back to content when the quality
//! report misses its threshold).
//!
//! # Architecture
//!
//! - A checkpoint is written after every completed phase; a run resumes at
//!   the phase its latest checkpoint names, without re-executing anything
//! - Configured phase boundaries pause the run until a human approves
//! - Every transition is appended to a per-run event timeline that any
//!   number of readers can replay and tail
//!
//! # Modules
//!
//! - `adapters`: Phase executor interface and the subprocess executor
//! - `core`: Engine, run manager, checkpoint store, timeline, approval gate
//! - `domain`: Data structures (Run, Phase, Checkpoint, Event)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Start a run
//! deckrun run --topic "tidal energy"
//!
//! # Approve a paused run and continue it
//! deckrun approve <run-id> --notes "outline looks good"
//!
//! # Follow the timeline
//! deckrun events <run-id> --follow
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{ExecutorError, PhaseExecutor, StateSlice};
pub use core::{EngineError, PipelineEngine, PipelineSettings, RunManager};
pub use domain::{Event, EventKind, Phase, Run, RunStatus};
