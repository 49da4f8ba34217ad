//! Phase executor interface.
//!
//! Executors are the external collaborators that do the actual work of a
//! phase (outline drafting, research, slide writing, document assembly,
//! scoring). The engine only sees this boundary.

pub mod command;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::domain::{Phase, StateMap};

// Re-export the subprocess executor
pub use command::{CommandExecutor, CommandSpec, EX_TEMPFAIL};

/// Output of one phase, stored under that phase's key in the run state
pub type StateSlice = Value;

/// Failure reported by an executor
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    /// Transient; the driver's retry policy may call the phase again
    #[error("recoverable executor error: {0}")]
    Recoverable(String),

    /// Terminates the run
    #[error("fatal executor error: {0}")]
    Fatal(String),
}

impl ExecutorError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Recoverable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }

    /// The message without the classification prefix
    pub fn message(&self) -> &str {
        match self {
            Self::Recoverable(m) | Self::Fatal(m) => m,
        }
    }
}

/// Trait for phase executors
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    /// Human-readable executor name
    fn name(&self) -> &str;

    /// Compute the slice for `phase` from the run input and the state
    /// accumulated by earlier phases
    async fn execute(
        &self,
        phase: Phase,
        input: &Value,
        state: &StateMap,
    ) -> Result<StateSlice, ExecutorError>;
}
