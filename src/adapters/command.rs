//! Subprocess phase executor.
//!
//! Spawns a configured command, writes `{"phase", "input", "state"}` as JSON
//! to its stdin and reads the phase slice as JSON from its stdout.
//!
//! Exit code 75 (`EX_TEMPFAIL`) and timeouts are reported as recoverable;
//! every other failure is fatal.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{ExecutorError, PhaseExecutor, StateSlice};
use crate::domain::{Phase, StateMap};

/// Exit code a command uses to ask for a retry (sysexits.h)
pub const EX_TEMPFAIL: i32 = 75;

fn default_timeout_seconds() -> u64 {
    300
}

/// How to invoke the command for one phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program to run
    pub command: String,

    /// Arguments passed verbatim
    #[serde(default)]
    pub args: Vec<String>,

    /// Per-call timeout (default: 300 = 5 min)
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            timeout_seconds: default_timeout_seconds(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Executor backed by an external program
pub struct CommandExecutor {
    spec: CommandSpec,
}

impl CommandExecutor {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    /// Run the command once and collect its stdout
    async fn run_subprocess(&self, phase: Phase, request: &[u8]) -> Result<Vec<u8>, ExecutorError> {
        let mut child = Command::new(&self.spec.command)
            .args(&self.spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecutorError::fatal(format!(
                    "failed to spawn '{}' for phase '{}': {}",
                    self.spec.command, phase, e
                ))
            })?;

        // Feed stdin while collecting output so a large request cannot stall
        // a child that never reads it; both share the call timeout
        let stdin = child.stdin.take();
        let feed = async move {
            match stdin {
                Some(mut stdin) => stdin.write_all(request).await,
                None => Ok(()),
            }
        };

        let (fed, output) = timeout(self.spec.timeout(), async {
            tokio::join!(feed, child.wait_with_output())
        })
        .await
        .map_err(|_| {
            ExecutorError::recoverable(format!(
                "'{}' timed out after {:?} in phase '{}'",
                self.spec.command,
                self.spec.timeout(),
                phase
            ))
        })?;

        let output = output.map_err(|e| {
            ExecutorError::fatal(format!("failed to wait for '{}': {}", self.spec.command, e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            let message = format!(
                "'{}' failed in phase '{}' with exit code {}: {}",
                self.spec.command,
                phase,
                exit_code,
                stderr.trim()
            );
            return Err(if exit_code == EX_TEMPFAIL {
                ExecutorError::Recoverable(message)
            } else {
                ExecutorError::Fatal(message)
            });
        }

        // A child may succeed without consuming its input
        if let Err(e) = fed {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(ExecutorError::recoverable(format!(
                    "failed to write to '{}' stdin: {}",
                    self.spec.command, e
                )));
            }
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl PhaseExecutor for CommandExecutor {
    fn name(&self) -> &str {
        &self.spec.command
    }

    async fn execute(
        &self,
        phase: Phase,
        input: &Value,
        state: &StateMap,
    ) -> Result<StateSlice, ExecutorError> {
        let request = serde_json::to_vec(&json!({
            "phase": phase,
            "input": input,
            "state": state,
        }))
        .map_err(|e| ExecutorError::fatal(format!("failed to encode request: {}", e)))?;

        debug!(%phase, command = %self.spec.command, bytes = request.len(), "Spawning phase command");
        let stdout = self.run_subprocess(phase, &request).await?;

        serde_json::from_slice(&stdout).map_err(|e| {
            ExecutorError::fatal(format!(
                "'{}' produced invalid JSON for phase '{}': {}",
                self.spec.command, phase, e
            ))
        })
    }
}
