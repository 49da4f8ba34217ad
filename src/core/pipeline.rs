//! Pipeline settings and the driver's retry policy.
//!
//! The phase order is fixed; what a deployment configures is which phase
//! boundaries need human approval, the QA routing parameters and how
//! recoverable executor failures are retried.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::{Phase, RunOptions};

fn default_quality_threshold() -> f64 {
    RunOptions::default().quality_threshold
}

fn default_max_regenerations() -> u32 {
    RunOptions::default().max_regenerations
}

/// Deployment-level pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Phases after which a run pauses for approval
    #[serde(default)]
    pub approval_phases: BTreeSet<Phase>,

    /// Default minimum QA score for new runs
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,

    /// Default bound on content regenerations for new runs
    #[serde(default = "default_max_regenerations")]
    pub max_regenerations: u32,

    /// Retry policy for recoverable executor failures
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            approval_phases: BTreeSet::new(),
            quality_threshold: default_quality_threshold(),
            max_regenerations: default_max_regenerations(),
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineSettings {
    /// Parse settings from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline settings YAML")
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        for phase in &self.approval_phases {
            if !phase.is_gateable() {
                anyhow::bail!(
                    "'{}' cannot require approval (only brainstorm, research and design can)",
                    phase
                );
            }
        }

        if !self.quality_threshold.is_finite() || self.quality_threshold < 0.0 {
            anyhow::bail!(
                "quality_threshold must be a non-negative number, got {}",
                self.quality_threshold
            );
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }

        if self.retry.backoff_multiplier < 1.0 {
            anyhow::bail!(
                "retry.backoff_multiplier must be >= 1.0, got {}",
                self.retry.backoff_multiplier
            );
        }

        Ok(())
    }

    /// Options stamped onto a run created without explicit ones
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            quality_threshold: self.quality_threshold,
            max_regenerations: self.max_regenerations,
        }
    }

    pub fn requires_approval(&self, phase: Phase) -> bool {
        self.approval_phases.contains(&phase)
    }
}

/// Retry policy for recoverable phase failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Retry immediately, up to `max_attempts` attempts in total
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
