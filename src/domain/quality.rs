//! Quality report produced by the QA phase.
//!
//! The engine only reads the three core scores to decide whether content has
//! to be regenerated; everything else in the QA slice is opaque.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scores on a 1-5 scale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub content_score: f64,
    pub design_score: f64,
    pub coherence_score: f64,

    #[serde(default)]
    pub feedback: Option<String>,
}

impl QualityReport {
    /// Parse the QA slice; `None` if it does not carry a report
    pub fn from_slice(slice: &Value) -> Option<Self> {
        serde_json::from_value(slice.clone()).ok()
    }

    /// Every score must reach the threshold
    pub fn passes(&self, threshold: f64) -> bool {
        self.content_score >= threshold
            && self.design_score >= threshold
            && self.coherence_score >= threshold
    }

    /// Lowest of the three scores
    pub fn min_score(&self) -> f64 {
        self.content_score
            .min(self.design_score)
            .min(self.coherence_score)
    }
}
