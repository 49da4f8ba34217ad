//! Pipeline phases and their fixed ordering.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A named stage of the pipeline.
///
/// `Finalize` is not executed by any executor: it marks a run whose phases are
/// all done and which only needs to be sealed as completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Outline drafting
    #[serde(alias = "outline")]
    Brainstorm,

    /// Fact retrieval and citations
    Research,

    /// Slide content writing
    Content,

    /// Document assembly (produces the artifact reference)
    Design,

    /// Quality scoring
    Qa,

    /// Terminal marker, no executor
    Finalize,
}

impl Phase {
    /// Executable phases in pipeline order
    pub const PLAN: [Phase; 5] = [
        Phase::Brainstorm,
        Phase::Research,
        Phase::Content,
        Phase::Design,
        Phase::Qa,
    ];

    /// Phase every new run starts at
    pub fn first() -> Self {
        Phase::Brainstorm
    }

    /// The phase that follows this one on the forward path.
    ///
    /// The `qa -> content` edge is a routing decision made by the engine and is
    /// not represented here.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Brainstorm => Some(Phase::Research),
            Phase::Research => Some(Phase::Content),
            Phase::Content => Some(Phase::Design),
            Phase::Design => Some(Phase::Qa),
            Phase::Qa => Some(Phase::Finalize),
            Phase::Finalize => None,
        }
    }

    /// Whether an executor runs for this phase
    pub fn is_executable(self) -> bool {
        self != Phase::Finalize
    }

    /// Whether a run may pause for approval after this phase
    pub fn is_gateable(self) -> bool {
        matches!(self, Phase::Brainstorm | Phase::Research | Phase::Design)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Brainstorm => "brainstorm",
            Phase::Research => "research",
            Phase::Content => "content",
            Phase::Design => "design",
            Phase::Qa => "qa",
            Phase::Finalize => "finalize",
        }
    }
}

impl Default for Phase {
    fn default() -> Self {
        Self::first()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("Unknown phase '{0}' (expected one of: brainstorm, research, content, design, qa, finalize)")]
pub struct UnknownPhase(pub String);

impl FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "brainstorm" | "outline" => Ok(Phase::Brainstorm),
            "research" => Ok(Phase::Research),
            "content" => Ok(Phase::Content),
            "design" => Ok(Phase::Design),
            "qa" => Ok(Phase::Qa),
            "finalize" => Ok(Phase::Finalize),
            other => Err(UnknownPhase(other.to_string())),
        }
    }
}
