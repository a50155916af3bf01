//! Pipeline error kinds and job outcomes.

use thiserror::Error;

use coordination::{CacheError, SkipReason};
use review_domain::{DiffError, RepoError, ReviewState};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("review {0} not found")]
    ReviewNotFound(i64),

    #[error("review {id} in state {state} does not accept AI jobs")]
    InvalidState { id: i64, state: ReviewState },

    #[error(transparent)]
    Diff(#[from] DiffError),

    #[error(transparent)]
    Persistence(#[from] RepoError),

    #[error(transparent)]
    Coordination(#[from] CacheError),

    /// Every LLM call for a must-succeed unit failed terminally.
    #[error("provider unavailable: {0}")]
    LlmUnavailable(String),

    /// No usable envelope survived the repair pass.
    #[error("model output unparseable")]
    ParseFailed,

    /// Cooperative cancellation observed mid-unit.
    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Short failure kind recorded on the execution hash.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::ReviewNotFound(_) => "ReviewNotFound",
            PipelineError::InvalidState { .. } => "InvalidState",
            PipelineError::Diff(DiffError::BranchMissing(_)) => "BranchMissing",
            PipelineError::Diff(DiffError::AuthRequired) => "AuthRequired",
            PipelineError::Diff(DiffError::RepoUnavailable(_)) => "RepoUnavailable",
            PipelineError::Persistence(_) => "PersistenceFailed",
            PipelineError::Coordination(_) => "CoordinationFailed",
            PipelineError::LlmUnavailable(_) => "ProviderUnavailable",
            PipelineError::ParseFailed => "ParseFailed",
            PipelineError::Cancelled => "Cancelled",
        }
    }
}

/// Terminal state of one job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Everything the job set out to do landed.
    Completed,
    /// At least one but not all units succeeded.
    PartialSuccess { failed: usize, total: usize },
    /// Cancelled by user/admin action or the job timeout; partial results
    /// are retained.
    Cancelled,
    /// The claim was skipped; nothing ran.
    Skipped(SkipReason),
}
