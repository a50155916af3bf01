//! Job and task kinds shared by the queue, the idempotency layer, and the
//! orchestrators.

use serde::{Deserialize, Serialize};

/// Kinds of background jobs the engine executes. Used as the first half of
/// every idempotency key, so the spellings are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    #[serde(rename = "AIReview")]
    AiReview,
    RiskAnalysis,
    ImprovementSuggestions,
    #[serde(rename = "PRSummary")]
    PrSummary,
    Comprehensive,
}

impl JobKind {
    /// Stable spelling used inside cache keys and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::AiReview => "AIReview",
            JobKind::RiskAnalysis => "RiskAnalysis",
            JobKind::ImprovementSuggestions => "ImprovementSuggestions",
            JobKind::PrSummary => "PRSummary",
            JobKind::Comprehensive => "Comprehensive",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four LLM task flavors. Selects the prompt template, the response
/// schema, and the usage attribution of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Review,
    RiskAnalysis,
    PullRequestSummary,
    ImprovementSuggestions,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Review => "Review",
            TaskKind::RiskAnalysis => "RiskAnalysis",
            TaskKind::PullRequestSummary => "PullRequestSummary",
            TaskKind::ImprovementSuggestions => "ImprovementSuggestions",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
