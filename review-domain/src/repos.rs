//! Persistence contracts.
//!
//! The engine depends only on these narrow async traits; the host wires a
//! SQL implementation behind them. Transactional boundary: each single call
//! is one transaction — no cross-call atomicity is assumed anywhere, and the
//! batch comment insert exists precisely so one chunk's comments land
//! atomically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::analysis::{ImprovementSuggestion, PullRequestSummary, RiskAssessment};
use crate::comment::ReviewComment;
use crate::job::TaskKind;
use crate::review::{ReviewRequest, ReviewState};
use crate::template::PromptTemplate;
use crate::usage::TokenUsageRecord;

/// Convenient alias for repository results.
pub type RepoResult<T> = Result<T, RepoError>;

/// Persistence failures. `Unavailable` covers connection/transaction-level
/// trouble; `Conflict` covers constraint violations the caller may care
/// about (duplicate unique rows, illegal state updates).
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

#[async_trait]
pub trait ReviewRepo: Send + Sync {
    async fn get_by_id(&self, id: i64) -> RepoResult<Option<ReviewRequest>>;

    /// Persist a state change. Implementations reject transitions the state
    /// machine forbids with [`RepoError::Conflict`].
    async fn update_state(&self, id: i64, state: ReviewState) -> RepoResult<()>;
}

#[async_trait]
pub trait CommentRepo: Send + Sync {
    /// Insert one comment, returning its assigned id.
    async fn insert(&self, comment: ReviewComment) -> RepoResult<i64>;

    /// Insert a batch in a single transaction: either every comment lands
    /// or none do.
    async fn insert_batch(&self, comments: Vec<ReviewComment>) -> RepoResult<Vec<i64>>;

    /// Remove all AI-generated comments for a review (crash-resume path).
    async fn delete_ai_by_review(&self, review_id: i64) -> RepoResult<u64>;

    async fn list_by_review(&self, review_id: i64) -> RepoResult<Vec<ReviewComment>>;
}

#[async_trait]
pub trait AnalysisRepo: Send + Sync {
    /// Insert or replace the single risk row for a review.
    async fn upsert_risk(&self, risk: RiskAssessment) -> RepoResult<()>;

    /// Replace the full suggestion set for a review.
    async fn replace_suggestions(
        &self,
        review_id: i64,
        suggestions: Vec<ImprovementSuggestion>,
    ) -> RepoResult<()>;

    /// Insert or replace the single summary row for a review.
    async fn upsert_summary(&self, summary: PullRequestSummary) -> RepoResult<()>;
}

/// Aggregated usage numbers for a user or project over a date range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageStats {
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: Decimal,
}

/// Attribution scope for usage aggregation.
#[derive(Debug, Clone, Copy)]
pub enum UsageScope {
    User(i64),
    Project(i64),
}

#[async_trait]
pub trait UsageRepo: Send + Sync {
    async fn insert(&self, record: TokenUsageRecord) -> RepoResult<i64>;

    async fn sum_usage(
        &self,
        scope: UsageScope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> RepoResult<UsageStats>;
}

#[async_trait]
pub trait PromptRepo: Send + Sync {
    /// Resolve the template for `(project_id, task)`; `None` means neither a
    /// project-specific nor a global template exists and the caller should
    /// use its built-in default.
    async fn resolve(
        &self,
        project_id: Option<i64>,
        task: TaskKind,
    ) -> RepoResult<Option<PromptTemplate>>;
}
