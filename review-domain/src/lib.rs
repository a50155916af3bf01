//! Shared domain model for the AI review backend.
//!
//! Everything downstream crates agree on lives here:
//! - review entities and the review state machine,
//! - the normalized diff model handed over by the diff provider,
//! - AI output entities (comments, risk assessment, suggestions, summary),
//! - token usage rows and prompt templates,
//! - the persistence contracts (one call = one transaction) together with
//!   in-memory implementations for tests and SQL-less hosts.
//!
//! The crate is intentionally free of I/O beyond the async contracts; all
//! heavy lifting (Redis, HTTP, orchestration) lives in sibling crates.

pub mod analysis;
pub mod comment;
pub mod diff;
pub mod job;
pub mod memory;
pub mod repos;
pub mod review;
pub mod template;
pub mod usage;

pub use analysis::{ImprovementSuggestion, PullRequestSummary, RiskAssessment};
pub use comment::{Category, ReviewComment, Severity};
pub use diff::{DiffError, DiffFile, DiffHunk, DiffLine, DiffProvider, FileStatus};
pub use job::{JobKind, TaskKind};
pub use repos::{
    AnalysisRepo, CommentRepo, PromptRepo, RepoError, RepoResult, ReviewRepo, UsageRepo,
    UsageScope, UsageStats,
};
pub use review::{ReviewRequest, ReviewState};
pub use template::PromptTemplate;
pub use usage::TokenUsageRecord;
