//! In-memory repository implementations.
//!
//! Behaviourally equivalent to the SQL-backed host repositories: unique-row
//! semantics for risk/summary, batch inserts all-or-nothing, state updates
//! validated against the review state machine. Used by the test suites and
//! by hosts that run the engine without a database.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::analysis::{ImprovementSuggestion, PullRequestSummary, RiskAssessment};
use crate::comment::ReviewComment;
use crate::diff::{DiffError, DiffFile, DiffProvider};
use crate::job::TaskKind;
use crate::repos::{
    AnalysisRepo, CommentRepo, PromptRepo, RepoError, RepoResult, ReviewRepo, UsageRepo,
    UsageScope, UsageStats,
};
use crate::review::{ReviewRequest, ReviewState};
use crate::template::PromptTemplate;
use crate::usage::TokenUsageRecord;

/// Reviews keyed by id.
#[derive(Default)]
pub struct InMemoryReviewRepo {
    rows: Mutex<HashMap<i64, ReviewRequest>>,
    /// When set, every call fails with `Unavailable` (failure injection).
    poisoned: Mutex<Option<String>>,
}

impl InMemoryReviewRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, review: ReviewRequest) {
        self.rows.lock().unwrap().insert(review.id, review);
    }

    pub fn poison(&self, reason: &str) {
        *self.poisoned.lock().unwrap() = Some(reason.to_string());
    }

    fn check(&self) -> RepoResult<()> {
        match &*self.poisoned.lock().unwrap() {
            Some(r) => Err(RepoError::Unavailable(r.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ReviewRepo for InMemoryReviewRepo {
    async fn get_by_id(&self, id: i64) -> RepoResult<Option<ReviewRequest>> {
        self.check()?;
        Ok(self.rows.lock().unwrap().get(&id).cloned())
    }

    async fn update_state(&self, id: i64, state: ReviewState) -> RepoResult<()> {
        self.check()?;
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| RepoError::NotFound(format!("review {id}")))?;
        if row.state != state && !row.state.can_transition_to(state) {
            return Err(RepoError::Conflict(format!(
                "illegal transition {} -> {}",
                row.state, state
            )));
        }
        row.state = state;
        row.updated_at = Utc::now();
        Ok(())
    }
}

/// Comment rows with a monotonically assigned id.
#[derive(Default)]
pub struct InMemoryCommentRepo {
    rows: Mutex<Vec<ReviewComment>>,
    next_id: AtomicI64,
    poisoned: Mutex<Option<String>>,
}

impl InMemoryCommentRepo {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    /// Fail every subsequent write with `Unavailable` (failure injection).
    pub fn poison(&self, reason: &str) {
        *self.poisoned.lock().unwrap() = Some(reason.to_string());
    }

    /// Undo [`poison`](Self::poison).
    pub fn heal(&self) {
        *self.poisoned.lock().unwrap() = None;
    }

    fn check(&self) -> RepoResult<()> {
        match &*self.poisoned.lock().unwrap() {
            Some(r) => Err(RepoError::Unavailable(r.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CommentRepo for InMemoryCommentRepo {
    async fn insert(&self, mut comment: ReviewComment) -> RepoResult<i64> {
        self.check()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        comment.id = id;
        self.rows.lock().unwrap().push(comment);
        Ok(id)
    }

    async fn insert_batch(&self, comments: Vec<ReviewComment>) -> RepoResult<Vec<i64>> {
        self.check()?;
        let mut rows = self.rows.lock().unwrap();
        let mut ids = Vec::with_capacity(comments.len());
        for mut c in comments {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            c.id = id;
            ids.push(id);
            rows.push(c);
        }
        Ok(ids)
    }

    async fn delete_ai_by_review(&self, review_id: i64) -> RepoResult<u64> {
        self.check()?;
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|c| !(c.review_id == review_id && c.is_ai_generated));
        Ok((before - rows.len()) as u64)
    }

    async fn list_by_review(&self, review_id: i64) -> RepoResult<Vec<ReviewComment>> {
        self.check()?;
        let mut out: Vec<ReviewComment> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.review_id == review_id)
            .cloned()
            .collect();
        // Presentation order: by file then line; unanchored comments last.
        out.sort_by(|a, b| {
            (a.file_path.clone(), a.line_number.map(|l| l as i64).unwrap_or(i64::MAX))
                .cmp(&(b.file_path.clone(), b.line_number.map(|l| l as i64).unwrap_or(i64::MAX)))
        });
        Ok(out)
    }
}

/// Unique-per-review risk and summary rows plus the replaceable suggestion
/// set.
#[derive(Default)]
pub struct InMemoryAnalysisRepo {
    risks: Mutex<HashMap<i64, RiskAssessment>>,
    summaries: Mutex<HashMap<i64, PullRequestSummary>>,
    suggestions: Mutex<HashMap<i64, Vec<ImprovementSuggestion>>>,
    next_id: AtomicI64,
}

impl InMemoryAnalysisRepo {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    pub fn risk_for(&self, review_id: i64) -> Option<RiskAssessment> {
        self.risks.lock().unwrap().get(&review_id).cloned()
    }

    pub fn risk_count(&self) -> usize {
        self.risks.lock().unwrap().len()
    }

    pub fn summary_for(&self, review_id: i64) -> Option<PullRequestSummary> {
        self.summaries.lock().unwrap().get(&review_id).cloned()
    }

    pub fn suggestions_for(&self, review_id: i64) -> Vec<ImprovementSuggestion> {
        self.suggestions
            .lock()
            .unwrap()
            .get(&review_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl AnalysisRepo for InMemoryAnalysisRepo {
    async fn upsert_risk(&self, risk: RiskAssessment) -> RepoResult<()> {
        self.risks.lock().unwrap().insert(risk.review_id, risk);
        Ok(())
    }

    async fn replace_suggestions(
        &self,
        review_id: i64,
        suggestions: Vec<ImprovementSuggestion>,
    ) -> RepoResult<()> {
        let mut numbered = suggestions;
        for s in numbered.iter_mut() {
            s.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        }
        self.suggestions.lock().unwrap().insert(review_id, numbered);
        Ok(())
    }

    async fn upsert_summary(&self, summary: PullRequestSummary) -> RepoResult<()> {
        self.summaries
            .lock()
            .unwrap()
            .insert(summary.review_id, summary);
        Ok(())
    }
}

/// Append-only usage log.
#[derive(Default)]
pub struct InMemoryUsageRepo {
    rows: Mutex<Vec<TokenUsageRecord>>,
    next_id: AtomicI64,
}

impl InMemoryUsageRepo {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<TokenUsageRecord> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl UsageRepo for InMemoryUsageRepo {
    async fn insert(&self, mut record: TokenUsageRecord) -> RepoResult<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        record.id = id;
        self.rows.lock().unwrap().push(record);
        Ok(id)
    }

    async fn sum_usage(
        &self,
        scope: UsageScope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> RepoResult<UsageStats> {
        let rows = self.rows.lock().unwrap();
        let mut stats = UsageStats::default();
        for r in rows.iter() {
            let in_scope = match scope {
                UsageScope::User(u) => r.user_id == u,
                UsageScope::Project(p) => r.project_id == Some(p),
            };
            if !in_scope || r.created_at < from || r.created_at > to {
                continue;
            }
            stats.calls += 1;
            stats.prompt_tokens += u64::from(r.prompt_tokens);
            stats.completion_tokens += u64::from(r.completion_tokens);
            stats.total_tokens += u64::from(r.total_tokens);
            stats.total_cost += r.total_cost;
        }
        Ok(stats)
    }
}

/// Template store resolving project-specific rows before global defaults.
#[derive(Default)]
pub struct InMemoryPromptRepo {
    rows: Mutex<Vec<PromptTemplate>>,
}

impl InMemoryPromptRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, template: PromptTemplate) {
        self.rows.lock().unwrap().push(template);
    }
}

#[async_trait]
impl PromptRepo for InMemoryPromptRepo {
    async fn resolve(
        &self,
        project_id: Option<i64>,
        task: TaskKind,
    ) -> RepoResult<Option<PromptTemplate>> {
        let rows = self.rows.lock().unwrap();
        let pick = |pid: Option<i64>| {
            rows.iter()
                .filter(|t| t.project_id == pid && t.task == task)
                .max_by_key(|t| t.version)
                .cloned()
        };
        if project_id.is_some() {
            if let Some(t) = pick(project_id) {
                return Ok(Some(t));
            }
        }
        Ok(pick(None))
    }
}

/// Diff provider returning a fixed answer per review id.
#[derive(Default)]
pub struct StaticDiffProvider {
    diffs: Mutex<HashMap<i64, Vec<DiffFile>>>,
    failure: Mutex<Option<fn() -> DiffError>>,
}

impl StaticDiffProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, review_id: i64, files: Vec<DiffFile>) {
        self.diffs.lock().unwrap().insert(review_id, files);
    }

    /// Every subsequent `get_diff` fails with the produced error.
    pub fn fail_with(&self, make: fn() -> DiffError) {
        *self.failure.lock().unwrap() = Some(make);
    }
}

#[async_trait]
impl DiffProvider for StaticDiffProvider {
    async fn get_diff(&self, review: &ReviewRequest) -> Result<Vec<DiffFile>, DiffError> {
        if let Some(make) = *self.failure.lock().unwrap() {
            return Err(make());
        }
        Ok(self
            .diffs
            .lock()
            .unwrap()
            .get(&review.id)
            .cloned()
            .unwrap_or_default())
    }
}
