//! Analysis jobs: risk assessment, improvement suggestions, PR summary,
//! and the composite job that sequences all three.
//!
//! These tasks usually fit one LLM call; the diff is memoised in the cache
//! so the three siblings don't refetch it, and chunking only kicks in past
//! the single-call budget (results are then folded back together).

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use coordination::{ClaimOutcome, ExecutionHandle, SkipReason};
use llm_router::estimate_tokens;
use review_domain::{
    DiffFile, ImprovementSuggestion, JobKind, PullRequestSummary, ReviewRequest, RiskAssessment,
    TaskKind,
};

use crate::chunker::{ChunkerConfig, chunk_diff, context_digest, render_diff};
use crate::context::PipelineContext;
use crate::errors::{JobOutcome, PipelineError};
use crate::parse::{
    self, ImprovementsEnvelope, Parsed, REPAIR_SYSTEM, RiskEnvelope, SummaryEnvelope,
};
use crate::prompts::PromptVars;

/// How long the composite waits for a child claim held by another worker.
const CHILD_WAIT: Duration = Duration::from_secs(120);

/// The three sibling analysis tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisKind {
    Risk,
    Improvements,
    Summary,
}

impl AnalysisKind {
    pub fn all() -> [AnalysisKind; 3] {
        [
            AnalysisKind::Risk,
            AnalysisKind::Improvements,
            AnalysisKind::Summary,
        ]
    }

    pub fn job_kind(self) -> JobKind {
        match self {
            AnalysisKind::Risk => JobKind::RiskAnalysis,
            AnalysisKind::Improvements => JobKind::ImprovementSuggestions,
            AnalysisKind::Summary => JobKind::PrSummary,
        }
    }

    pub fn task(self) -> TaskKind {
        match self {
            AnalysisKind::Risk => TaskKind::RiskAnalysis,
            AnalysisKind::Improvements => TaskKind::ImprovementSuggestions,
            AnalysisKind::Summary => TaskKind::PullRequestSummary,
        }
    }
}

/// Run one standalone analysis job to a terminal state.
pub async fn run_analysis_job(
    ctx: Arc<PipelineContext>,
    kind: AnalysisKind,
    review_id: i64,
    cancel: watch::Receiver<bool>,
) -> Result<JobOutcome, PipelineError> {
    let handle = match ctx.idempotency.claim(kind.job_kind(), review_id).await? {
        ClaimOutcome::Acquired(h) => h,
        ClaimOutcome::Skipped(reason) => {
            info!(review_id, job = %kind.job_kind(), %reason, "analysis job skipped");
            return Ok(JobOutcome::Skipped(reason));
        }
    };

    match analysis_inner(&ctx, kind, review_id, &handle, &cancel).await {
        Ok(()) => {
            handle.complete().await?;
            Ok(JobOutcome::Completed)
        }
        Err(PipelineError::Cancelled) => {
            handle
                .fail("Cancelled", "analysis cancelled; nothing persisted")
                .await?;
            Ok(JobOutcome::Cancelled)
        }
        Err(e) => {
            warn!(review_id, job = %kind.job_kind(), error = %e, "analysis job failed");
            if let Err(fail_err) = handle.fail(e.kind(), &e.to_string()).await {
                warn!(review_id, error = %fail_err, "could not settle failed execution");
            }
            Err(e)
        }
    }
}

/// The composite job: outer claim plus nested child claims. A child held by
/// another worker is waited out rather than aborting the composite; a
/// failed child leaves the others' rows in place and the composite reports
/// partial success.
pub async fn run_comprehensive_job(
    ctx: Arc<PipelineContext>,
    review_id: i64,
    cancel: watch::Receiver<bool>,
) -> Result<JobOutcome, PipelineError> {
    let handle = match ctx.idempotency.claim(JobKind::Comprehensive, review_id).await? {
        ClaimOutcome::Acquired(h) => h,
        ClaimOutcome::Skipped(reason) => {
            info!(review_id, %reason, "comprehensive job skipped");
            return Ok(JobOutcome::Skipped(reason));
        }
    };

    let total = AnalysisKind::all().len();
    let mut failed = 0usize;
    let mut cancelled = false;

    for (i, kind) in AnalysisKind::all().into_iter().enumerate() {
        if *cancel.borrow() {
            cancelled = true;
            break;
        }
        let phase = format!("{}", kind.job_kind());
        handle
            .report_progress((i * 100 / total) as u8, &phase)
            .await?;
        ctx.publish_progress(review_id, &phase, (i * 100 / total) as u8)
            .await;

        match ctx.idempotency.claim(kind.job_kind(), review_id).await? {
            ClaimOutcome::Acquired(child) => {
                match analysis_inner(&ctx, kind, review_id, &child, &cancel).await {
                    Ok(()) => child.complete().await?,
                    Err(e) => {
                        warn!(review_id, job = %kind.job_kind(), error = %e, "child analysis failed");
                        failed += 1;
                        if let Err(fail_err) = child.fail(e.kind(), &e.to_string()).await {
                            warn!(review_id, error = %fail_err, "could not settle child execution");
                        }
                    }
                }
            }
            ClaimOutcome::Skipped(SkipReason::RecentlyCompleted) => {
                debug!(review_id, job = %kind.job_kind(), "child recently completed, reusing");
            }
            ClaimOutcome::Skipped(_) => {
                debug!(review_id, job = %kind.job_kind(), "child running elsewhere, waiting");
                if !ctx
                    .idempotency
                    .await_completion(kind.job_kind(), review_id, CHILD_WAIT)
                    .await?
                {
                    failed += 1;
                }
            }
        }
    }

    if cancelled {
        handle.fail("Cancelled", "comprehensive job cancelled").await?;
        return Ok(JobOutcome::Cancelled);
    }

    handle.complete().await?;
    if failed == 0 {
        Ok(JobOutcome::Completed)
    } else {
        Ok(JobOutcome::PartialSuccess { failed, total })
    }
}

async fn analysis_inner(
    ctx: &Arc<PipelineContext>,
    kind: AnalysisKind,
    review_id: i64,
    handle: &ExecutionHandle,
    cancel: &watch::Receiver<bool>,
) -> Result<(), PipelineError> {
    handle.report_progress(0, "Preparing").await?;
    let review = ctx
        .reviews
        .get_by_id(review_id)
        .await?
        .ok_or(PipelineError::ReviewNotFound(review_id))?;

    let diff = cached_diff(ctx, &review).await?;
    if diff.is_empty() {
        debug!(review_id, job = %kind.job_kind(), "empty diff, nothing to analyze");
        handle.report_progress(100, "Finalising").await?;
        return Ok(());
    }

    // One call when the whole diff fits the analysis budget.
    let full = render_diff(&diff);
    let payloads: Vec<String> = if estimate_tokens(&full) <= ctx.cfg.analysis_budget_tokens {
        vec![full]
    } else {
        let cfg = ChunkerConfig {
            target_tokens: ctx.cfg.analysis_budget_tokens,
        };
        chunk_diff(review_id, &diff, &cfg)
            .into_iter()
            .map(|c| c.payload)
            .collect()
    };

    let file_list: Vec<String> = diff.iter().map(|f| f.path.clone()).collect();
    let digest = context_digest(&diff);
    let caller = ctx.caller_for(&review);
    let task = kind.task();
    let total = payloads.len();

    let mut raw_outputs: Vec<String> = Vec::with_capacity(total);
    for (i, payload) in payloads.iter().enumerate() {
        if *cancel.borrow() {
            return Err(PipelineError::Cancelled);
        }
        handle
            .report_progress(
                (10 + i * 70 / total) as u8,
                &format!("Dispatching({}/{total})", i + 1),
            )
            .await?;

        let prompt = ctx
            .prompts
            .build(
                task,
                &PromptVars {
                    review: &review,
                    diff: payload,
                    file_list: &file_list,
                    context: &digest,
                },
            )
            .await?;
        match caller.call(task, &prompt.system, &prompt.user).await {
            Ok(resp) => raw_outputs.push(resp.text),
            Err(err) => {
                warn!(review_id, job = %kind.job_kind(), part = i, error = %err, "analysis call failed");
            }
        }
    }
    if raw_outputs.is_empty() {
        return Err(PipelineError::LlmUnavailable(
            "all analysis calls failed".to_string(),
        ));
    }

    handle.report_progress(85, "Aggregating").await?;
    match kind {
        AnalysisKind::Risk => {
            let mut risks: Vec<RiskAssessment> = Vec::new();
            for raw in &raw_outputs {
                if let Ok(parsed) = parse_with_repair::<RiskEnvelope>(&caller, task, raw).await {
                    risks.push(parse::map_risk(parsed.value, review_id, &ctx.cfg.llm.model));
                }
            }
            let merged = merge_risks(risks).ok_or(PipelineError::ParseFailed)?;
            ctx.analyses.upsert_risk(merged).await?;
        }
        AnalysisKind::Improvements => {
            let mut suggestions: Vec<ImprovementSuggestion> = Vec::new();
            let mut any = false;
            for raw in &raw_outputs {
                if let Ok(parsed) =
                    parse_with_repair::<ImprovementsEnvelope>(&caller, task, raw).await
                {
                    any = true;
                    suggestions.extend(parse::map_suggestions(parsed.value, review_id));
                }
            }
            if !any {
                return Err(PipelineError::ParseFailed);
            }
            ctx.analyses
                .replace_suggestions(review_id, suggestions)
                .await?;
        }
        AnalysisKind::Summary => {
            let mut summaries: Vec<PullRequestSummary> = Vec::new();
            for raw in &raw_outputs {
                if let Ok(parsed) = parse_with_repair::<SummaryEnvelope>(&caller, task, raw).await {
                    summaries.push(parse::map_summary(parsed.value, review_id));
                }
            }
            let merged = merge_summaries(summaries, &diff).ok_or(PipelineError::ParseFailed)?;
            ctx.analyses.upsert_summary(merged).await?;
        }
    }

    handle.report_progress(100, "Finalising").await?;
    ctx.publish_progress(review_id, "Finalising", 100).await;
    Ok(())
}

async fn parse_with_repair<T>(
    caller: &crate::context::LlmCaller<'_>,
    task: TaskKind,
    raw: &str,
) -> Result<Parsed<T>, parse::ParseFailed>
where
    T: serde::de::DeserializeOwned + parse::VersionTagged,
{
    parse::parse_envelope::<T, _, _>(raw, |broken| async move {
        caller
            .call(task, REPAIR_SYSTEM, &broken)
            .await
            .ok()
            .map(|r| r.text)
    })
    .await
}

/// Memoised diff fetch: cache-aside on `diff:{review}:{branch digest}`.
/// Reviews are keyed by branches here; hosts that track head SHAs should
/// fold them into the digest.
async fn cached_diff(
    ctx: &PipelineContext,
    review: &ReviewRequest,
) -> Result<Vec<DiffFile>, PipelineError> {
    let mut hasher = Sha256::new();
    hasher.update(review.target_branch.as_bytes());
    hasher.update(b"|");
    hasher.update(review.base_branch.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    let key = format!("diff:{}:{}", review.id, &digest[..12]);

    if let Some(cached) = ctx.store.get(&key).await? {
        if let Ok(files) = serde_json::from_str::<Vec<DiffFile>>(&cached) {
            debug!(review_id = review.id, "diff cache hit");
            return Ok(files);
        }
    }
    let files = ctx.diff_provider.get_diff(review).await?;
    match serde_json::to_string(&files) {
        Ok(json) => {
            ctx.store
                .set(&key, &json, Some(ctx.cfg.diff_cache_ttl))
                .await?;
        }
        Err(e) => warn!(review_id = review.id, error = %e, "diff memoisation skipped"),
    }
    Ok(files)
}

/// Fold multi-part risk results: worst score per axis, joined narratives,
/// averaged confidence.
fn merge_risks(mut risks: Vec<RiskAssessment>) -> Option<RiskAssessment> {
    let first = risks.pop()?;
    let mut merged = first;
    let mut confidences = vec![merged.confidence_score];
    for r in risks {
        merged.overall_risk_score = merged.overall_risk_score.max(r.overall_risk_score);
        merged.complexity_risk = merged.complexity_risk.max(r.complexity_risk);
        merged.security_risk = merged.security_risk.max(r.security_risk);
        merged.performance_risk = merged.performance_risk.max(r.performance_risk);
        merged.maintainability_risk = merged.maintainability_risk.max(r.maintainability_risk);
        if !r.risk_description.is_empty() {
            if !merged.risk_description.is_empty() {
                merged.risk_description.push('\n');
            }
            merged.risk_description.push_str(&r.risk_description);
        }
        if !r.mitigation_suggestions.is_empty() {
            if !merged.mitigation_suggestions.is_empty() {
                merged.mitigation_suggestions.push('\n');
            }
            merged.mitigation_suggestions.push_str(&r.mitigation_suggestions);
        }
        confidences.push(r.confidence_score);
    }
    merged.confidence_score = confidences.iter().sum::<f32>() / confidences.len() as f32;
    Some(merged)
}

/// Fold multi-part summaries: the first part carries the narrative, key
/// changes are merged, and the statistics are recomputed from the diff when
/// the model left them empty.
fn merge_summaries(
    mut summaries: Vec<PullRequestSummary>,
    diff: &[DiffFile],
) -> Option<PullRequestSummary> {
    if summaries.is_empty() {
        return None;
    }
    let mut merged = summaries.remove(0);
    for s in summaries {
        for change in s.key_changes {
            if !merged.key_changes.contains(&change) {
                merged.key_changes.push(change);
            }
        }
    }
    if merged.change_statistics.is_null() {
        let added: u32 = diff.iter().map(|f| f.added_lines).sum();
        let deleted: u32 = diff.iter().map(|f| f.deleted_lines).sum();
        merged.change_statistics = serde_json::json!({
            "filesChanged": diff.len(),
            "linesAdded": added,
            "linesDeleted": deleted,
        });
    }
    Some(merged)
}
