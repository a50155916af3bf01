//! The review job: claim → prepare → chunk → dispatch → aggregate →
//! finalise.
//!
//! Chunks fan out under bounded parallelism and persist as they arrive; a
//! chunk that the model or parser cannot handle leaves an informational
//! marker comment and the job carries on. Only a persistence failure aborts
//! the whole job (and leaves no dedup marker, so redelivery reruns it).
//!
//! Cancellation is cooperative: the external cancel signal and the job
//! timeout both flip a job-local flag that every chunk task checks before
//! its LLM call; in-flight calls get a grace period, then are aborted.

use std::sync::Arc;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use coordination::{ClaimOutcome, ExecutionHandle};
use review_domain::{
    Category, JobKind, RepoError, ReviewComment, ReviewRequest, ReviewState, Severity, TaskKind,
};

use crate::chunker::{Chunk, chunk_diff, context_digest};
use crate::context::PipelineContext;
use crate::errors::{JobOutcome, PipelineError};
use crate::parse::{self, LineIndex, REPAIR_SYSTEM, ReviewEnvelope};
use crate::prompts::PromptVars;

/// Text of the marker comment left on a chunk the AI could not handle.
const FAILED_SECTION_NOTE: &str = "AI could not process this section.";

/// Run one AI review job to a terminal state. Skips (already running,
/// recently completed, lock contested) are successful no-ops.
pub async fn run_review_job(
    ctx: Arc<PipelineContext>,
    review_id: i64,
    cancel: watch::Receiver<bool>,
) -> Result<JobOutcome, PipelineError> {
    let handle = match ctx.idempotency.claim(JobKind::AiReview, review_id).await? {
        ClaimOutcome::Acquired(h) => h,
        ClaimOutcome::Skipped(reason) => {
            info!(review_id, %reason, "review job skipped");
            return Ok(JobOutcome::Skipped(reason));
        }
    };

    match run_inner(Arc::clone(&ctx), review_id, &handle, cancel).await {
        Ok(JobOutcome::Cancelled) => {
            ctx.publish_progress(review_id, "Partial", 100).await;
            handle
                .fail("Cancelled", "job cancelled or timed out; partial results retained")
                .await?;
            Ok(JobOutcome::Cancelled)
        }
        Ok(outcome) => {
            handle.complete().await?;
            ctx.publish_progress(review_id, "Completed", 100).await;
            Ok(outcome)
        }
        Err(e) => {
            warn!(review_id, error = %e, "review job failed");
            if let Err(fail_err) = handle.fail(e.kind(), &e.to_string()).await {
                warn!(review_id, error = %fail_err, "could not settle failed execution");
            }
            ctx.publish_progress(review_id, "Failed", 100).await;
            Err(e)
        }
    }
}

async fn run_inner(
    ctx: Arc<PipelineContext>,
    review_id: i64,
    handle: &ExecutionHandle,
    cancel: watch::Receiver<bool>,
) -> Result<JobOutcome, PipelineError> {
    handle.report_progress(0, "Preparing").await?;
    ctx.publish_progress(review_id, "Preparing", 0).await;

    let review = ctx
        .reviews
        .get_by_id(review_id)
        .await?
        .ok_or(PipelineError::ReviewNotFound(review_id))?;
    if !review.state.accepts_ai_jobs() {
        return Err(PipelineError::InvalidState {
            id: review_id,
            state: review.state,
        });
    }

    // Fatal diff errors leave the review untouched in its current state.
    let diff = ctx.diff_provider.get_diff(&review).await?;
    ctx.reviews
        .update_state(review_id, ReviewState::AiReviewing)
        .await?;

    handle.report_progress(10, "Chunking").await?;
    ctx.publish_progress(review_id, "Chunking", 10).await;
    let started = std::time::Instant::now();
    let chunks = chunk_diff(review_id, &diff, &ctx.cfg.chunker);
    if started.elapsed() > std::time::Duration::from_secs(2) {
        warn!(
            review_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "chunking exceeded its soft time cap"
        );
    }

    // Previously persisted AI comments are wiped so a crash-resume or rerun
    // converges to a single coherent comment set.
    ctx.comments.delete_ai_by_review(review_id).await?;

    if chunks.is_empty() {
        debug!(review_id, "empty diff, nothing to review");
        ctx.reviews
            .update_state(review_id, ReviewState::HumanReview)
            .await?;
        handle.report_progress(100, "Finalising").await?;
        return Ok(JobOutcome::Completed);
    }

    let total = chunks.len();
    let digest = Arc::new(context_digest(&diff));
    let lines = Arc::new(parse::line_index(&diff));
    let review = Arc::new(review);

    handle
        .report_progress(15, &format!("Dispatching(0/{total})"))
        .await?;
    ctx.publish_progress(review_id, &format!("Dispatching(0/{total})"), 15)
        .await;

    let (job_cancel_tx, job_cancel_rx) = watch::channel(false);
    let semaphore = Arc::new(Semaphore::new(ctx.cfg.chunk_parallelism.max(1)));
    let mut join_set = JoinSet::new();
    for chunk in chunks {
        let sem = Arc::clone(&semaphore);
        let tctx = Arc::clone(&ctx);
        let treview = Arc::clone(&review);
        let tdigest = Arc::clone(&digest);
        let tlines = Arc::clone(&lines);
        let tcancel = job_cancel_rx.clone();
        join_set.spawn(async move {
            let _permit = match sem.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return ChunkDone::Cancelled,
            };
            process_chunk(tctx, treview, chunk, tdigest, tlines, tcancel).await
        });
    }

    let deadline = tokio::time::Instant::now() + ctx.cfg.job_timeout;
    let mut grace_deadline = deadline + ctx.cfg.grace_period;
    let mut ext_cancel = cancel;
    let mut ext_cancel_closed = false;
    let mut winding_down = false;
    let mut aborted = false;
    let mut cancelled = false;
    let mut completed = 0usize;
    let mut failed = 0usize;
    let mut persist_err: Option<RepoError> = None;

    loop {
        tokio::select! {
            next = join_set.join_next() => {
                let Some(res) = next else { break };
                completed += 1;
                match res {
                    Ok(ChunkDone::Persisted(count)) => {
                        debug!(review_id, completed, count, "chunk persisted");
                    }
                    Ok(ChunkDone::FailedSection) => failed += 1,
                    Ok(ChunkDone::Cancelled) => {}
                    Ok(ChunkDone::PersistError(e)) => {
                        if persist_err.is_none() {
                            persist_err = Some(e);
                        }
                        let _ = job_cancel_tx.send(true);
                        join_set.abort_all();
                    }
                    Err(join_err) => {
                        if !join_err.is_cancelled() {
                            warn!(review_id, error = %join_err, "chunk task panicked");
                            failed += 1;
                        }
                    }
                }
                if !winding_down && persist_err.is_none() {
                    let pct = (15 + completed * 70 / total) as u8;
                    let phase = format!("Dispatching({completed}/{total})");
                    handle.report_progress(pct, &phase).await?;
                    ctx.publish_progress(review_id, &phase, pct).await;
                }
            }
            _ = tokio::time::sleep_until(deadline), if !winding_down => {
                warn!(review_id, "job timeout, winding down with grace period");
                winding_down = true;
                cancelled = true;
                grace_deadline = tokio::time::Instant::now() + ctx.cfg.grace_period;
                let _ = job_cancel_tx.send(true);
            }
            res = ext_cancel.changed(), if !winding_down && !ext_cancel_closed => {
                match res {
                    Ok(()) if *ext_cancel.borrow() => {
                        info!(review_id, "cancel signal received, winding down");
                        winding_down = true;
                        cancelled = true;
                        grace_deadline = tokio::time::Instant::now() + ctx.cfg.grace_period;
                        let _ = job_cancel_tx.send(true);
                    }
                    Ok(()) => {}
                    Err(_) => ext_cancel_closed = true,
                }
            }
            _ = tokio::time::sleep_until(grace_deadline), if winding_down && !aborted => {
                warn!(review_id, "grace period elapsed, aborting in-flight chunks");
                join_set.abort_all();
                aborted = true;
            }
        }
    }

    if let Some(e) = persist_err {
        return Err(PipelineError::Persistence(e));
    }
    if cancelled {
        // Review stays in AIReviewing with the partial marker; persisted
        // chunk results are retained.
        handle
            .report_progress((15 + completed * 70 / total.max(1)) as u8, "Partial")
            .await?;
        return Ok(JobOutcome::Cancelled);
    }

    handle.report_progress(90, "Aggregating").await?;
    ctx.publish_progress(review_id, "Aggregating", 90).await;
    info!(
        review_id,
        chunks = total,
        failed_chunks = failed,
        "dispatch finished"
    );

    ctx.reviews
        .update_state(review_id, ReviewState::HumanReview)
        .await?;
    handle.report_progress(100, "Finalising").await?;
    ctx.publish_progress(review_id, "Finalising", 100).await;

    if failed == 0 {
        Ok(JobOutcome::Completed)
    } else {
        Ok(JobOutcome::PartialSuccess { failed, total })
    }
}

enum ChunkDone {
    /// Comments (possibly zero) landed in one transaction.
    Persisted(usize),
    /// LLM or parser gave up on this chunk; a marker comment was left.
    FailedSection,
    Cancelled,
    PersistError(RepoError),
}

async fn process_chunk(
    ctx: Arc<PipelineContext>,
    review: Arc<ReviewRequest>,
    chunk: Chunk,
    digest: Arc<String>,
    lines: Arc<LineIndex>,
    cancel: watch::Receiver<bool>,
) -> ChunkDone {
    if *cancel.borrow() {
        return ChunkDone::Cancelled;
    }

    let prompt = match ctx
        .prompts
        .build(
            TaskKind::Review,
            &PromptVars {
                review: &review,
                diff: &chunk.payload,
                file_list: &chunk.files,
                context: &digest,
            },
        )
        .await
    {
        Ok(p) => p,
        Err(e) => return ChunkDone::PersistError(e),
    };

    let caller = ctx.caller_for(&review);
    let response = match caller
        .call(TaskKind::Review, &prompt.system, &prompt.user)
        .await
    {
        Ok(resp) => resp,
        Err(err) => {
            warn!(chunk = %chunk.id, error = %err, "chunk llm call failed");
            return persist_marker(&ctx, &review, &chunk).await;
        }
    };

    let caller_ref = &caller;
    let parsed =
        parse::parse_envelope::<ReviewEnvelope, _, _>(&response.text, |broken| async move {
            caller_ref
                .call(TaskKind::Review, REPAIR_SYSTEM, &broken)
                .await
                .ok()
                .map(|r| r.text)
        })
        .await;

    match parsed {
        Ok(parsed) => {
            if parsed.repaired {
                debug!(chunk = %chunk.id, "chunk output needed a repair pass");
            }
            let comments = parse::map_review_comments(parsed.value, review.id, &lines);
            let count = comments.len();
            if count == 0 {
                return ChunkDone::Persisted(0);
            }
            match ctx.comments.insert_batch(comments).await {
                Ok(_) => ChunkDone::Persisted(count),
                Err(e) => ChunkDone::PersistError(e),
            }
        }
        Err(failure) => {
            warn!(
                chunk = %chunk.id,
                raw_len = failure.raw.len(),
                "chunk output unparseable, dropping its comments"
            );
            persist_marker(&ctx, &review, &chunk).await
        }
    }
}

/// Leave the informational marker for a chunk the AI could not process.
async fn persist_marker(
    ctx: &PipelineContext,
    review: &ReviewRequest,
    chunk: &Chunk,
) -> ChunkDone {
    let marker = ReviewComment {
        id: 0,
        review_id: review.id,
        file_path: chunk.files.first().cloned(),
        line_number: None,
        severity: Severity::Info,
        category: Category::Quality,
        content: FAILED_SECTION_NOTE.to_string(),
        suggestion: None,
        is_ai_generated: true,
        author_name: None,
        created_at: chrono::Utc::now(),
    };
    match ctx.comments.insert(marker).await {
        Ok(_) => ChunkDone::FailedSection,
        Err(e) => ChunkDone::PersistError(e),
    }
}
