//! Queue consumer loop.
//!
//! The external broker delivers `JobMessage`s at least once; this loop is
//! the "message arrives → invoke orchestrator" contract. Skips are acks,
//! errors are logged and acked too (redelivery is the broker's call), and
//! intake pauses while the provider semaphores are near saturation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};

use review_domain::JobKind;
use review_pipeline::{
    AnalysisKind, JobOutcome, PipelineContext, run_analysis_job, run_comprehensive_job,
    run_review_job,
};

/// Saturation level above which intake pauses for a second.
const BACKPRESSURE_THRESHOLD: f64 = 0.9;
const BACKPRESSURE_PAUSE: Duration = Duration::from_secs(1);

/// One queue message. No payload beyond ids: jobs reload their state from
/// the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_kind: JobKind,
    pub review_id: i64,
    pub enqueued_at: DateTime<Utc>,
    pub attempt: u32,
}

pub struct Worker {
    ctx: Arc<PipelineContext>,
    rx: mpsc::Receiver<JobMessage>,
    shutdown: watch::Receiver<bool>,
    concurrency: usize,
}

impl Worker {
    /// Build a worker plus the sender the host enqueues through.
    pub fn new(
        ctx: Arc<PipelineContext>,
        capacity: usize,
        concurrency: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (Worker, mpsc::Sender<JobMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Worker {
                ctx,
                rx,
                shutdown,
                concurrency: concurrency.max(1),
            },
            tx,
        )
    }

    /// Consume until shutdown, then drain in-flight jobs.
    pub async fn run(mut self) {
        let mut join_set: JoinSet<()> = JoinSet::new();
        info!(concurrency = self.concurrency, "worker loop started");

        loop {
            if self.ctx.router.saturation() > BACKPRESSURE_THRESHOLD {
                warn!("provider semaphores saturated, pausing intake");
                tokio::time::sleep(BACKPRESSURE_PAUSE).await;
                continue;
            }
            while join_set.len() >= self.concurrency {
                let _ = join_set.join_next().await;
            }

            tokio::select! {
                res = self.shutdown.changed() => {
                    if res.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { break };
                    let ctx = Arc::clone(&self.ctx);
                    let cancel = self.shutdown.clone();
                    join_set.spawn(async move {
                        dispatch(ctx, msg, cancel).await;
                    });
                }
            }
        }

        info!(in_flight = join_set.len(), "worker draining");
        while join_set.join_next().await.is_some() {}
        info!("worker stopped");
    }
}

async fn dispatch(ctx: Arc<PipelineContext>, msg: JobMessage, cancel: watch::Receiver<bool>) {
    let review_id = msg.review_id;
    let kind = msg.job_kind;
    let result = match kind {
        JobKind::AiReview => run_review_job(ctx, review_id, cancel).await,
        JobKind::RiskAnalysis => {
            run_analysis_job(ctx, AnalysisKind::Risk, review_id, cancel).await
        }
        JobKind::ImprovementSuggestions => {
            run_analysis_job(ctx, AnalysisKind::Improvements, review_id, cancel).await
        }
        JobKind::PrSummary => {
            run_analysis_job(ctx, AnalysisKind::Summary, review_id, cancel).await
        }
        JobKind::Comprehensive => run_comprehensive_job(ctx, review_id, cancel).await,
    };

    match result {
        Ok(JobOutcome::Skipped(reason)) => {
            info!(%kind, review_id, %reason, attempt = msg.attempt, "job skipped, acked");
        }
        Ok(outcome) => {
            info!(%kind, review_id, ?outcome, attempt = msg.attempt, "job finished");
        }
        Err(e) => {
            // Acked regardless: retries arrive via queue redelivery or a
            // manual re-enqueue, never by looping here.
            warn!(%kind, review_id, error = %e, attempt = msg.attempt, "job failed");
        }
    }
}
