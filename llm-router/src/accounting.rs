//! Token estimation and best-effort usage recording.
//!
//! Recording is asynchronous with respect to the orchestrator's critical
//! path: rows go into a bounded channel and a background task writes them
//! through the usage repository. A full channel drops the row (with a
//! counter and a warning) rather than stalling a review.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use review_domain::usage::{TokenUsageRecord, UsageDraft};
use review_domain::{TaskKind, UsageRepo};

use crate::pricing::{CostBreakdown, PricingCatalog};
use crate::request::{CompletionResponse, Provider};

/// Default heuristic: roughly four bytes per token. Providers that report
/// authoritative counts override this; treat the result as ±20 %.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len().div_ceil(4)) as u32
}

enum Msg {
    Record(Box<TokenUsageRecord>),
    Flush(oneshot::Sender<()>),
}

/// Background usage writer.
pub struct UsageRecorder {
    tx: mpsc::Sender<Msg>,
    dropped: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UsageRecorder {
    /// Spawn the flush task with a bounded buffer.
    pub fn spawn(repo: Arc<dyn UsageRepo>, capacity: usize) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Msg>(capacity.max(1));
        let worker = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    Msg::Record(record) => {
                        if let Err(e) = repo.insert(*record).await {
                            warn!(error = %e, "usage record insert failed");
                        }
                    }
                    Msg::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            debug!("usage recorder drained");
        });
        Arc::new(UsageRecorder {
            tx,
            dropped: AtomicU64::new(0),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueue a row without blocking. Overflow drops the row; the review
    /// must never fail because accounting is behind.
    pub fn try_record(&self, record: TokenUsageRecord) {
        if self.tx.try_send(Msg::Record(Box::new(record))).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped, "usage buffer full, dropping record");
        }
    }

    /// Number of rows lost to buffer overflow since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait until everything enqueued so far has been written.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Msg::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Drain the buffer with a deadline; called on process shutdown.
    pub async fn shutdown(&self, deadline: Duration) {
        if tokio::time::timeout(deadline, self.flush()).await.is_err() {
            warn!("usage recorder shutdown deadline hit, records may be lost");
        }
        if let Some(worker) = self.worker.lock().await.take() {
            worker.abort();
        }
    }
}

/// Attribution for one LLM call.
#[derive(Debug, Clone)]
pub struct UsageContext {
    pub user_id: i64,
    pub project_id: Option<i64>,
    pub review_request_id: Option<i64>,
    pub llm_configuration_id: i64,
    pub operation: TaskKind,
}

/// What happened to the call, from the accountant's point of view.
pub enum CallOutcome<'a> {
    Success(&'a CompletionResponse),
    Failure {
        prompt_tokens: u32,
        error: String,
        latency_ms: u64,
    },
}

/// Build the usage row for a call. Unknown pricing yields a zero-cost row
/// flagged in `error_message`; failed calls carry zero cost by policy.
pub fn build_usage_record(
    ctx: &UsageContext,
    provider: Provider,
    model: &str,
    outcome: CallOutcome<'_>,
    catalog: &PricingCatalog,
) -> TokenUsageRecord {
    match outcome {
        CallOutcome::Success(resp) => {
            let (cost, pricing_note) =
                match catalog.cost(provider, model, resp.prompt_tokens, resp.completion_tokens) {
                    Ok(c) => (c, None),
                    Err(e) => {
                        warn!(%provider, model, "recording zero-cost usage row: {e}");
                        (CostBreakdown::zero(), Some(e.to_string()))
                    }
                };
            TokenUsageRecord::new(UsageDraft {
                user_id: ctx.user_id,
                project_id: ctx.project_id,
                review_request_id: ctx.review_request_id,
                llm_configuration_id: ctx.llm_configuration_id,
                provider: provider.as_str().to_string(),
                model: model.to_string(),
                operation_type: ctx.operation,
                prompt_tokens: resp.prompt_tokens,
                completion_tokens: resp.completion_tokens,
                prompt_cost: cost.prompt_cost,
                completion_cost: cost.completion_cost,
                is_successful: true,
                error_message: pricing_note,
                response_time_ms: resp.latency_ms,
                was_cache_hit: false,
            })
        }
        CallOutcome::Failure {
            prompt_tokens,
            error,
            latency_ms,
        } => TokenUsageRecord::new(UsageDraft {
            user_id: ctx.user_id,
            project_id: ctx.project_id,
            review_request_id: ctx.review_request_id,
            llm_configuration_id: ctx.llm_configuration_id,
            provider: provider.as_str().to_string(),
            model: model.to_string(),
            operation_type: ctx.operation,
            prompt_tokens,
            completion_tokens: 0,
            prompt_cost: rust_decimal::Decimal::ZERO,
            completion_cost: rust_decimal::Decimal::ZERO,
            is_successful: false,
            error_message: Some(error),
            response_time_ms: latency_ms,
            was_cache_hit: false,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::FinishReason;
    use review_domain::memory::InMemoryUsageRepo;
    use rust_decimal_macros::dec;

    fn ctx() -> UsageContext {
        UsageContext {
            user_id: 1,
            project_id: Some(2),
            review_request_id: Some(42),
            llm_configuration_id: 7,
            operation: TaskKind::Review,
        }
    }

    fn response(prompt: u32, completion: u32) -> CompletionResponse {
        CompletionResponse {
            provider: Provider::OpenAi,
            model: "gpt-4o-mini".into(),
            text: "{}".into(),
            prompt_tokens: prompt,
            completion_tokens: completion,
            finish_reason: FinishReason::Stop,
            latency_ms: 120,
        }
    }

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(4000)), 1000);
    }

    #[test]
    fn unknown_pricing_records_a_flagged_zero_cost_row() {
        let catalog = PricingCatalog::empty();
        let resp = response(100, 50);
        let rec = build_usage_record(
            &ctx(),
            Provider::OpenAi,
            "gpt-4o-mini",
            CallOutcome::Success(&resp),
            &catalog,
        );
        assert!(rec.is_successful);
        assert_eq!(rec.total_cost, dec!(0));
        assert!(rec.error_message.unwrap().contains("no pricing"));
        assert!(!rec.was_cache_hit);
        assert_eq!(rec.total_tokens, 150);
    }

    #[test]
    fn failed_calls_record_unsuccessful_rows() {
        let catalog = PricingCatalog::with_defaults();
        let rec = build_usage_record(
            &ctx(),
            Provider::OpenAi,
            "gpt-4o-mini",
            CallOutcome::Failure {
                prompt_tokens: 80,
                error: "server error: status 503".into(),
                latency_ms: 30,
            },
            &catalog,
        );
        assert!(!rec.is_successful);
        assert_eq!(rec.completion_tokens, 0);
        assert_eq!(rec.total_cost, dec!(0));
    }

    #[tokio::test]
    async fn recorder_flushes_in_background() {
        let repo = Arc::new(InMemoryUsageRepo::new());
        let recorder = UsageRecorder::spawn(repo.clone(), 16);
        let catalog = PricingCatalog::with_defaults();

        let resp = response(1000, 200);
        recorder.try_record(build_usage_record(
            &ctx(),
            Provider::OpenAi,
            "gpt-4o-mini",
            CallOutcome::Success(&resp),
            &catalog,
        ));
        recorder.flush().await;

        let rows = repo.records();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_tokens, 1200);
        assert_eq!(
            rows[0].total_cost,
            rows[0].prompt_cost + rows[0].completion_cost
        );
        recorder.shutdown(Duration::from_secs(1)).await;
    }
}
