//! Shared collaborators and configuration for the orchestrators.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::warn;

use coordination::{CacheStore, IdempotencyService};
use llm_router::{
    CallOutcome, ChatMessage, CompletionRequest, CompletionResponse, LlmRouter, PricingCatalog,
    Provider, RouterError, UsageContext, UsageRecorder, build_usage_record, estimate_tokens,
};
use review_domain::{
    AnalysisRepo, CommentRepo, DiffProvider, ReviewRepo, ReviewRequest, TaskKind,
};

use crate::chunker::ChunkerConfig;
use crate::prompts::PromptBuilder;

/// Which model serves the pipeline's calls.
#[derive(Debug, Clone)]
pub struct LlmTarget {
    pub provider: Provider,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Configuration row the usage records attribute to.
    pub llm_configuration_id: i64,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub chunker: ChunkerConfig,
    /// Concurrent chunk dispatches per review job.
    pub chunk_parallelism: usize,
    /// Hard cap on one job's wall-clock time.
    pub job_timeout: Duration,
    /// How long in-flight calls may finish after a timeout/cancel.
    pub grace_period: Duration,
    /// Analyses chunk only past this single-call budget.
    pub analysis_budget_tokens: u32,
    /// TTL of the memoised diff used by the analysis jobs.
    pub diff_cache_ttl: Duration,
    pub llm: LlmTarget,
}

impl PipelineConfig {
    pub fn with_target(llm: LlmTarget) -> Self {
        PipelineConfig {
            chunker: ChunkerConfig::default(),
            chunk_parallelism: 4,
            job_timeout: Duration::from_secs(30 * 60),
            grace_period: Duration::from_secs(10),
            analysis_budget_tokens: 12_000,
            diff_cache_ttl: Duration::from_secs(600),
            llm,
        }
    }
}

/// Everything a job needs, wired once at startup and shared.
pub struct PipelineContext {
    pub reviews: Arc<dyn ReviewRepo>,
    pub comments: Arc<dyn CommentRepo>,
    pub analyses: Arc<dyn AnalysisRepo>,
    pub prompts: PromptBuilder,
    pub diff_provider: Arc<dyn DiffProvider>,
    pub router: Arc<LlmRouter>,
    pub catalog: Arc<PricingCatalog>,
    pub recorder: Arc<UsageRecorder>,
    pub store: Arc<CacheStore>,
    pub idempotency: Arc<IdempotencyService>,
    pub cfg: PipelineConfig,
}

impl PipelineContext {
    /// Bind the router + accounting to one review, so every call records a
    /// usage row (success or failure) without the orchestrators repeating
    /// the bookkeeping.
    pub fn caller_for(&self, review: &ReviewRequest) -> LlmCaller<'_> {
        LlmCaller {
            router: &self.router,
            catalog: &self.catalog,
            recorder: &self.recorder,
            target: &self.cfg.llm,
            user_id: review.author_id,
            project_id: Some(review.project_id),
            review_request_id: Some(review.id),
        }
    }

    /// Mirror a progress step onto the review's pub/sub channel.
    pub async fn publish_progress(&self, review_id: i64, phase: &str, progress: u8) {
        let payload = json!({
            "reviewId": review_id,
            "phase": phase,
            "progress": progress,
        })
        .to_string();
        if let Err(e) = self
            .store
            .publish(&format!("review:{review_id}"), &payload)
            .await
        {
            warn!(review_id, error = %e, "progress publish failed");
        }
    }
}

/// One review's LLM entry point: builds requests from the configured
/// target, dispatches with fallback, and records usage either way.
pub struct LlmCaller<'a> {
    router: &'a LlmRouter,
    catalog: &'a PricingCatalog,
    recorder: &'a UsageRecorder,
    target: &'a LlmTarget,
    user_id: i64,
    project_id: Option<i64>,
    review_request_id: Option<i64>,
}

impl LlmCaller<'_> {
    fn usage_ctx(&self, task: TaskKind) -> UsageContext {
        UsageContext {
            user_id: self.user_id,
            project_id: self.project_id,
            review_request_id: self.review_request_id,
            llm_configuration_id: self.target.llm_configuration_id,
            operation: task,
        }
    }

    pub async fn call(
        &self,
        task: TaskKind,
        system: &str,
        user: &str,
    ) -> Result<CompletionResponse, RouterError> {
        let req = CompletionRequest {
            provider: self.target.provider,
            model: self.target.model.clone(),
            system: Some(system.to_string()),
            messages: vec![ChatMessage::user(user)],
            max_tokens: self.target.max_tokens,
            temperature: self.target.temperature,
            stop_sequences: Vec::new(),
            timeout: None,
        };
        let prompt_tokens = estimate_tokens(&req.prompt_text());
        let started = tokio::time::Instant::now();

        match self.router.complete_with_fallback(&req).await {
            Ok(resp) => {
                self.recorder.try_record(build_usage_record(
                    &self.usage_ctx(task),
                    resp.provider,
                    &resp.model,
                    CallOutcome::Success(&resp),
                    self.catalog,
                ));
                Ok(resp)
            }
            Err(err) => {
                self.recorder.try_record(build_usage_record(
                    &self.usage_ctx(task),
                    self.target.provider,
                    &self.target.model,
                    CallOutcome::Failure {
                        prompt_tokens,
                        error: err.to_string(),
                        latency_ms: started.elapsed().as_millis() as u64,
                    },
                    self.catalog,
                ));
                Err(err)
            }
        }
    }
}
