mod config;
mod telemetry;
mod worker;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use coordination::{CacheStore, IdempotencyService};
use llm_router::{
    AdapterConfig, AzureAdapter, DeepSeekAdapter, LlmRouter, OpenAiAdapter, PricingCatalog,
    Provider, ProviderAdapter, RouterConfig, UsageRecorder,
};
use review_domain::memory::{
    InMemoryAnalysisRepo, InMemoryCommentRepo, InMemoryPromptRepo, InMemoryReviewRepo,
    InMemoryUsageRepo, StaticDiffProvider,
};
use review_pipeline::{LlmTarget, PipelineConfig, PipelineContext, PromptBuilder};

use config::AppConfig;
use worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env when present.
    dotenvy::dotenv().ok();
    telemetry::init();

    let cfg = AppConfig::from_env().context("configuration invalid")?;

    let store = Arc::new(if cfg.redis_url == "memory://" {
        CacheStore::memory(&cfg.redis_prefix)
    } else {
        CacheStore::connect(&cfg.redis_url, &cfg.redis_prefix)
            .await
            .context("redis connection failed")?
    });
    let idempotency = Arc::new(IdempotencyService::new(
        Arc::clone(&store),
        cfg.locks.clone(),
        &cfg.instance_name,
    )?);

    let adapter_cfg = AdapterConfig {
        endpoint: cfg.llm_endpoint.clone(),
        api_key: cfg.llm_api_key.clone(),
        timeout_secs: Some(120),
        api_version: cfg.llm_api_version.clone(),
    };
    let adapter = match cfg.llm_provider {
        Provider::OpenAi => ProviderAdapter::OpenAi(OpenAiAdapter::new(adapter_cfg)?),
        Provider::Azure => ProviderAdapter::Azure(AzureAdapter::new(adapter_cfg)?),
        Provider::DeepSeek => ProviderAdapter::DeepSeek(DeepSeekAdapter::new(adapter_cfg)?),
    };
    let mut router = LlmRouter::new(RouterConfig {
        per_provider_concurrency: cfg.llm_concurrency,
        retry: cfg.llm_retry.clone(),
        fallback: cfg.fallback.clone(),
        ..RouterConfig::default()
    });
    router.register(cfg.llm_provider, adapter);

    // Repository wiring. The in-memory implementations satisfy the same
    // behavioural contracts as the host's SQL repositories; swap them at
    // this seam.
    let usage_repo = Arc::new(InMemoryUsageRepo::new());
    let recorder = UsageRecorder::spawn(
        Arc::clone(&usage_repo) as Arc<dyn review_domain::UsageRepo>,
        cfg.usage_buffer,
    );

    let pipeline_cfg = {
        let mut p = PipelineConfig::with_target(LlmTarget {
            provider: cfg.llm_provider,
            model: cfg.llm_model.clone(),
            max_tokens: Some(4096),
            temperature: Some(0.2),
            llm_configuration_id: cfg.llm_configuration_id,
        });
        p.chunker = cfg.chunker.clone();
        p.chunk_parallelism = cfg.chunk_parallelism;
        p.job_timeout = cfg.job_timeout;
        p
    };

    let ctx = Arc::new(PipelineContext {
        reviews: Arc::new(InMemoryReviewRepo::new()),
        comments: Arc::new(InMemoryCommentRepo::new()),
        analyses: Arc::new(InMemoryAnalysisRepo::new()),
        prompts: PromptBuilder::new(Arc::new(InMemoryPromptRepo::new())),
        diff_provider: Arc::new(StaticDiffProvider::new()),
        router: Arc::new(router),
        catalog: Arc::new(PricingCatalog::with_defaults()),
        recorder: Arc::clone(&recorder),
        store,
        idempotency,
        cfg: pipeline_cfg,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (worker, _enqueue) = Worker::new(
        Arc::clone(&ctx),
        cfg.queue_capacity,
        cfg.worker_concurrency,
        shutdown_rx,
    );
    let worker_task = tokio::spawn(worker.run());

    info!(
        instance = %cfg.instance_name,
        provider = %cfg.llm_provider,
        model = %cfg.llm_model,
        "ai review worker ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = worker_task.await;
    recorder.shutdown(std::time::Duration::from_secs(5)).await;

    Ok(())
}
