//! Environment-driven configuration with startup validation.
//!
//! Every knob has a default; only the LLM credentials are required when a
//! real provider is configured. Validation failures abort the process
//! before anything is claimed or consumed.

use std::time::Duration;

use thiserror::Error;

use coordination::IdempotencyConfig;
use llm_router::{FallbackTarget, Provider, RetryConfig};
use review_pipeline::ChunkerConfig;

/// Convenient alias for config results.
pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing or empty.
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),

    /// A number failed to parse (ports, limits, timeouts).
    #[error("invalid number in {var}: {reason}")]
    InvalidNumber {
        var: &'static str,
        reason: &'static str,
    },

    /// Unsupported provider in `LLM_PROVIDER`.
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),

    /// Value had the wrong format (e.g. invalid URL).
    #[error("invalid format in {var}: {reason}")]
    InvalidFormat {
        var: &'static str,
        reason: &'static str,
    },

    /// Cross-field constraint violated (lock/heartbeat ratios etc.).
    #[error("invalid configuration: {0}")]
    Constraint(String),
}

/* ------------------------ Env helpers ------------------------ */

fn must_env(name: &'static str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingVar(name)),
    }
}

fn env_or(name: &'static str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_u64(name: &'static str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v.parse::<u64>().map_err(|_| ConfigError::InvalidNumber {
            var: name,
            reason: "expected u64",
        }),
        _ => Ok(default),
    }
}

fn env_usize(name: &'static str, default: usize) -> Result<usize> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => {
            v.parse::<usize>().map_err(|_| ConfigError::InvalidNumber {
                var: name,
                reason: "expected usize",
            })
        }
        _ => Ok(default),
    }
}

fn env_opt(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/* ------------------------ App config ------------------------ */

pub struct AppConfig {
    /// Redis endpoint; the literal `memory://` selects the in-process
    /// backend (single-node development).
    pub redis_url: String,
    /// Keyspace prefix for every cache key.
    pub redis_prefix: String,
    /// Name this instance reports as the execution owner.
    pub instance_name: String,

    pub locks: IdempotencyConfig,

    pub llm_provider: Provider,
    pub llm_model: String,
    pub llm_endpoint: String,
    pub llm_api_key: Option<String>,
    pub llm_api_version: Option<String>,
    pub llm_configuration_id: i64,
    pub llm_concurrency: usize,
    pub llm_retry: RetryConfig,
    pub fallback: Option<FallbackTarget>,

    pub chunker: ChunkerConfig,
    pub chunk_parallelism: usize,
    pub job_timeout: Duration,

    pub queue_capacity: usize,
    pub worker_concurrency: usize,
    pub usage_buffer: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<AppConfig> {
        let redis_url = env_or("REDIS_URL", "memory://");
        if redis_url != "memory://" && !redis_url.starts_with("redis://") {
            return Err(ConfigError::InvalidFormat {
                var: "REDIS_URL",
                reason: "must be redis://… or memory://",
            });
        }

        let locks = IdempotencyConfig {
            lock_ttl: Duration::from_secs(env_u64("LOCK_TTL_SECONDS", 30)?),
            heartbeat_interval: Duration::from_secs(env_u64("LOCK_HEARTBEAT_SECONDS", 5)?),
            liveness_window: Duration::from_secs(env_u64("LOCK_LIVENESS_SECONDS", 15)?),
            dedup_window: Duration::from_secs(env_u64("LOCK_DEDUP_SECONDS", 300)?),
            execution_timeout: Duration::from_secs(env_u64("JOB_TIMEOUT_MINUTES", 30)? * 60),
        };
        locks
            .validate()
            .map_err(|e| ConfigError::Constraint(e.to_string()))?;

        let provider_raw = env_or("LLM_PROVIDER", "OpenAI");
        let llm_provider = match provider_raw.to_ascii_lowercase().as_str() {
            "openai" => Provider::OpenAi,
            "azure" => Provider::Azure,
            "deepseek" => Provider::DeepSeek,
            _ => return Err(ConfigError::UnsupportedProvider(provider_raw)),
        };
        let llm_endpoint = match llm_provider {
            Provider::OpenAi => env_or("LLM_ENDPOINT", "https://api.openai.com"),
            Provider::DeepSeek => env_or("LLM_ENDPOINT", "https://api.deepseek.com"),
            Provider::Azure => must_env("LLM_ENDPOINT")?,
        };
        let llm_model = must_env("LLM_MODEL")?;
        let llm_api_key = env_opt("LLM_API_KEY");

        let fallback = env_opt("LLM_FALLBACK_MODEL").map(|model| FallbackTarget {
            provider: llm_provider,
            model,
        });

        let llm_retry = RetryConfig {
            base_ms: env_u64("LLM_RETRY_BASE_MS", 500)?,
            cap_ms: env_u64("LLM_RETRY_CAP_MS", 15_000)?,
            max_attempts: env_u64("LLM_RETRY_MAX_ATTEMPTS", 4)? as u32,
        };

        Ok(AppConfig {
            redis_url,
            redis_prefix: env_or("REDIS_PREFIX", "AIReview:"),
            instance_name: env_or("INSTANCE_NAME", &format!("worker-{}", std::process::id())),
            locks,
            llm_provider,
            llm_model,
            llm_endpoint,
            llm_api_key,
            llm_api_version: env_opt("LLM_API_VERSION"),
            llm_configuration_id: env_u64("LLM_CONFIGURATION_ID", 1)? as i64,
            llm_concurrency: env_usize("LLM_CONCURRENCY", 8)?,
            llm_retry,
            fallback,
            chunker: ChunkerConfig {
                target_tokens: env_u64("CHUNKER_TARGET_TOKENS", 3000)? as u32,
            },
            chunk_parallelism: env_usize("REVIEW_CHUNK_PARALLELISM", 4)?,
            job_timeout: Duration::from_secs(env_u64("JOB_TIMEOUT_MINUTES", 30)? * 60),
            queue_capacity: env_usize("QUEUE_CAPACITY", 256)?,
            worker_concurrency: env_usize("WORKER_CONCURRENCY", 4)?,
            usage_buffer: env_usize("USAGE_BUFFER", 1024)?,
        })
    }
}
