//! The routed `complete` entry point: semaphore → breaker → retry loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::error::RouterError;
use crate::providers::ProviderAdapter;
use crate::request::{CompletionRequest, CompletionResponse, FinishReason, Provider};
use crate::retry::{RetryConfig, backoff_delay};

/// Where to hop when the primary provider is unavailable.
#[derive(Debug, Clone)]
pub struct FallbackTarget {
    pub provider: Provider,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// In-flight cap per provider.
    pub per_provider_concurrency: usize,
    /// How long a caller blocks for a permit before `Saturated`.
    pub acquire_timeout: Duration,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub fallback: Option<FallbackTarget>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            per_provider_concurrency: 8,
            acquire_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            fallback: None,
        }
    }
}

struct ProviderEntry {
    adapter: ProviderAdapter,
    permits: Arc<Semaphore>,
    breaker: CircuitBreaker,
}

/// Dispatches completion requests across the registered provider adapters
/// with bounded concurrency, retries, and per-provider circuit breaking.
pub struct LlmRouter {
    cfg: RouterConfig,
    entries: HashMap<Provider, ProviderEntry>,
}

impl LlmRouter {
    pub fn new(cfg: RouterConfig) -> Self {
        LlmRouter {
            cfg,
            entries: HashMap::new(),
        }
    }

    pub fn register(&mut self, provider: Provider, adapter: ProviderAdapter) {
        info!(%provider, "provider adapter registered");
        self.entries.insert(
            provider,
            ProviderEntry {
                adapter,
                permits: Arc::new(Semaphore::new(self.cfg.per_provider_concurrency)),
                breaker: CircuitBreaker::new(self.cfg.breaker.clone()),
            },
        );
    }

    /// Fraction of the busiest provider's permits currently in flight.
    /// The queue consumer pauses intake when this crosses its threshold.
    pub fn saturation(&self) -> f64 {
        let total = self.cfg.per_provider_concurrency.max(1) as f64;
        self.entries
            .values()
            .map(|e| (total - e.permits.available_permits() as f64) / total)
            .fold(0.0, f64::max)
    }

    /// Execute one request with retries. Retryable failures (network,
    /// 408/429/5xx, `finish_reason = Error`) back off with full jitter up
    /// to the attempt budget; anything else is rejected immediately.
    pub async fn complete(
        &self,
        req: &CompletionRequest,
    ) -> Result<CompletionResponse, RouterError> {
        let entry = self
            .entries
            .get(&req.provider)
            .ok_or(RouterError::UnknownProvider(req.provider))?;

        if !entry.breaker.allow() {
            return Err(RouterError::ProviderUnavailable {
                provider: req.provider,
                reason: "circuit open".to_string(),
            });
        }

        let _permit = tokio::time::timeout(
            self.cfg.acquire_timeout,
            Arc::clone(&entry.permits).acquire_owned(),
        )
        .await
        .map_err(|_| RouterError::Saturated(req.provider))?
        .map_err(|_| RouterError::Saturated(req.provider))?;

        let max_attempts = self.cfg.retry.max_attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 1..=max_attempts {
            match entry.adapter.complete(req).await {
                Ok(resp) if resp.finish_reason != FinishReason::Error => {
                    entry.breaker.record(true);
                    return Ok(resp);
                }
                Ok(_) => {
                    entry.breaker.record(false);
                    last_reason = "provider reported an error finish".to_string();
                    debug!(provider = %req.provider, attempt, "error finish reason, retrying");
                }
                Err(e) if e.is_retryable() => {
                    entry.breaker.record(false);
                    last_reason = e.to_string();
                    debug!(provider = %req.provider, attempt, error = %e, "retryable failure");
                }
                Err(e) => {
                    entry.breaker.record(false);
                    return Err(RouterError::Rejected {
                        provider: req.provider,
                        source: e,
                    });
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(backoff_delay(&self.cfg.retry, attempt)).await;
            }
        }

        warn!(
            provider = %req.provider,
            model = %req.model,
            attempts = max_attempts,
            reason = %last_reason,
            "provider unavailable after retries"
        );
        Err(RouterError::ProviderUnavailable {
            provider: req.provider,
            reason: last_reason,
        })
    }

    /// Like [`complete`](Self::complete), but hops to the configured
    /// fallback model when the primary is unavailable. The response echoes
    /// whichever provider/model actually served the call.
    pub async fn complete_with_fallback(
        &self,
        req: &CompletionRequest,
    ) -> Result<CompletionResponse, RouterError> {
        match self.complete(req).await {
            Err(err) if err.is_unavailable() => {
                let Some(fallback) = &self.cfg.fallback else {
                    return Err(err);
                };
                if fallback.provider == req.provider && fallback.model == req.model {
                    return Err(err);
                }
                info!(
                    from_provider = %req.provider,
                    from_model = %req.model,
                    to_provider = %fallback.provider,
                    to_model = %fallback.model,
                    "falling back after provider unavailable"
                );
                let mut fb_req = req.clone();
                fb_req.provider = fallback.provider;
                fb_req.model = fallback.model.clone();
                self.complete(&fb_req).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::providers::ScriptedAdapter;
    use crate::request::ChatMessage;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            base_ms: 1,
            cap_ms: 2,
            max_attempts: 4,
        }
    }

    fn request(provider: Provider) -> CompletionRequest {
        CompletionRequest {
            provider,
            model: "gpt-4o-mini".into(),
            system: Some("reviewer".into()),
            messages: vec![ChatMessage::user("review this diff")],
            max_tokens: Some(512),
            temperature: Some(0.2),
            stop_sequences: Vec::new(),
            timeout: None,
        }
    }

    fn router_with(script: ScriptedAdapter, cfg: RouterConfig) -> LlmRouter {
        let mut router = LlmRouter::new(cfg);
        router.register(Provider::OpenAi, ProviderAdapter::Scripted(Arc::new(script)));
        router
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_success() {
        let script = ScriptedAdapter::new();
        script.push_err(ProviderError::Server(503));
        script.push_err(ProviderError::Timeout);
        script.push_ok(r#"{"ok":true}"#);

        let router = router_with(
            script,
            RouterConfig {
                retry: fast_retry(),
                ..RouterConfig::default()
            },
        );

        let resp = router.complete(&request(Provider::OpenAi)).await.unwrap();
        assert_eq!(resp.text, r#"{"ok":true}"#);
        assert_eq!(resp.finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn fatal_statuses_are_not_retried() {
        let script = ScriptedAdapter::new();
        script.push_err(ProviderError::Unauthorized);
        script.push_ok("never reached");

        let router = router_with(
            script,
            RouterConfig {
                retry: fast_retry(),
                ..RouterConfig::default()
            },
        );

        let err = router
            .complete(&request(Provider::OpenAi))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RouterError::Rejected {
                source: ProviderError::Unauthorized,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn exhausted_retries_become_provider_unavailable() {
        let script = ScriptedAdapter::new();
        for _ in 0..4 {
            script.push_err(ProviderError::Server(503));
        }

        let router = router_with(
            script,
            RouterConfig {
                retry: fast_retry(),
                ..RouterConfig::default()
            },
        );

        let err = router
            .complete(&request(Provider::OpenAi))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn fallback_hops_to_the_secondary_model() {
        let primary = ScriptedAdapter::new();
        for _ in 0..4 {
            primary.push_err(ProviderError::Server(503));
        }
        let secondary = ScriptedAdapter::new();
        secondary.push_ok("fallback answer");

        let mut router = LlmRouter::new(RouterConfig {
            retry: fast_retry(),
            fallback: Some(FallbackTarget {
                provider: Provider::DeepSeek,
                model: "deepseek-chat".into(),
            }),
            ..RouterConfig::default()
        });
        router.register(Provider::OpenAi, ProviderAdapter::Scripted(Arc::new(primary)));
        router.register(Provider::DeepSeek, ProviderAdapter::Scripted(Arc::new(secondary)));

        let resp = router
            .complete_with_fallback(&request(Provider::OpenAi))
            .await
            .unwrap();
        assert_eq!(resp.text, "fallback answer");
        assert_eq!(resp.provider, Provider::DeepSeek);
        assert_eq!(resp.model, "deepseek-chat");
    }

    #[tokio::test]
    async fn saturated_semaphore_times_out() {
        let script = ScriptedAdapter::new();
        script.push_ok_delayed("slow", Duration::from_millis(300));
        script.push_ok("fast");

        let router = Arc::new(router_with(
            script,
            RouterConfig {
                per_provider_concurrency: 1,
                acquire_timeout: Duration::from_millis(50),
                retry: fast_retry(),
                ..RouterConfig::default()
            },
        ));

        let slow = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.complete(&request(Provider::OpenAi)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let err = router
            .complete(&request(Provider::OpenAi))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Saturated(Provider::OpenAi)));
        assert!(slow.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn error_finish_reason_is_retried() {
        let script = ScriptedAdapter::new();
        script.push_with_finish("garbled", FinishReason::Error);
        script.push_ok("clean");

        let router = router_with(
            script,
            RouterConfig {
                retry: fast_retry(),
                ..RouterConfig::default()
            },
        );

        let resp = router.complete(&request(Provider::OpenAi)).await.unwrap();
        assert_eq!(resp.text, "clean");
    }

    #[tokio::test]
    async fn open_breaker_fails_fast() {
        let script = ScriptedAdapter::new();
        for _ in 0..24 {
            script.push_err(ProviderError::Server(503));
        }

        let router = router_with(
            script,
            RouterConfig {
                retry: RetryConfig {
                    base_ms: 1,
                    cap_ms: 1,
                    max_attempts: 4,
                },
                breaker: BreakerConfig {
                    min_samples: 8,
                    open_for: Duration::from_secs(30),
                    ..BreakerConfig::default()
                },
                ..RouterConfig::default()
            },
        );

        // Two exhausted calls record 8 failures and trip the breaker.
        let _ = router.complete(&request(Provider::OpenAi)).await;
        let _ = router.complete(&request(Provider::OpenAi)).await;

        let before = tokio::time::Instant::now();
        let err = router
            .complete(&request(Provider::OpenAi))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert!(
            before.elapsed() < Duration::from_millis(20),
            "open breaker must fail without attempting the provider"
        );
    }
}
