//! Error taxonomy for LLM dispatch.
//!
//! Adapter-level failures are provider-aware (`401 → Unauthorized`,
//! `429 → RateLimited`, `5xx → Server`); the router folds them into either
//! "unavailable after retries / circuit open" or "rejected, do not retry".

use thiserror::Error;

use crate::request::Provider;

/// Failure of a single provider call.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP 400 — malformed request, fatal for this request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// HTTP 401.
    #[error("unauthorized")]
    Unauthorized,

    /// HTTP 403.
    #[error("forbidden")]
    Forbidden,

    /// HTTP 408.
    #[error("request timeout (http 408)")]
    RequestTimeout,

    /// HTTP 429.
    #[error("rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    /// HTTP 5xx.
    #[error("server error: status {0}")]
    Server(u16),

    /// Any other HTTP status.
    #[error("http status error: {0}")]
    HttpStatus(u16),

    /// Transport-level timeout.
    #[error("timeout")]
    Timeout,

    /// DNS/connect/reset without a status.
    #[error("network error: {0}")]
    Network(String),

    /// Response body did not match the expected shape.
    #[error("decode error: {0}")]
    Decode(String),

    /// 2xx response with no usable choice.
    #[error("empty choices in response")]
    EmptyChoices,

    /// Adapter construction problems.
    #[error("missing api key")]
    MissingApiKey,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Scripted adapter ran out of queued replies.
    #[error("no scripted reply available")]
    ScriptExhausted,
}

impl ProviderError {
    /// Whether the router should retry this failure. Per policy: network
    /// errors, 408/429/5xx and transport timeouts retry; 400/401/403 and
    /// decode problems do not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RequestTimeout
                | ProviderError::RateLimited { .. }
                | ProviderError::Server(_)
                | ProviderError::Timeout
                | ProviderError::Network(_)
        )
    }

    /// Map a status code that was not 2xx.
    pub fn from_status(code: u16, snippet: String) -> ProviderError {
        match code {
            400 => ProviderError::BadRequest(snippet),
            401 => ProviderError::Unauthorized,
            403 => ProviderError::Forbidden,
            408 => ProviderError::RequestTimeout,
            429 => ProviderError::RateLimited {
                retry_after_secs: None,
            },
            500..=599 => ProviderError::Server(code),
            _ => ProviderError::HttpStatus(code),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return ProviderError::Timeout;
        }
        if let Some(status) = e.status() {
            return ProviderError::from_status(status.as_u16(), String::new());
        }
        ProviderError::Network(e.to_string())
    }
}

/// Failure of a routed call, after retries and breaker logic.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no adapter registered for provider {0}")]
    UnknownProvider(Provider),

    /// Circuit open, or a retryable failure survived every attempt. The
    /// caller may hop to the configured fallback model.
    #[error("provider {provider} unavailable: {reason}")]
    ProviderUnavailable { provider: Provider, reason: String },

    /// Fatal for this request (bad request, auth); retrying is pointless.
    #[error("request rejected by {provider}: {source}")]
    Rejected {
        provider: Provider,
        source: ProviderError,
    },

    /// Could not obtain an in-flight permit within the acquire timeout.
    #[error("provider {0} concurrency limit saturated")]
    Saturated(Provider),
}

impl RouterError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RouterError::ProviderUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification_follows_policy() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::Server(503).is_retryable());
        assert!(ProviderError::RequestTimeout.is_retryable());
        assert!(
            ProviderError::RateLimited {
                retry_after_secs: Some(1)
            }
            .is_retryable()
        );
        assert!(ProviderError::Network("reset".into()).is_retryable());

        assert!(!ProviderError::BadRequest("bad".into()).is_retryable());
        assert!(!ProviderError::Unauthorized.is_retryable());
        assert!(!ProviderError::Forbidden.is_retryable());
        assert!(!ProviderError::Decode("shape".into()).is_retryable());
    }

    #[test]
    fn status_mapping_matches_the_taxonomy() {
        assert!(matches!(
            ProviderError::from_status(429, String::new()),
            ProviderError::RateLimited { .. }
        ));
        assert!(matches!(
            ProviderError::from_status(502, String::new()),
            ProviderError::Server(502)
        ));
        assert!(matches!(
            ProviderError::from_status(404, String::new()),
            ProviderError::HttpStatus(404)
        ));
    }
}
