//! Provider-agnostic LLM dispatch with pricing and token accounting.
//!
//! Three layers, bottom up:
//! - [`pricing`]: the `(provider, model) → $ per MTok` catalog and pure cost
//!   arithmetic (decimal, exact).
//! - [`accounting`]: token estimation and the background usage recorder —
//!   recording is best-effort and never blocks or fails a review.
//! - [`router`]: the `complete(request)` entry point. Per-provider adapters
//!   (OpenAI-compatible, Azure, DeepSeek, plus a scripted one for tests and
//!   dry runs), bounded in-flight concurrency, retry with full-jitter
//!   backoff, a rolling-window circuit breaker, and an optional fallback
//!   model.
//!
//! Dispatch is enum-based; no trait objects on the hot path.

pub mod accounting;
pub mod breaker;
pub mod error;
pub mod pricing;
pub mod providers;
pub mod request;
pub mod retry;
pub mod router;

pub use accounting::{CallOutcome, UsageContext, UsageRecorder, build_usage_record, estimate_tokens};
pub use breaker::{BreakerConfig, CircuitBreaker};
pub use error::{ProviderError, RouterError};
pub use pricing::{CostBreakdown, ModelPricing, PricingCatalog, PricingError};
pub use providers::{
    AdapterConfig, AzureAdapter, DeepSeekAdapter, OpenAiAdapter, ProviderAdapter, ScriptedAdapter,
};
pub use request::{ChatMessage, CompletionRequest, CompletionResponse, FinishReason, Provider, Role};
pub use retry::RetryConfig;
pub use router::{FallbackTarget, LlmRouter, RouterConfig};
