//! Provider adapters (enum dispatch, no trait objects).
//!
//! Each adapter owns a preconfigured `reqwest::Client` and translates the
//! provider-agnostic request into the provider's HTTP protocol, normalizing
//! usage numbers and finish reasons on the way back.

pub mod azure;
pub mod deepseek;
pub mod openai;
pub mod scripted;
mod wire;

use crate::error::ProviderError;
use crate::request::{CompletionRequest, CompletionResponse};

pub use azure::AzureAdapter;
pub use deepseek::DeepSeekAdapter;
pub use openai::OpenAiAdapter;
pub use scripted::ScriptedAdapter;

/// Connection settings for one adapter instance.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Base endpoint, e.g. `https://api.openai.com` or the Azure resource
    /// URL.
    pub endpoint: String,
    pub api_key: Option<String>,
    /// Per-call default timeout; a request-level timeout overrides it.
    pub timeout_secs: Option<u64>,
    /// Azure only: the `api-version` query parameter.
    pub api_version: Option<String>,
}

impl AdapterConfig {
    pub(crate) fn validated_endpoint(&self) -> Result<String, ProviderError> {
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty()
            || !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        {
            return Err(ProviderError::InvalidEndpoint(self.endpoint.clone()));
        }
        Ok(endpoint.trim_end_matches('/').to_string())
    }

    pub(crate) fn required_key(&self) -> Result<String, ProviderError> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ProviderError::MissingApiKey)
    }
}

/// One registered provider implementation. The scripted variant is shared
/// so tests and dry runs can queue replies after registration.
pub enum ProviderAdapter {
    OpenAi(OpenAiAdapter),
    Azure(AzureAdapter),
    DeepSeek(DeepSeekAdapter),
    Scripted(std::sync::Arc<ScriptedAdapter>),
}

impl ProviderAdapter {
    pub async fn complete(
        &self,
        req: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        match self {
            ProviderAdapter::OpenAi(a) => a.complete(req).await,
            ProviderAdapter::Azure(a) => a.complete(req).await,
            ProviderAdapter::DeepSeek(a) => a.complete(req).await,
            ProviderAdapter::Scripted(a) => a.complete(req).await,
        }
    }
}
