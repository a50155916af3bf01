//! DeepSeek adapter: OpenAI-compatible path on its own endpoint.

use std::time::Duration;

use reqwest::header;
use tracing::info;

use crate::error::ProviderError;
use crate::request::{CompletionRequest, CompletionResponse, Provider};

use super::AdapterConfig;
use super::wire::{ChatCompletionBody, execute};

pub const DEFAULT_ENDPOINT: &str = "https://api.deepseek.com";

/// Client for `POST {endpoint}/chat/completions` with bearer auth.
#[derive(Debug)]
pub struct DeepSeekAdapter {
    client: reqwest::Client,
    url_chat: String,
}

impl DeepSeekAdapter {
    pub fn new(cfg: AdapterConfig) -> Result<Self, ProviderError> {
        let base = cfg.validated_endpoint()?;
        let api_key = cfg.required_key()?;

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(|e| ProviderError::Decode(format!("invalid api key header: {e}")))?,
        );
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let timeout = Duration::from_secs(cfg.timeout_secs.unwrap_or(120));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let url_chat = format!("{base}/chat/completions");
        info!(endpoint = %base, "DeepSeek adapter initialized");

        Ok(Self { client, url_chat })
    }

    pub async fn complete(
        &self,
        req: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let body = ChatCompletionBody::from_request(req, &req.model);
        let mut builder = self.client.post(&self.url_chat).json(&body);
        if let Some(t) = req.timeout {
            builder = builder.timeout(t);
        }
        execute(Provider::DeepSeek, builder, &self.url_chat, req, &req.model).await
    }
}
