//! Azure OpenAI adapter: deployment-name URLs and `api-key` header auth.

use std::time::Duration;

use reqwest::header;
use tracing::info;

use crate::error::ProviderError;
use crate::request::{CompletionRequest, CompletionResponse, Provider};

use super::AdapterConfig;
use super::wire::{ChatCompletionBody, execute};

const DEFAULT_API_VERSION: &str = "2024-06-01";

/// Client for
/// `POST {endpoint}/openai/deployments/{model}/chat/completions?api-version=…`.
/// The request's `model` doubles as the deployment name.
#[derive(Debug)]
pub struct AzureAdapter {
    client: reqwest::Client,
    base: String,
    api_version: String,
}

impl AzureAdapter {
    pub fn new(cfg: AdapterConfig) -> Result<Self, ProviderError> {
        let base = cfg.validated_endpoint()?;
        let api_key = cfg.required_key()?;
        let api_version = cfg
            .api_version
            .clone()
            .unwrap_or_else(|| DEFAULT_API_VERSION.to_string());

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::HeaderName::from_static("api-key"),
            header::HeaderValue::from_str(&api_key)
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

        info!(endpoint = %base, %api_version, "Azure adapter initialized");

        Ok(Self {
            client,
            base,
            api_version,
        })
    }

    fn deployment_url(&self, deployment: &str) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.base, deployment, self.api_version
        )
    }

    pub async fn complete(
        &self,
        req: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let url = self.deployment_url(&req.model);
        let body = ChatCompletionBody::from_request(req, &req.model);
        let mut builder = self.client.post(&url).json(&body);
        if let Some(t) = req.timeout {
            builder = builder.timeout(t);
        }
        execute(Provider::Azure, builder, &url, req, &req.model).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_urls_follow_the_azure_shape() {
        let adapter = AzureAdapter::new(AdapterConfig {
            endpoint: "https://acme.openai.azure.com/".into(),
            api_key: Some("key".into()),
            timeout_secs: None,
            api_version: None,
        })
        .unwrap();
        assert_eq!(
            adapter.deployment_url("gpt-4o"),
            "https://acme.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-06-01"
        );
    }

    #[test]
    fn construction_requires_a_key_and_http_endpoint() {
        let err = AzureAdapter::new(AdapterConfig {
            endpoint: "https://acme.openai.azure.com".into(),
            api_key: None,
            timeout_secs: None,
            api_version: None,
        })
        .unwrap_err();
        assert!(matches!(err, ProviderError::MissingApiKey));

        let err = AzureAdapter::new(AdapterConfig {
            endpoint: "acme.openai.azure.com".into(),
            api_key: Some("key".into()),
            timeout_secs: None,
            api_version: None,
        })
        .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidEndpoint(_)));
    }
}
