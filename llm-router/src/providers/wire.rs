//! Chat-completion wire format shared by the OpenAI-compatible family.

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::accounting::estimate_tokens;
use crate::error::ProviderError;
use crate::request::{CompletionRequest, CompletionResponse, FinishReason, Provider, Role};

/// Request body for `chat/completions` (non-streaming).
#[derive(Debug, Serialize)]
pub(crate) struct ChatCompletionBody<'a> {
    pub model: &'a str,
    pub messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<&'a str>,
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct WireMessage<'a> {
    pub role: &'static str,
    pub content: &'a str,
}

impl<'a> ChatCompletionBody<'a> {
    /// System message first (when present), then the caller's messages.
    pub fn from_request(req: &'a CompletionRequest, model: &'a str) -> Self {
        let mut messages = Vec::with_capacity(req.messages.len() + 1);
        if let Some(sys) = &req.system {
            messages.push(WireMessage {
                role: "system",
                content: sys,
            });
        }
        for m in &req.messages {
            messages.push(WireMessage {
                role: match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                content: &m.content,
            });
        }
        ChatCompletionBody {
            model,
            messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            stop: req.stop_sequences.iter().map(String::as_str).collect(),
            stream: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatCompletionReply {
    #[serde(default)]
    pub choices: Vec<WireChoice>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireChoice {
    pub message: WireMessageOut,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireMessageOut {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

/// Short body excerpt for non-2xx logging; never the full payload.
pub(crate) fn make_snippet(body: &str) -> String {
    const MAX: usize = 240;
    let trimmed = body.trim();
    if trimmed.len() <= MAX {
        trimmed.to_string()
    } else {
        let mut end = MAX;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    }
}

/// Execute one prepared chat-completion POST and normalize the reply.
pub(crate) async fn execute(
    provider: Provider,
    builder: reqwest::RequestBuilder,
    url: &str,
    req: &CompletionRequest,
    model: &str,
) -> Result<CompletionResponse, ProviderError> {
    let started = tokio::time::Instant::now();
    debug!(%provider, model, url, prompt_len = req.prompt_text().len(), "chat completion request");

    let resp = builder.send().await.map_err(ProviderError::from)?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        let snippet = make_snippet(&text);
        error!(
            %provider,
            model,
            status,
            %snippet,
            latency_ms = started.elapsed().as_millis() as u64,
            "chat completion returned non-success status"
        );
        return Err(ProviderError::from_status(status, snippet));
    }

    let reply: ChatCompletionReply = resp
        .json()
        .await
        .map_err(|e| ProviderError::Decode(format!("chat completion body: {e}")))?;

    let latency_ms = started.elapsed().as_millis() as u64;
    let choice = reply
        .choices
        .into_iter()
        .find(|c| c.message.content.is_some())
        .ok_or(ProviderError::EmptyChoices)?;
    let finish_reason = FinishReason::from_wire(choice.finish_reason.as_deref());
    let text = choice.message.content.unwrap_or_default();

    // Authoritative usage when present, estimate otherwise.
    let (prompt_tokens, completion_tokens) = match reply.usage {
        Some(u) => (u.prompt_tokens, u.completion_tokens),
        None => (
            estimate_tokens(&req.prompt_text()),
            estimate_tokens(&text),
        ),
    };

    debug!(
        %provider,
        model,
        latency_ms,
        prompt_tokens,
        completion_tokens,
        ?finish_reason,
        "chat completion ok"
    );

    Ok(CompletionResponse {
        provider,
        model: model.to_string(),
        text,
        prompt_tokens,
        completion_tokens,
        finish_reason,
        latency_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_truncates_on_char_boundaries() {
        let s = make_snippet(&"é".repeat(400));
        assert!(s.ends_with('…'));
        assert!(s.len() <= 244);
    }
}
