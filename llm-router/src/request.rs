//! Provider-agnostic request/response shapes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configured LLM providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "OpenAI")]
    OpenAi,
    Azure,
    DeepSeek,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::OpenAi => "OpenAI",
            Provider::Azure => "Azure",
            Provider::DeepSeek => "DeepSeek",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// One completion request. `system` is prepended to `messages` by the
/// adapters; `timeout` overrides the adapter's default per-call timeout.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub provider: Provider,
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stop_sequences: Vec<String>,
    pub timeout: Option<Duration>,
}

impl CompletionRequest {
    /// Concatenated prompt text, used for token estimation when the
    /// provider does not report usage.
    pub fn prompt_text(&self) -> String {
        let mut out = String::new();
        if let Some(sys) = &self.system {
            out.push_str(sys);
            out.push('\n');
        }
        for m in &self.messages {
            out.push_str(&m.content);
            out.push('\n');
        }
        out
    }
}

/// Why the model stopped generating, normalized across providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    Stop,
    Length,
    Filter,
    Error,
}

impl FinishReason {
    /// Map a provider's `finish_reason` string.
    pub fn from_wire(s: Option<&str>) -> FinishReason {
        match s {
            Some("stop") | Some("stop_sequence") | None => FinishReason::Stop,
            Some("length") | Some("max_tokens") => FinishReason::Length,
            Some("content_filter") => FinishReason::Filter,
            Some(_) => FinishReason::Error,
        }
    }
}

/// Normalized completion result. `provider`/`model` echo what actually
/// served the call (they differ from the request after a fallback hop).
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub provider: Provider,
    pub model: String,
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub finish_reason: FinishReason,
    pub latency_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_mapping_is_tolerant() {
        assert_eq!(FinishReason::from_wire(Some("stop")), FinishReason::Stop);
        assert_eq!(FinishReason::from_wire(None), FinishReason::Stop);
        assert_eq!(FinishReason::from_wire(Some("length")), FinishReason::Length);
        assert_eq!(
            FinishReason::from_wire(Some("content_filter")),
            FinishReason::Filter
        );
        assert_eq!(
            FinishReason::from_wire(Some("tool_calls")),
            FinishReason::Error
        );
    }
}
