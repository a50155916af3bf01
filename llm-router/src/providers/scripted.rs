//! Scripted adapter: canned replies, no network.
//!
//! Drives the router and orchestrators in tests and dry runs. Replies are
//! consumed in FIFO order; an exhausted script is an explicit error so a
//! test that under-provisions replies fails loudly.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::accounting::estimate_tokens;
use crate::error::ProviderError;
use crate::request::{CompletionRequest, CompletionResponse, FinishReason};

enum Reply {
    Text {
        text: String,
        finish_reason: FinishReason,
        delay: Option<std::time::Duration>,
    },
    Error(ProviderError),
}

#[derive(Default)]
pub struct ScriptedAdapter {
    replies: Mutex<VecDeque<Reply>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful completion.
    pub fn push_ok(&self, text: impl Into<String>) {
        self.replies.lock().unwrap().push_back(Reply::Text {
            text: text.into(),
            finish_reason: FinishReason::Stop,
            delay: None,
        });
    }

    /// Queue a successful completion that takes `delay` to arrive.
    pub fn push_ok_delayed(&self, text: impl Into<String>, delay: std::time::Duration) {
        self.replies.lock().unwrap().push_back(Reply::Text {
            text: text.into(),
            finish_reason: FinishReason::Stop,
            delay: Some(delay),
        });
    }

    /// Queue a completion with an explicit finish reason.
    pub fn push_with_finish(&self, text: impl Into<String>, finish_reason: FinishReason) {
        self.replies.lock().unwrap().push_back(Reply::Text {
            text: text.into(),
            finish_reason,
            delay: None,
        });
    }

    /// Queue a provider failure.
    pub fn push_err(&self, err: ProviderError) {
        self.replies.lock().unwrap().push_back(Reply::Error(err));
    }

    /// Every user-message prompt this adapter has seen, in call order.
    pub fn seen_prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }

    pub async fn complete(
        &self,
        req: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        self.prompts.lock().unwrap().push(req.prompt_text());
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Text {
                text,
                finish_reason,
                delay,
            }) => {
                if let Some(d) = delay {
                    tokio::time::sleep(d).await;
                }
                Ok(CompletionResponse {
                    provider: req.provider,
                    model: req.model.clone(),
                    prompt_tokens: estimate_tokens(&req.prompt_text()),
                    completion_tokens: estimate_tokens(&text),
                    text,
                    finish_reason,
                    latency_ms: 1,
                })
            }
            Some(Reply::Error(err)) => Err(err),
            None => Err(ProviderError::ScriptExhausted),
        }
    }
}
