//! Append-only token usage accounting rows.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::job::TaskKind;

/// One LLM call's worth of token and cost accounting.
///
/// Totals are computed in [`TokenUsageRecord::new`] rather than supplied by
/// callers, so `total_tokens = prompt + completion` and
/// `total_cost = prompt_cost + completion_cost` hold by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsageRecord {
    pub id: i64,
    pub user_id: i64,
    pub project_id: Option<i64>,
    pub review_request_id: Option<i64>,
    pub llm_configuration_id: i64,
    pub provider: String,
    pub model: String,
    pub operation_type: TaskKind,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub prompt_cost: Decimal,
    pub completion_cost: Decimal,
    pub total_cost: Decimal,
    pub is_successful: bool,
    pub error_message: Option<String>,
    pub response_time_ms: u64,
    pub was_cache_hit: bool,
    pub created_at: DateTime<Utc>,
}

/// Caller-facing construction input; everything derivable is derived.
pub struct UsageDraft {
    pub user_id: i64,
    pub project_id: Option<i64>,
    pub review_request_id: Option<i64>,
    pub llm_configuration_id: i64,
    pub provider: String,
    pub model: String,
    pub operation_type: TaskKind,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub prompt_cost: Decimal,
    pub completion_cost: Decimal,
    pub is_successful: bool,
    pub error_message: Option<String>,
    pub response_time_ms: u64,
    pub was_cache_hit: bool,
}

impl TokenUsageRecord {
    pub fn new(draft: UsageDraft) -> Self {
        TokenUsageRecord {
            id: 0,
            user_id: draft.user_id,
            project_id: draft.project_id,
            review_request_id: draft.review_request_id,
            llm_configuration_id: draft.llm_configuration_id,
            provider: draft.provider,
            model: draft.model,
            operation_type: draft.operation_type,
            prompt_tokens: draft.prompt_tokens,
            completion_tokens: draft.completion_tokens,
            total_tokens: draft.prompt_tokens + draft.completion_tokens,
            prompt_cost: draft.prompt_cost,
            completion_cost: draft.completion_cost,
            total_cost: draft.prompt_cost + draft.completion_cost,
            is_successful: draft.is_successful,
            error_message: draft.error_message,
            response_time_ms: draft.response_time_ms,
            was_cache_hit: draft.was_cache_hit,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn draft() -> UsageDraft {
        UsageDraft {
            user_id: 1,
            project_id: Some(2),
            review_request_id: Some(42),
            llm_configuration_id: 7,
            provider: "OpenAI".into(),
            model: "gpt-4o-mini".into(),
            operation_type: TaskKind::Review,
            prompt_tokens: 1200,
            completion_tokens: 300,
            prompt_cost: dec!(0.000180),
            completion_cost: dec!(0.000180),
            is_successful: true,
            error_message: None,
            response_time_ms: 950,
            was_cache_hit: false,
        }
    }

    #[test]
    fn totals_are_derived() {
        let rec = TokenUsageRecord::new(draft());
        assert_eq!(rec.total_tokens, 1500);
        assert_eq!(rec.total_cost, dec!(0.000360));
        assert_eq!(rec.total_cost, rec.prompt_cost + rec.completion_cost);
    }
}
