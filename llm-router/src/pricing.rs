//! Per-model pricing catalog and pure cost arithmetic.
//!
//! Costs are decimal and exact: `tokens × $/MTok ÷ 1e6`, no floats. The
//! seed table covers the models the engine ships configured for; a runtime
//! `upsert` override lives for the process lifetime only.

use std::collections::HashMap;
use std::sync::RwLock;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::request::Provider;

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("no pricing for {provider} model {model}")]
    Unknown { provider: Provider, model: String },
}

/// Dollars per million tokens, input and output sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_mtok: Decimal,
    pub output_per_mtok: Decimal,
    pub currency: String,
}

impl ModelPricing {
    fn usd(input_cents_per_mtok: i64, output_cents_per_mtok: i64) -> Self {
        ModelPricing {
            input_per_mtok: Decimal::new(input_cents_per_mtok, 2),
            output_per_mtok: Decimal::new(output_cents_per_mtok, 2),
            currency: "USD".to_string(),
        }
    }
}

/// Cost of one call, split by side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostBreakdown {
    pub prompt_cost: Decimal,
    pub completion_cost: Decimal,
    pub total_cost: Decimal,
}

impl CostBreakdown {
    pub fn zero() -> Self {
        CostBreakdown {
            prompt_cost: Decimal::ZERO,
            completion_cost: Decimal::ZERO,
            total_cost: Decimal::ZERO,
        }
    }
}

/// In-process pricing table. Read-mostly; `upsert` is the only writer and
/// is single-writer by convention.
pub struct PricingCatalog {
    table: RwLock<HashMap<(Provider, String), ModelPricing>>,
}

impl PricingCatalog {
    pub fn empty() -> Self {
        PricingCatalog {
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Seed table for the shipped provider/model combinations.
    pub fn with_defaults() -> Self {
        let catalog = Self::empty();
        {
            let mut t = catalog.table.write().unwrap();
            // Prices in cents per MTok to stay integral at construction.
            t.insert(
                (Provider::OpenAi, "gpt-4o".into()),
                ModelPricing::usd(250, 1000),
            );
            t.insert(
                (Provider::OpenAi, "gpt-4o-mini".into()),
                ModelPricing::usd(15, 60),
            );
            t.insert(
                (Provider::OpenAi, "gpt-4.1".into()),
                ModelPricing::usd(200, 800),
            );
            t.insert(
                (Provider::Azure, "gpt-4o".into()),
                ModelPricing::usd(250, 1000),
            );
            t.insert(
                (Provider::Azure, "gpt-4o-mini".into()),
                ModelPricing::usd(15, 60),
            );
            t.insert(
                (Provider::DeepSeek, "deepseek-chat".into()),
                ModelPricing::usd(27, 110),
            );
            t.insert(
                (Provider::DeepSeek, "deepseek-reasoner".into()),
                ModelPricing::usd(55, 219),
            );
        }
        catalog
    }

    /// Runtime override; lives for the process lifetime.
    pub fn upsert(&self, provider: Provider, model: &str, pricing: ModelPricing) {
        info!(%provider, model, "pricing override installed");
        self.table
            .write()
            .unwrap()
            .insert((provider, model.to_string()), pricing);
    }

    pub fn lookup(&self, provider: Provider, model: &str) -> Option<ModelPricing> {
        self.table
            .read()
            .unwrap()
            .get(&(provider, model.to_string()))
            .cloned()
    }

    /// Pure cost computation. Fails for unknown `(provider, model)`; callers
    /// decide between propagating and recording a zero-cost flagged row.
    pub fn cost(
        &self,
        provider: Provider,
        model: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> Result<CostBreakdown, PricingError> {
        let pricing = self
            .lookup(provider, model)
            .ok_or_else(|| PricingError::Unknown {
                provider,
                model: model.to_string(),
            })?;
        let mtok = Decimal::from(1_000_000u32);
        let prompt_cost = pricing.input_per_mtok * Decimal::from(prompt_tokens) / mtok;
        let completion_cost = pricing.output_per_mtok * Decimal::from(completion_tokens) / mtok;
        Ok(CostBreakdown {
            prompt_cost,
            completion_cost,
            total_cost: prompt_cost + completion_cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn cost_is_exact_decimal_math() {
        let catalog = PricingCatalog::with_defaults();
        let cost = catalog
            .cost(Provider::OpenAi, "gpt-4o-mini", 1_000_000, 500_000)
            .unwrap();
        assert_eq!(cost.prompt_cost, dec!(0.15));
        assert_eq!(cost.completion_cost, dec!(0.30));
        assert_eq!(cost.total_cost, dec!(0.45));
    }

    #[test]
    fn small_calls_keep_sub_cent_precision() {
        let catalog = PricingCatalog::with_defaults();
        let cost = catalog
            .cost(Provider::OpenAi, "gpt-4o-mini", 1200, 300)
            .unwrap();
        assert_eq!(cost.prompt_cost, dec!(0.00018));
        assert_eq!(cost.completion_cost, dec!(0.00018));
        assert_eq!(cost.total_cost, cost.prompt_cost + cost.completion_cost);
    }

    #[test]
    fn unknown_model_is_an_explicit_error() {
        let catalog = PricingCatalog::with_defaults();
        let err = catalog
            .cost(Provider::OpenAi, "gpt-imaginary", 10, 10)
            .unwrap_err();
        assert!(matches!(err, PricingError::Unknown { .. }));
    }

    #[test]
    fn upsert_overrides_for_the_process_lifetime() {
        let catalog = PricingCatalog::with_defaults();
        catalog.upsert(
            Provider::OpenAi,
            "gpt-4o-mini",
            ModelPricing {
                input_per_mtok: dec!(1.00),
                output_per_mtok: dec!(2.00),
                currency: "USD".into(),
            },
        );
        let cost = catalog
            .cost(Provider::OpenAi, "gpt-4o-mini", 1_000_000, 1_000_000)
            .unwrap();
        assert_eq!(cost.total_cost, dec!(3.00));
    }
}
