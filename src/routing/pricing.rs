//! Per-model pricing.
//!
//! Prices are configured in USD per 1 000 tokens and stored as
//! micro-dollars (1 USD = 1 000 000 micro-dollars) so that cost aggregation
//! never accumulates floating-point drift.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use super::registry::{MODEL_CLASSIFIER, MODEL_DEEPSEEK, MODEL_LLAMA, MODEL_MISTRAL};
use super::types::Usage;

/// Price of one model, USD per 1 000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModelPrice {
    /// Price per 1K prompt tokens.
    pub input_per_1k: f64,
    /// Price per 1K completion tokens.
    pub output_per_1k: f64,
}

/// Default price list for the stock models.
pub fn default_prices() -> HashMap<String, ModelPrice> {
    [
        (MODEL_DEEPSEEK, 0.001_35, 0.005_4),
        (MODEL_LLAMA, 0.000_71, 0.000_71),
        (MODEL_MISTRAL, 0.002, 0.006),
        (MODEL_CLASSIFIER, 0.000_075, 0.000_3),
    ]
    .into_iter()
    .map(|(model, input_per_1k, output_per_1k)| {
        (
            model.to_string(),
            ModelPrice {
                input_per_1k,
                output_per_1k,
            },
        )
    })
    .collect()
}

#[derive(Debug, Clone, Copy)]
struct MicroRate {
    input: u64,
    output: u64,
}

/// Model → price lookup.
///
/// Unknown models cost zero; the request still succeeds.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Clone)]
pub struct PricingTable {
    rates: HashMap<String, MicroRate>,
}

impl PricingTable {
    /// Build from a USD price list. Negative prices are clamped to zero.
    pub fn new(prices: &HashMap<String, ModelPrice>) -> Self {
        let rates = prices
            .iter()
            .map(|(model, p)| {
                (
                    model.clone(),
                    MicroRate {
                        input: usd_to_micro(p.input_per_1k),
                        output: usd_to_micro(p.output_per_1k),
                    },
                )
            })
            .collect();
        Self { rates }
    }

    /// Cost of `usage` on `model`, in micro-dollars.
    pub fn cost_micro(&self, model: &str, usage: &Usage) -> u64 {
        let Some(rate) = self.rates.get(model) else {
            debug!(model, "no price configured; cost recorded as zero");
            return 0;
        };
        let input = u128::from(usage.prompt_tokens) * u128::from(rate.input) / 1000;
        let output = u128::from(usage.completion_tokens) * u128::from(rate.output) / 1000;
        u64::try_from(input + output).unwrap_or(u64::MAX)
    }

    /// Cost of `usage` on `model`, in USD.
    pub fn cost_usd(&self, model: &str, usage: &Usage) -> f64 {
        micro_to_usd(self.cost_micro(model, usage))
    }

    /// `true` if `model` has a configured price.
    pub fn contains(&self, model: &str) -> bool {
        self.rates.contains_key(model)
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::new(&default_prices())
    }
}

/// Convert USD to micro-dollars, clamping negatives to zero.
pub fn usd_to_micro(usd: f64) -> u64 {
    if usd.is_finite() && usd > 0.0 {
        (usd * 1_000_000.0).round() as u64
    } else {
        0
    }
}

/// Convert micro-dollars to USD.
pub fn micro_to_usd(micro: u64) -> f64 {
    micro as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(prompt: u64, completion: u64) -> Usage {
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }

    #[test]
    fn test_cost_uses_input_and_output_rates() {
        let mut prices = HashMap::new();
        prices.insert(
            "m".to_string(),
            ModelPrice {
                input_per_1k: 0.001,
                output_per_1k: 0.002,
            },
        );
        let table = PricingTable::new(&prices);
        // 1000 in @ 1000 µ$/1K + 500 out @ 2000 µ$/1K
        assert_eq!(table.cost_micro("m", &usage(1000, 500)), 2000);
        assert!((table.cost_usd("m", &usage(1000, 500)) - 0.002).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_model_costs_zero() {
        let table = PricingTable::default();
        assert_eq!(table.cost_micro("mystery", &usage(10_000, 10_000)), 0);
    }

    #[test]
    fn test_negative_price_clamped() {
        assert_eq!(usd_to_micro(-1.0), 0);
        assert_eq!(usd_to_micro(f64::NAN), 0);
    }

    #[test]
    fn test_defaults_cover_stock_models() {
        let table = PricingTable::default();
        for model in [MODEL_DEEPSEEK, MODEL_LLAMA, MODEL_MISTRAL, MODEL_CLASSIFIER] {
            assert!(table.contains(model), "{model} missing");
        }
    }
}
