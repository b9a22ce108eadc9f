//! Model pricing table.
//!
//! Prices are in USD per 1M tokens (input/output). Used for spend recording,
//! budget estimates and the cache's saved-cost accounting.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use tracing::warn;

/// Pricing for a specific model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model: String,
    pub input_cost_per_million: f64,
    pub output_cost_per_million: f64,
}

/// Static pricing table keyed by model name.
#[derive(Debug, Clone)]
pub struct PricingTable {
    pricing: HashMap<String, ModelPricing>,
}

impl PricingTable {
    pub fn new() -> Self {
        let mut pricing = HashMap::new();
        let mut add = |model: &str, input: f64, output: f64| {
            pricing.insert(
                model.to_string(),
                ModelPricing {
                    model: model.to_string(),
                    input_cost_per_million: input,
                    output_cost_per_million: output,
                },
            );
        };

        // Anthropic
        add("claude-opus-4-6", 15.00, 75.00);
        add("claude-opus-4-1", 15.00, 75.00);
        add("claude-sonnet-4-6", 3.00, 15.00);
        add("claude-sonnet-4-5", 3.00, 15.00);
        add("claude-haiku-4-5", 1.00, 5.00);

        // OpenAI
        add("gpt-5.2", 1.25, 10.00);
        add("gpt-5-mini", 0.25, 2.00);
        add("gpt-4o", 2.50, 10.00);
        add("gpt-4o-mini", 0.15, 0.60);
        add("o3", 2.00, 8.00);
        add("o3-mini", 1.10, 4.40);

        // Google
        add("gemini-2.5-pro", 1.25, 10.00);
        add("gemini-2.5-flash", 0.15, 0.60);

        // Others
        add("grok-4", 3.00, 15.00);
        add("deepseek-v3", 0.27, 1.10);
        add("llama-3.3-70b", 0.35, 0.40);
        add("kimi-k2", 0.55, 2.20);

        Self { pricing }
    }

    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.pricing.get(model)
    }

    pub fn has_pricing(&self, model: &str) -> bool {
        self.pricing.contains_key(model)
    }

    /// Cost in USD for a request. Unknown models price at zero with one
    /// warning so accounting never fails a request.
    pub fn cost(&self, model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
        match self.pricing.get(model) {
            Some(p) => {
                (tokens_in as f64 / 1_000_000.0) * p.input_cost_per_million
                    + (tokens_out as f64 / 1_000_000.0) * p.output_cost_per_million
            }
            None => {
                warn!(model = %model, "No pricing data, recording zero cost");
                0.0
            }
        }
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_sonnet() {
        let table = PricingTable::new();
        // (1000/1M * $3) + (500/1M * $15) = $0.0105
        let cost = table.cost("claude-sonnet-4-6", 1000, 500);
        assert!((cost - 0.0105).abs() < 1e-9);
    }

    #[test]
    fn test_cost_unknown_model_is_zero() {
        let table = PricingTable::new();
        assert_eq!(table.cost("mystery-model", 1000, 500), 0.0);
    }

    #[test]
    fn test_zero_tokens_zero_cost() {
        let table = PricingTable::new();
        assert_eq!(table.cost("claude-opus-4-6", 0, 0), 0.0);
    }

    #[test]
    fn test_opus_more_expensive_than_haiku() {
        let table = PricingTable::new();
        assert!(
            table.cost("claude-opus-4-6", 1000, 1000)
                > table.cost("claude-haiku-4-5", 1000, 1000)
        );
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_cost_is_nonnegative_and_finite(
            tokens_in in 0u64..2_000_000,
            tokens_out in 0u64..2_000_000,
        ) {
            let table = PricingTable::new();
            let cost = table.cost("claude-sonnet-4-6", tokens_in, tokens_out);
            prop_assert!(cost >= 0.0);
            prop_assert!(cost.is_finite());
        }

        #[test]
        fn prop_cost_monotonic_in_tokens(
            tokens_in in 0u64..1_000_000,
            tokens_out in 0u64..1_000_000,
            extra in 1u64..1_000_000,
        ) {
            let table = PricingTable::new();
            let base = table.cost("claude-sonnet-4-6", tokens_in, tokens_out);
            let more = table.cost("claude-sonnet-4-6", tokens_in + extra, tokens_out);
            prop_assert!(more > base);
        }
    }
}
