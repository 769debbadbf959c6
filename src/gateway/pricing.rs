//! Per-model-family token pricing.
//!
//! Prices are dollars per one million tokens. Costs are returned as `f64`
//! dollars since they are informational and only compared against a
//! per-trial budget.

use serde::{Deserialize, Serialize};

use crate::gateway::usage::UsageRecord;

const TOKENS_PER_MILLION: f64 = 1_000_000.0;

/// Dollar prices per one million tokens for one model family.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Plain input tokens.
    pub input: f64,
    /// Output tokens.
    pub output: f64,
    /// Tokens written to the prompt cache.
    pub cache_write: f64,
    /// Tokens read from the prompt cache.
    pub cache_read: f64,
}

impl ModelPricing {
    const fn new(input: f64, output: f64, cache_write: f64, cache_read: f64) -> Self {
        Self {
            input,
            output,
            cache_write,
            cache_read,
        }
    }

    /// Dollar cost of one usage record at these prices.
    pub fn cost(&self, record: &UsageRecord) -> f64 {
        (record.input_tokens as f64 * self.input
            + record.output_tokens as f64 * self.output
            + record.cache_creation_input_tokens as f64 * self.cache_write
            + record.cache_read_input_tokens as f64 * self.cache_read)
            / TOKENS_PER_MILLION
    }
}

/// Opus-class pricing; also the fallback for unrecognized models.
pub const OPUS: ModelPricing = ModelPricing::new(15.0, 75.0, 18.75, 1.50);
/// Sonnet-class pricing.
pub const SONNET: ModelPricing = ModelPricing::new(3.0, 15.0, 3.75, 0.30);
/// Haiku-class pricing.
pub const HAIKU: ModelPricing = ModelPricing::new(0.80, 4.0, 1.0, 0.08);
/// GPT-4o pricing.
pub const GPT_4O: ModelPricing = ModelPricing::new(2.50, 10.0, 2.50, 1.25);
/// GPT-4o-mini pricing.
pub const GPT_4O_MINI: ModelPricing = ModelPricing::new(0.15, 0.60, 0.15, 0.075);

/// Family lookup by substring; first match wins, so more specific names
/// come first.
const FAMILIES: &[(&str, ModelPricing)] = &[
    ("opus", OPUS),
    ("sonnet", SONNET),
    ("haiku", HAIKU),
    ("gpt-4o-mini", GPT_4O_MINI),
    ("gpt-4o", GPT_4O),
];

/// Returns pricing for a model name. Unknown models get [`OPUS`] prices so
/// costs are overestimated rather than missed.
pub fn pricing_for(model: &str) -> ModelPricing {
    let model = model.to_lowercase();
    FAMILIES
        .iter()
        .find(|(family, _)| model.contains(family))
        .map(|(_, pricing)| *pricing)
        .unwrap_or(OPUS)
}

/// Sums the priced cost of all records.
pub fn estimate_cost(records: &[UsageRecord]) -> f64 {
    records
        .iter()
        .map(|r| pricing_for(&r.model).cost(r))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(model: &str, input: u64, output: u64) -> UsageRecord {
        UsageRecord {
            provider: "anthropic".to_string(),
            model: model.to_string(),
            input_tokens: input,
            output_tokens: output,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
        }
    }

    #[test]
    fn test_family_lookup() {
        assert_eq!(pricing_for("claude-3-5-sonnet-20241022"), SONNET);
        assert_eq!(pricing_for("claude-3-haiku"), HAIKU);
        assert_eq!(pricing_for("Claude-Opus-4"), OPUS);
        assert_eq!(pricing_for("gpt-4o-mini-2024-07-18"), GPT_4O_MINI);
        assert_eq!(pricing_for("gpt-4o"), GPT_4O);
    }

    #[test]
    fn test_unknown_model_uses_fallback() {
        assert_eq!(pricing_for("some-new-model"), OPUS);
    }

    #[test]
    fn test_cost_per_million() {
        let cost = SONNET.cost(&record("sonnet", 1_000_000, 1_000_000));
        assert!((cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_cache_tokens_priced() {
        let mut r = record("claude-sonnet", 0, 0);
        r.cache_creation_input_tokens = 1_000_000;
        r.cache_read_input_tokens = 1_000_000;
        let cost = pricing_for(&r.model).cost(&r);
        assert!((cost - 4.05).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_cost_sums_records() {
        let records = vec![
            record("claude-haiku", 500_000, 0),
            record("gpt-4o", 0, 100_000),
        ];
        // 0.5 * 0.80 + 0.1 * 10.0
        assert!((estimate_cost(&records) - 1.4).abs() < 1e-9);
        assert_eq!(estimate_cost(&[]), 0.0);
    }
}
