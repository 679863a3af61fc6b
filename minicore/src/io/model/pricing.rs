//! Built-in pricing table for common models.
//!
//! Prices are in USD per 1 million tokens. A config-level override replaces
//! the table for the configured model.

use std::collections::HashMap;

use crate::io::config::{CostTracking, ModelConfig};
use crate::io::model::ModelError;

/// Per-million-token pricing for a model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_m: f64,
    pub output_per_m: f64,
}

impl ModelPricing {
    pub fn new(input_per_m: f64, output_per_m: f64) -> Self {
        Self {
            input_per_m,
            output_per_m,
        }
    }

    /// Cost of one call with the given token counts.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_m + output_tokens as f64 * self.output_per_m)
            / 1_000_000.0
    }
}

/// Model name to pricing, keyed by bare model name (no provider prefix).
#[derive(Debug, Clone)]
pub struct PricingTable {
    prices: HashMap<&'static str, ModelPricing>,
}

impl PricingTable {
    pub fn with_defaults() -> Self {
        let prices = HashMap::from([
            // OpenAI
            ("gpt-4o", ModelPricing::new(2.5, 10.0)),
            ("gpt-4o-mini", ModelPricing::new(0.15, 0.6)),
            ("gpt-4.1", ModelPricing::new(2.0, 8.0)),
            ("gpt-4.1-mini", ModelPricing::new(0.4, 1.6)),
            ("gpt-4.1-nano", ModelPricing::new(0.1, 0.4)),
            ("gpt-4-turbo", ModelPricing::new(10.0, 30.0)),
            ("o1", ModelPricing::new(15.0, 60.0)),
            ("o1-mini", ModelPricing::new(3.0, 12.0)),
            ("o3-mini", ModelPricing::new(1.1, 4.4)),
            // Anthropic
            ("claude-sonnet-4", ModelPricing::new(3.0, 15.0)),
            ("claude-opus-4", ModelPricing::new(15.0, 75.0)),
            ("claude-3-5-sonnet", ModelPricing::new(3.0, 15.0)),
            ("claude-3-5-haiku", ModelPricing::new(0.8, 4.0)),
            ("claude-3-haiku", ModelPricing::new(0.25, 1.25)),
            // Google
            ("gemini-2.0-flash", ModelPricing::new(0.1, 0.4)),
            ("gemini-1.5-pro", ModelPricing::new(1.25, 5.0)),
            ("gemini-1.5-flash", ModelPricing::new(0.075, 0.3)),
            // Others
            ("mistral-large", ModelPricing::new(2.0, 6.0)),
            ("codestral", ModelPricing::new(0.3, 0.9)),
            ("deepseek-chat", ModelPricing::new(0.27, 1.1)),
            ("deepseek-reasoner", ModelPricing::new(0.55, 2.19)),
        ]);
        Self { prices }
    }

    /// Look up pricing for `model`.
    ///
    /// Strips any `provider/` prefix, then tries an exact match, then the
    /// longest table key that prefixes the name (`gpt-4o-mini-2024-07-18`
    /// matches `gpt-4o-mini`).
    pub fn lookup(&self, model: &str) -> Option<ModelPricing> {
        let bare = model.rsplit('/').next().unwrap_or(model).to_lowercase();
        if let Some(pricing) = self.prices.get(bare.as_str()) {
            return Some(*pricing);
        }
        self.prices
            .iter()
            .filter(|(key, _)| bare.starts_with(*key))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, pricing)| *pricing)
    }
}

/// Prices calls for one configured model.
#[derive(Debug, Clone)]
pub struct CostCalculator {
    model: String,
    pricing: Option<ModelPricing>,
    tracking: CostTracking,
}

impl CostCalculator {
    pub fn new(config: &ModelConfig) -> Self {
        let pricing = match config.pricing {
            Some(p) => Some(ModelPricing::new(p.input_per_m, p.output_per_m)),
            None => PricingTable::with_defaults().lookup(&config.model_name),
        };
        Self {
            model: config.model_name.clone(),
            pricing,
            tracking: config.cost_tracking,
        }
    }

    /// Price one call. `reported` is a cost the backend already knows, if any.
    ///
    /// With default cost tracking, a call that cannot be priced (unknown model,
    /// non-positive cost) is an error; with `ignore_errors` it costs zero.
    pub fn price(
        &self,
        input_tokens: u64,
        output_tokens: u64,
        reported: Option<f64>,
    ) -> Result<f64, ModelError> {
        let cost = match (reported, self.pricing) {
            (Some(cost), _) => Some(cost),
            (None, Some(pricing)) => Some(pricing.cost(input_tokens, output_tokens)),
            (None, None) => None,
        };
        match cost {
            Some(cost) if cost.is_finite() && cost > 0.0 => Ok(cost),
            _ if self.tracking == CostTracking::IgnoreErrors => Ok(0.0),
            Some(cost) => Err(ModelError::Cost(format!(
                "cost for model {} must be > 0, got {cost}; set model.cost_tracking = \"ignore_errors\" or MINI_COST_TRACKING=ignore_errors to ignore",
                self.model
            ))),
            None => Err(ModelError::Cost(format!(
                "no pricing known for model {}; set model.pricing, or model.cost_tracking = \"ignore_errors\" or MINI_COST_TRACKING=ignore_errors to ignore",
                self.model
            ))),
        }
    }
}
