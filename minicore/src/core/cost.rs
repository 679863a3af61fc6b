//! Token and cost accounting with budget checks.

use serde::{Deserialize, Serialize};

/// Monetary and step ceilings for one run. Zero (or negative) disables a check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub cost_limit: f64,
    pub step_limit: u32,
}

impl Budget {
    pub fn unlimited() -> Self {
        Self {
            cost_limit: 0.0,
            step_limit: 0,
        }
    }
}

/// Cumulative usage. Every field only ever grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostState {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost: f64,
    pub calls: u32,
}

/// Aggregates per-call usage reported by the model backend.
///
/// Pricing lives with the backend; the tracker only sums and compares.
#[derive(Debug, Clone)]
pub struct CostTracker {
    state: CostState,
    budget: Budget,
}

impl CostTracker {
    pub fn new(budget: Budget) -> Self {
        Self {
            state: CostState::default(),
            budget,
        }
    }

    /// Add one call's usage. Returns the cost delta actually applied.
    ///
    /// Negative or non-finite costs are recorded as zero so the running total
    /// never decreases.
    pub fn record(&mut self, input_tokens: u64, output_tokens: u64, cost: f64) -> f64 {
        let delta = if cost.is_finite() && cost > 0.0 {
            cost
        } else {
            0.0
        };
        self.state.input_tokens = self.state.input_tokens.saturating_add(input_tokens);
        self.state.output_tokens = self.state.output_tokens.saturating_add(output_tokens);
        self.state.total_cost += delta;
        self.state.calls = self.state.calls.saturating_add(1);
        delta
    }

    /// True when cumulative cost is strictly above `limit`. Limits `<= 0` are disabled.
    pub fn exceeded(&self, limit: f64) -> bool {
        limit > 0.0 && self.state.total_cost > limit
    }

    /// [`CostTracker::exceeded`] against the configured cost ceiling.
    pub fn cost_limit_exceeded(&self) -> bool {
        self.exceeded(self.budget.cost_limit)
    }

    /// True when `step` has reached the configured step ceiling.
    pub fn step_limit_reached(&self, step: u32) -> bool {
        self.budget.step_limit > 0 && step >= self.budget.step_limit
    }

    pub fn state(&self) -> CostState {
        self.state
    }

    pub fn budget(&self) -> Budget {
        self.budget
    }

    pub fn total_cost(&self) -> f64 {
        self.state.total_cost
    }
}
