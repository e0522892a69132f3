//! Process-wide provider spend accumulation with budget thresholds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Spend bucket for one `(provider, operation_type)` pair.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SpendBucket {
    pub total_cost: f64,
    pub total_tokens: u64,
    pub request_count: u64,
}

/// Point-in-time spend summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendSummary {
    pub total_cost: f64,
    pub total_tokens: u64,
    pub request_count: u64,
    pub by_bucket: BTreeMap<String, SpendBucket>,
    pub budget: Option<f64>,
    pub budget_used_ratio: Option<f64>,
}

type ThresholdCallback = Box<dyn Fn(f64, f64) + Send + Sync>;

struct CostState {
    buckets: BTreeMap<String, SpendBucket>,
    total_cost: f64,
    total_tokens: u64,
    request_count: u64,
    crossed: Vec<f64>,
}

/// Accumulates provider spend; projects against a budget and fires a
/// callback when configured thresholds are crossed.
pub struct CostTracker {
    state: Mutex<CostState>,
    budget: Option<f64>,
    /// Ratios of the budget (e.g. 0.5, 0.8, 1.0) that trigger the callback
    thresholds: Vec<f64>,
    on_threshold: Option<ThresholdCallback>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CostState {
                buckets: BTreeMap::new(),
                total_cost: 0.0,
                total_tokens: 0,
                request_count: 0,
                crossed: Vec::new(),
            }),
            budget: None,
            thresholds: vec![0.5, 0.8, 1.0],
            on_threshold: None,
        }
    }

    /// Set the budget for the current window, in USD.
    pub fn with_budget(mut self, budget: f64) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_thresholds(mut self, thresholds: Vec<f64>) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Callback invoked with `(spent, budget)` when a threshold is crossed.
    pub fn on_threshold(mut self, callback: impl Fn(f64, f64) + Send + Sync + 'static) -> Self {
        self.on_threshold = Some(Box::new(callback));
        self
    }

    /// Record spend for one operation.
    pub fn record(
        &self,
        provider: &str,
        operation_type: &str,
        cost: f64,
        tokens: u64,
    ) -> Result<()> {
        let key = format!("{provider}/{operation_type}");
        let mut state = self.lock()?;

        let bucket = state.buckets.entry(key.clone()).or_default();
        bucket.total_cost += cost;
        bucket.total_tokens += tokens;
        bucket.request_count += 1;

        state.total_cost += cost;
        state.total_tokens += tokens;
        state.request_count += 1;

        debug!(bucket = %key, cost, tokens, total = state.total_cost, "spend recorded");

        if let Some(budget) = self.budget {
            let spent = state.total_cost;
            for &threshold in &self.thresholds {
                let mark = budget * threshold;
                if spent >= mark && !state.crossed.contains(&threshold) {
                    state.crossed.push(threshold);
                    warn!(spent, budget, threshold, "cost threshold crossed");
                    if let Some(callback) = &self.on_threshold {
                        callback(spent, budget);
                    }
                }
            }
        }

        Ok(())
    }

    /// Whether the budget (if any) has been exhausted.
    pub fn budget_exhausted(&self) -> bool {
        match (self.budget, self.lock()) {
            (Some(budget), Ok(state)) => state.total_cost >= budget,
            _ => false,
        }
    }

    /// Linear projection of spend at the end of the window given the
    /// fraction of the window already elapsed.
    pub fn projected_total(&self, window_elapsed_ratio: f64) -> Result<f64> {
        let state = self.lock()?;
        if window_elapsed_ratio <= 0.0 {
            return Ok(state.total_cost);
        }
        Ok(state.total_cost / window_elapsed_ratio.min(1.0))
    }

    pub fn summary(&self) -> Result<SpendSummary> {
        let state = self.lock()?;
        Ok(SpendSummary {
            total_cost: state.total_cost,
            total_tokens: state.total_tokens,
            request_count: state.request_count,
            by_bucket: state.buckets.clone(),
            budget: self.budget,
            budget_used_ratio: self.budget.map(|b| {
                if b > 0.0 {
                    state.total_cost / b
                } else {
                    0.0
                }
            }),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CostState>> {
        self.state
            .lock()
            .map_err(|e| Error::Internal(format!("cost tracker lock poisoned: {e}")))
    }
}

impl Default for CostTracker {
    fn default() -> Self {
        Self::new()
    }
}
