//! Request/response contract for the multi-provider reasoning runner.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fan-out strategy executed inside the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Each provider independently answers the same prompt.
    All,
    /// Thesis, antithesis, synthesis performed inside the runner; the
    /// synthesis may arrive in the `summary` field.
    Dialectical,
    /// Whichever provider responds first wins.
    First,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::All => "all",
            Self::Dialectical => "dialectical",
            Self::First => "first",
        };
        write!(f, "{}", s)
    }
}

/// Structured document the runner prints on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RunnerDocument {
    #[serde(default)]
    pub responses: BTreeMap<String, String>,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Result of one runner invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerResponse {
    /// Per-provider response text, keyed by provider id.
    pub responses: BTreeMap<String, String>,
    pub strategy: Strategy,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub success: bool,
    pub error: Option<String>,
    /// Synthesis summary, present for some dialectical runs.
    pub summary: Option<String>,
}

impl RunnerResponse {
    /// Provider ids that answered, in stable order.
    pub fn provider_ids(&self) -> Vec<&str> {
        self.responses.keys().map(String::as_str).collect()
    }

    /// The synthesis summary if present, otherwise the first provider's
    /// response, otherwise empty.
    pub fn combined_text(&self) -> &str {
        if let Some(summary) = &self.summary {
            return summary;
        }
        self.responses
            .values()
            .next()
            .map(String::as_str)
            .unwrap_or("")
    }

    pub(crate) fn failed(strategy: Strategy, error: impl Into<String>) -> Self {
        Self {
            responses: BTreeMap::new(),
            strategy,
            total_tokens: 0,
            total_cost: 0.0,
            success: false,
            error: Some(error.into()),
            summary: None,
        }
    }
}

/// Running spend counters across runner invocations.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunnerStats {
    pub invocations: u64,
    pub failures: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
}

impl RunnerStats {
    pub fn record(&mut self, response: &RunnerResponse) {
        self.invocations += 1;
        if !response.success {
            self.failures += 1;
        }
        self.total_tokens += response.total_tokens;
        self.total_cost += response.total_cost;
    }
}
