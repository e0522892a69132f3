//! Metrics and analytics: read-only projections over the ledger.

pub mod collector;
pub mod insights;

pub use collector::{
    AnalyticsCollector, CostAnalysis, ErrorSummary, IssueStats, PrStats, ProviderModelCost,
};
pub use insights::{ConcernPattern, InsightsGenerator, OperationsSummary};
