//! Patterns of concern and recommendations derived from analytics.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use super::collector::{AnalyticsCollector, CostAnalysis, ErrorSummary, IssueStats, PrStats};
use crate::error::Result;

/// Thresholds for flagging a pattern of concern.
const RECURRING_ERROR_COUNT: i64 = 5;
const LOW_SUCCESS_RATE_PCT: f64 = 70.0;
const HIGH_CI_FAILURES: f64 = 2.0;
const COST_OUTLIER_USD: f64 = 100.0;
const HIGH_COMPLEXITY: f64 = 7.0;
const SLOW_MERGE_SECONDS: f64 = 86_400.0;

/// A flagged pattern of concern with a human-readable recommendation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcernPattern {
    pub pattern: String,
    pub recommendation: String,
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
}

impl ConcernPattern {
    fn new(pattern: impl Into<String>, recommendation: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            recommendation: recommendation.into(),
            details: HashMap::new(),
        }
    }

    fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// One-call roll-up of operational health over a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationsSummary {
    pub period_days: u32,
    pub overall_success_rate: f64,
    pub operation_counts: HashMap<String, i64>,
    pub issue_processing: IssueStats,
    pub pr_management: PrStats,
    pub cost_analysis: CostAnalysis,
    pub common_errors: Vec<ErrorSummary>,
}

/// Emits patterns of concern and optimization recommendations.
pub struct InsightsGenerator<'a> {
    analytics: &'a AnalyticsCollector,
}

impl<'a> InsightsGenerator<'a> {
    pub fn new(analytics: &'a AnalyticsCollector) -> Self {
        Self { analytics }
    }

    /// Comprehensive summary across all analytics projections.
    pub fn summary(&self, days: u32) -> Result<OperationsSummary> {
        let summary = OperationsSummary {
            period_days: days,
            overall_success_rate: self.analytics.success_rate(None, days)?,
            operation_counts: self.analytics.operation_counts(days)?,
            issue_processing: self.analytics.issue_stats(days)?,
            pr_management: self.analytics.pr_stats(days)?,
            cost_analysis: self.analytics.cost_analysis(days)?,
            common_errors: self
                .analytics
                .error_analysis(days)?
                .into_iter()
                .take(5)
                .collect(),
        };
        info!(period_days = days, "insights summary generated");
        Ok(summary)
    }

    /// Flag recurring errors, low success rates, and CI churn.
    pub fn patterns_of_concern(&self, days: u32) -> Result<Vec<ConcernPattern>> {
        let mut patterns = Vec::new();

        let errors = self.analytics.error_analysis(days)?;
        if let Some(top) = errors.first() {
            if top.count > RECURRING_ERROR_COUNT {
                patterns.push(
                    ConcernPattern::new(
                        "recurring_error",
                        format!(
                            "Investigate and fix recurring {} errors",
                            top.error_type
                        ),
                    )
                    .with_detail("error_type", top.error_type.clone())
                    .with_detail("count", top.count),
                );
            }
        }

        let success_rate = self.analytics.success_rate(None, days)?;
        if success_rate < LOW_SUCCESS_RATE_PCT {
            patterns.push(
                ConcernPattern::new(
                    "low_success_rate",
                    "Overall success rate is low. Review recent failures and adjust configuration.",
                )
                .with_detail("success_rate", success_rate),
            );
        }

        let pr_stats = self.analytics.pr_stats(days)?;
        if pr_stats.avg_ci_failures > HIGH_CI_FAILURES {
            patterns.push(
                ConcernPattern::new(
                    "high_ci_failures",
                    "Average CI failures per PR is high. Improve code quality or test coverage.",
                )
                .with_detail("avg_failures", pr_stats.avg_ci_failures),
            );
        }

        Ok(patterns)
    }

    /// Optimization recommendations: cost, complexity, merge latency, success.
    pub fn recommendations(&self, days: u32) -> Result<Vec<String>> {
        let mut recommendations = Vec::new();

        let cost = self.analytics.cost_analysis(days)?;
        if cost.total_cost > COST_OUTLIER_USD {
            recommendations.push(format!(
                "High LLM costs detected (${:.2}). Consider using cheaper models or reducing token usage.",
                cost.total_cost
            ));
        }

        let issues = self.analytics.issue_stats(days)?;
        if issues.avg_complexity > HIGH_COMPLEXITY {
            recommendations.push(format!(
                "Average issue complexity is high ({:.1}). Consider breaking down complex issues or adjusting the complexity ceiling.",
                issues.avg_complexity
            ));
        }

        let prs = self.analytics.pr_stats(days)?;
        if prs.avg_time_to_merge > SLOW_MERGE_SECONDS {
            recommendations.push(format!(
                "Average PR merge time is high ({:.1} hours). Review the approval process or increase automation.",
                prs.avg_time_to_merge / 3600.0
            ));
        }

        let success_rate = self.analytics.success_rate(None, days)?;
        if success_rate < 80.0 {
            recommendations.push(format!(
                "Success rate is below target ({:.1}%). Review error patterns and adjust safety guards.",
                success_rate
            ));
        }

        Ok(recommendations)
    }
}
