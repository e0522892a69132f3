//! Read-only aggregations over the operations ledger.

use chrono::{Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::ledger::store::format_timestamp;
use crate::ledger::{Ledger, OperationKind};

/// One ranked entry from error analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub error_type: String,
    pub count: i64,
    pub operation_type: String,
    pub example_message: Option<String>,
}

/// Aggregate statistics for issue processing in a window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueStats {
    pub total_issues: i64,
    pub success_rate: f64,
    pub avg_complexity: f64,
    pub avg_files_changed: f64,
    pub avg_lines_added: f64,
    pub avg_tests_added: f64,
    pub avg_completion_time: f64,
}

/// Aggregate statistics for PR management in a window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrStats {
    pub total_prs: i64,
    pub merge_rate: f64,
    pub ci_pass_rate: f64,
    pub avg_time_to_merge: f64,
    pub avg_ci_failures: f64,
}

/// Spend for one `(provider, model)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderModelCost {
    pub provider: String,
    pub model: String,
    pub total_cost: f64,
    pub total_tokens: i64,
    pub request_count: i64,
}

/// Cost roll-up over a window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostAnalysis {
    pub total_cost: f64,
    pub total_tokens: i64,
    pub by_provider_model: Vec<ProviderModelCost>,
}

/// Computes success rates, error taxonomies, and cost roll-ups from the
/// ledger. Purely a projection; never writes.
pub struct AnalyticsCollector {
    ledger: Arc<Ledger>,
}

impl AnalyticsCollector {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    fn since(days: u32) -> String {
        format_timestamp(Utc::now() - Duration::days(days as i64))
    }

    /// Success rate as a percentage (0.0–100.0) over the window, optionally
    /// filtered by operation kind. Returns 0.0 when there is no data.
    pub fn success_rate(&self, kind: Option<OperationKind>, days: u32) -> Result<f64> {
        let since = Self::since(days);
        let (total, successful): (i64, i64) = self.ledger.with_conn(|conn| {
            match kind {
                Some(kind) => conn.query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0)
                     FROM operations
                     WHERE operation_type = ?1 AND started_at >= ?2",
                    params![kind.to_string(), since],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                ),
                None => conn.query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0)
                     FROM operations
                     WHERE started_at >= ?1",
                    params![since],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                ),
            }
        })?;

        if total == 0 {
            return Ok(0.0);
        }
        Ok(successful as f64 / total as f64 * 100.0)
    }

    /// Average duration in seconds, or None when no completed operations.
    pub fn average_duration(&self, kind: Option<OperationKind>, days: u32) -> Result<Option<f64>> {
        let since = Self::since(days);
        self.ledger.with_conn(|conn| match kind {
            Some(kind) => conn.query_row(
                "SELECT AVG(duration_seconds) FROM operations
                 WHERE operation_type = ?1 AND started_at >= ?2
                   AND duration_seconds IS NOT NULL",
                params![kind.to_string(), since],
                |row| row.get(0),
            ),
            None => conn.query_row(
                "SELECT AVG(duration_seconds) FROM operations
                 WHERE started_at >= ?1 AND duration_seconds IS NOT NULL",
                params![since],
                |row| row.get(0),
            ),
        })
    }

    /// Operation counts per kind within the window.
    pub fn operation_counts(&self, days: u32) -> Result<HashMap<String, i64>> {
        let since = Self::since(days);
        self.ledger.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT operation_type, COUNT(*) FROM operations
                 WHERE started_at >= ?1
                 GROUP BY operation_type
                 ORDER BY COUNT(*) DESC",
            )?;
            let rows = stmt.query_map(params![since], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            rows.collect()
        })
    }

    /// Ranked common errors with an example message each.
    pub fn error_analysis(&self, days: u32) -> Result<Vec<ErrorSummary>> {
        let since = Self::since(days);
        self.ledger.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT error_type, COUNT(*), operation_type, error_message
                 FROM operations
                 WHERE started_at >= ?1 AND success = 0 AND error_type IS NOT NULL
                 GROUP BY error_type, operation_type
                 ORDER BY COUNT(*) DESC
                 LIMIT 20",
            )?;
            let rows = stmt.query_map(params![since], |row| {
                Ok(ErrorSummary {
                    error_type: row.get(0)?,
                    count: row.get(1)?,
                    operation_type: row.get(2)?,
                    example_message: row.get(3)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Issue-processing aggregates over the window.
    pub fn issue_stats(&self, days: u32) -> Result<IssueStats> {
        let since = Self::since(days);
        self.ledger.with_conn(|conn| {
            conn.query_row(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN ip.success = 1 THEN 1 ELSE 0 END), 0),
                    COALESCE(AVG(complexity), 0.0),
                    COALESCE(AVG(files_changed), 0.0),
                    COALESCE(AVG(lines_added), 0.0),
                    COALESCE(AVG(tests_added), 0.0),
                    COALESCE(AVG(time_to_completion_seconds), 0.0)
                 FROM issue_processing ip
                 JOIN operations o ON ip.operation_id = o.id
                 WHERE o.started_at >= ?1",
                params![since],
                |row| {
                    let total: i64 = row.get(0)?;
                    let successful: i64 = row.get(1)?;
                    Ok(IssueStats {
                        total_issues: total,
                        success_rate: if total > 0 {
                            successful as f64 / total as f64 * 100.0
                        } else {
                            0.0
                        },
                        avg_complexity: row.get(2)?,
                        avg_files_changed: row.get(3)?,
                        avg_lines_added: row.get(4)?,
                        avg_tests_added: row.get(5)?,
                        avg_completion_time: row.get(6)?,
                    })
                },
            )
        })
    }

    /// PR-management aggregates over the window.
    pub fn pr_stats(&self, days: u32) -> Result<PrStats> {
        let since = Self::since(days);
        self.ledger.with_conn(|conn| {
            conn.query_row(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN merged = 1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN ci_passed = 1 THEN 1 ELSE 0 END), 0),
                    COALESCE(AVG(time_to_merge_seconds), 0.0),
                    COALESCE(AVG(ci_failure_count), 0.0)
                 FROM pr_management pm
                 JOIN operations o ON pm.operation_id = o.id
                 WHERE o.started_at >= ?1",
                params![since],
                |row| {
                    let total: i64 = row.get(0)?;
                    let merged: i64 = row.get(1)?;
                    let ci_passed: i64 = row.get(2)?;
                    Ok(PrStats {
                        total_prs: total,
                        merge_rate: if total > 0 {
                            merged as f64 / total as f64 * 100.0
                        } else {
                            0.0
                        },
                        ci_pass_rate: if total > 0 {
                            ci_passed as f64 / total as f64 * 100.0
                        } else {
                            0.0
                        },
                        avg_time_to_merge: row.get(3)?,
                        avg_ci_failures: row.get(4)?,
                    })
                },
            )
        })
    }

    /// Spend roll-up by `(provider, model)` over the window.
    pub fn cost_analysis(&self, days: u32) -> Result<CostAnalysis> {
        let since = Self::since(days);
        let by_provider_model: Vec<ProviderModelCost> = self.ledger.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT provider, model,
                        COALESCE(SUM(cost), 0.0),
                        COALESCE(SUM(tokens_used), 0),
                        COUNT(*)
                 FROM code_generation cg
                 JOIN operations o ON cg.operation_id = o.id
                 WHERE o.started_at >= ?1
                 GROUP BY provider, model
                 ORDER BY SUM(cost) DESC",
            )?;
            let rows = stmt.query_map(params![since], |row| {
                Ok(ProviderModelCost {
                    provider: row.get(0)?,
                    model: row.get(1)?,
                    total_cost: row.get(2)?,
                    total_tokens: row.get(3)?,
                    request_count: row.get(4)?,
                })
            })?;
            rows.collect()
        })?;

        Ok(CostAnalysis {
            total_cost: by_provider_model.iter().map(|p| p.total_cost).sum(),
            total_tokens: by_provider_model.iter().map(|p| p.total_tokens).sum(),
            by_provider_model,
        })
    }
}
