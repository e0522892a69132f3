//! Failure pattern detection over the operations ledger.
//!
//! Failures are grouped by `(operation kind, error kind)` inside a rolling
//! window. Groups that clear the occurrence floor become `FailurePattern`s
//! with a density-derived severity, and the detector decides which patterns
//! warrant a learning intervention.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::ledger::{Ledger, OperationKind, OperationRecord};

const MAX_FAILURE_EXAMPLES: usize = 10;
const MAX_SUCCESS_EXAMPLES: usize = 5;
const ERROR_PREFIX_WORDS: usize = 10;
const PERSISTENT_SPAN_DAYS: f64 = 3.0;
const MIN_SPAN_DAYS: f64 = 0.1;

/// Severity of a failure pattern, derived from failure density.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Severity from failures-per-day density.
    pub fn from_density(failures_per_day: f64) -> Self {
        if failures_per_day >= 5.0 {
            Self::Critical
        } else if failures_per_day >= 2.0 {
            Self::High
        } else if failures_per_day >= 0.5 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Attributes shared across the failures in a group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommonAttributes {
    /// Modal ten-word prefix of the error messages
    pub common_error_prefix: Option<String>,
    pub avg_retry_count: Option<f64>,
    /// External ids (issue/PR numbers) seen in the group
    #[serde(default)]
    pub external_ids: Vec<String>,
}

/// A derived clustering of failed operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailurePattern {
    pub pattern_id: String,
    pub kind: OperationKind,
    /// Error taxonomy bucket as stored, `"unknown"` when absent
    pub error_kind: String,
    pub occurrence_count: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub failure_examples: Vec<OperationRecord>,
    pub success_examples: Vec<OperationRecord>,
    pub common_attributes: CommonAttributes,
    pub severity: Severity,
}

impl FailurePattern {
    /// Days between first and last occurrence, floored to avoid division
    /// blow-ups on near-instant bursts.
    pub fn span_days(&self) -> f64 {
        let span = (self.last_seen - self.first_seen).num_seconds() as f64 / 86_400.0;
        span.max(MIN_SPAN_DAYS)
    }

    /// Failures per day across the span.
    pub fn failures_per_day(&self) -> f64 {
        self.occurrence_count as f64 / self.span_days()
    }
}

/// Groups failed operations and decides learning triggers.
pub struct PatternDetector {
    ledger: Arc<Ledger>,
    min_occurrences: usize,
    lookback_days: i64,
}

impl PatternDetector {
    pub const DEFAULT_MIN_OCCURRENCES: usize = 3;
    pub const DEFAULT_LOOKBACK_DAYS: i64 = 30;

    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            ledger,
            min_occurrences: Self::DEFAULT_MIN_OCCURRENCES,
            lookback_days: Self::DEFAULT_LOOKBACK_DAYS,
        }
    }

    pub fn with_min_occurrences(mut self, min_occurrences: usize) -> Self {
        self.min_occurrences = min_occurrences.max(1);
        self
    }

    pub fn with_lookback_days(mut self, days: i64) -> Self {
        self.lookback_days = days.max(1);
        self
    }

    /// Detect all failure patterns in the lookback window, ordered by
    /// severity descending, then occurrence count descending; ties broken
    /// by the later `last_seen`.
    pub fn detect_patterns(&self) -> Result<Vec<FailurePattern>> {
        let since = Utc::now() - Duration::days(self.lookback_days);
        let failures = self.ledger.failed_operations_since(since)?;

        if failures.is_empty() {
            debug!("no failures in lookback window");
            return Ok(Vec::new());
        }

        let mut groups: HashMap<(OperationKind, String), Vec<OperationRecord>> = HashMap::new();
        for failure in failures {
            let error_kind = failure
                .error_kind
                .map(|k| k.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            groups.entry((failure.kind, error_kind)).or_default().push(failure);
        }

        let mut patterns = Vec::new();
        for ((kind, error_kind), group) in groups {
            if group.len() < self.min_occurrences {
                continue;
            }
            patterns.push(self.build_pattern(kind, error_kind, group)?);
        }

        patterns.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.occurrence_count.cmp(&a.occurrence_count))
                .then(b.last_seen.cmp(&a.last_seen))
        });

        info!(patterns = patterns.len(), "pattern detection completed");
        Ok(patterns)
    }

    /// Whether a pattern warrants a learning intervention: High/Critical
    /// severity, or persistence (≥3 days span with the occurrence floor met).
    pub fn should_trigger_learning(&self, pattern: &FailurePattern) -> bool {
        if pattern.severity >= Severity::High {
            return true;
        }

        let span = (pattern.last_seen - pattern.first_seen).num_seconds() as f64 / 86_400.0;
        span >= PERSISTENT_SPAN_DAYS && pattern.occurrence_count >= self.min_occurrences
    }

    fn build_pattern(
        &self,
        kind: OperationKind,
        error_kind: String,
        mut group: Vec<OperationRecord>,
    ) -> Result<FailurePattern> {
        // Newest first, as returned by the ledger; examples keep that order.
        let first_seen = group.iter().map(|op| op.started_at).min().unwrap_or_else(Utc::now);
        let last_seen = group.iter().map(|op| op.started_at).max().unwrap_or_else(Utc::now);

        let common_attributes = Self::common_attributes(&group);
        let success_examples = self.ledger.recent_successes(kind, MAX_SUCCESS_EXAMPLES)?;

        let occurrence_count = group.len();
        group.truncate(MAX_FAILURE_EXAMPLES);

        let span_days =
            ((last_seen - first_seen).num_seconds() as f64 / 86_400.0).max(MIN_SPAN_DAYS);
        let severity = Severity::from_density(occurrence_count as f64 / span_days);

        Ok(FailurePattern {
            pattern_id: format!(
                "pattern_{}_{}_{}",
                kind,
                error_kind,
                first_seen.timestamp()
            ),
            kind,
            error_kind,
            occurrence_count,
            first_seen,
            last_seen,
            failure_examples: group,
            success_examples,
            common_attributes,
            severity,
        })
    }

    fn common_attributes(group: &[OperationRecord]) -> CommonAttributes {
        let mut prefix_counts: HashMap<String, usize> = HashMap::new();
        for op in group {
            if let Some(message) = &op.error_message {
                let prefix = message
                    .split_whitespace()
                    .take(ERROR_PREFIX_WORDS)
                    .collect::<Vec<_>>()
                    .join(" ");
                *prefix_counts.entry(prefix).or_default() += 1;
            }
        }
        let common_error_prefix = prefix_counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(prefix, _)| prefix);

        let retries: Vec<u32> = group.iter().map(|op| op.retry_count).collect();
        let avg_retry_count = if retries.is_empty() {
            None
        } else {
            Some(retries.iter().map(|&r| r as f64).sum::<f64>() / retries.len() as f64)
        };

        let external_ids = group
            .iter()
            .filter_map(|op| op.external_id.clone())
            .collect();

        CommonAttributes {
            common_error_prefix,
            avg_retry_count,
            external_ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn seed_failures(
        ledger: &Ledger,
        kind: OperationKind,
        error_kind: ErrorKind,
        message: &str,
        count: usize,
        span: ChronoDuration,
    ) {
        let now = Utc::now();
        for i in 0..count {
            let offset = if count > 1 {
                span * i as i32 / (count as i32 - 1)
            } else {
                ChronoDuration::zero()
            };
            let started = now - span + offset;
            let id = ledger
                .start_operation_at(kind, Some(&format!("op-{i}")), None, started)
                .unwrap();
            ledger
                .complete_operation_at(
                    id,
                    false,
                    Some(message),
                    Some(error_kind),
                    1,
                    started + ChronoDuration::minutes(1),
                )
                .unwrap();
        }
    }

    fn detector(ledger: &Arc<Ledger>) -> PatternDetector {
        PatternDetector::new(Arc::clone(ledger)).with_min_occurrences(3)
    }

    #[test]
    fn test_no_failures_no_patterns() {
        let ledger = Arc::new(Ledger::in_memory().unwrap());
        let patterns = detector(&ledger).detect_patterns().unwrap();
        assert!(patterns.is_empty());
    }

    #[test]
    fn test_below_min_occurrences_no_patterns() {
        let ledger = Arc::new(Ledger::in_memory().unwrap());
        seed_failures(
            &ledger,
            OperationKind::ProcessIssue,
            ErrorKind::ProviderFault,
            "timed out",
            2,
            ChronoDuration::hours(2),
        );
        let patterns = detector(&ledger).detect_patterns().unwrap();
        assert!(patterns.is_empty());
    }

    #[test]
    fn test_burst_of_failures_is_critical() {
        let ledger = Arc::new(Ledger::in_memory().unwrap());
        // 5 failures over 12 hours: 10 per day.
        seed_failures(
            &ledger,
            OperationKind::ProcessIssue,
            ErrorKind::ProviderFault,
            "provider timed out waiting for response",
            5,
            ChronoDuration::hours(12),
        );

        let detector = detector(&ledger);
        let patterns = detector.detect_patterns().unwrap();
        assert_eq!(patterns.len(), 1);

        let pattern = &patterns[0];
        assert_eq!(pattern.kind, OperationKind::ProcessIssue);
        assert_eq!(pattern.error_kind, "provider_fault");
        assert_eq!(pattern.occurrence_count, 5);
        assert_eq!(pattern.severity, Severity::Critical);
        assert!(detector.should_trigger_learning(pattern));
    }

    #[test]
    fn test_spread_failures_are_high() {
        let ledger = Arc::new(Ledger::in_memory().unwrap());
        // 5 failures over 2 days: 2.5 per day.
        seed_failures(
            &ledger,
            OperationKind::GenerateCode,
            ErrorKind::HostFault,
            "host returned 503",
            5,
            ChronoDuration::days(2),
        );

        let detector = detector(&ledger);
        let patterns = detector.detect_patterns().unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].severity, Severity::High);
        assert!(detector.should_trigger_learning(&patterns[0]));
    }

    #[test]
    fn test_persistent_low_severity_still_triggers() {
        let ledger = Arc::new(Ledger::in_memory().unwrap());
        // 3 failures over 10 days: 0.3/day (Low), but persistent.
        seed_failures(
            &ledger,
            OperationKind::ManagePr,
            ErrorKind::RateLimited,
            "rate limited",
            3,
            ChronoDuration::days(10),
        );

        let detector = detector(&ledger);
        let patterns = detector.detect_patterns().unwrap();
        assert_eq!(patterns[0].severity, Severity::Low);
        assert!(detector.should_trigger_learning(&patterns[0]));
    }

    #[test]
    fn test_examples_capped_and_successes_sampled() {
        let ledger = Arc::new(Ledger::in_memory().unwrap());
        seed_failures(
            &ledger,
            OperationKind::ProcessIssue,
            ErrorKind::ProviderFault,
            "boom",
            14,
            ChronoDuration::days(1),
        );
        for _ in 0..8 {
            let id = ledger
                .start_operation(OperationKind::ProcessIssue, None, None)
                .unwrap();
            ledger.complete_operation(id, true, None, None, 0).unwrap();
        }

        let patterns = detector(&ledger).detect_patterns().unwrap();
        let pattern = &patterns[0];
        assert_eq!(pattern.occurrence_count, 14);
        assert_eq!(pattern.failure_examples.len(), 10);
        assert_eq!(pattern.success_examples.len(), 5);
    }

    #[test]
    fn test_common_attributes() {
        let ledger = Arc::new(Ledger::in_memory().unwrap());
        seed_failures(
            &ledger,
            OperationKind::ProcessIssue,
            ErrorKind::ProviderFault,
            "connection reset by peer during streaming of model output tokens here",
            4,
            ChronoDuration::hours(6),
        );

        let patterns = detector(&ledger).detect_patterns().unwrap();
        let attrs = &patterns[0].common_attributes;
        // Prefix capped at ten words.
        assert_eq!(
            attrs.common_error_prefix.as_deref(),
            Some("connection reset by peer during streaming of model output tokens")
        );
        assert_eq!(attrs.avg_retry_count, Some(1.0));
        assert_eq!(attrs.external_ids.len(), 4);
    }

    #[test]
    fn test_ordering_severity_then_count() {
        let ledger = Arc::new(Ledger::in_memory().unwrap());
        // Low-severity persistent group.
        seed_failures(
            &ledger,
            OperationKind::ManagePr,
            ErrorKind::RateLimited,
            "rate limited",
            4,
            ChronoDuration::days(20),
        );
        // Critical burst group.
        seed_failures(
            &ledger,
            OperationKind::ProcessIssue,
            ErrorKind::ProviderFault,
            "timeout",
            6,
            ChronoDuration::hours(6),
        );

        let patterns = detector(&ledger).detect_patterns().unwrap();
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0].severity, Severity::Critical);
        assert_eq!(patterns[1].severity, Severity::Low);
    }

    proptest! {
        /// Adding occurrences without widening the span never lowers severity.
        #[test]
        fn prop_severity_monotone_in_count(count in 1usize..200, extra in 0usize..100, span_hours in 1i64..720) {
            let span_days = (span_hours as f64 / 24.0).max(MIN_SPAN_DAYS);
            let before = Severity::from_density(count as f64 / span_days);
            let after = Severity::from_density((count + extra) as f64 / span_days);
            prop_assert!(after >= before);
        }
    }
}
