//! Safety manager: orchestrates guard, risk assessment, and breaking-change
//! analysis into a single decision. Highest risk wins.

use std::sync::Arc;
use tracing::{info, instrument};

use super::breaking::BreakingChangeDetector;
use super::guard::OperationGuard;
use super::risk::RiskAssessor;
use super::types::{BreakingSeverity, RiskLevel, SafetyCheckResult};
use crate::runner::ProviderRunner;

/// Chains the operation guard, multi-agent risk assessor, and
/// breaking-change analyzer, then applies the decision matrix:
///
/// | Risk | allowed | requires approval |
/// |---|---|---|
/// | CRITICAL | no | no (blocked outright) |
/// | HIGH | no | yes |
/// | MEDIUM | yes | yes |
/// | LOW | yes | no |
pub struct SafetyManager {
    guard: OperationGuard,
    risk_assessor: Option<RiskAssessor>,
    breaking_detector: Option<BreakingChangeDetector>,
}

impl SafetyManager {
    /// Full manager with multi-agent assessment and breaking-change
    /// detection enabled.
    pub fn new(runner: Arc<dyn ProviderRunner>) -> Self {
        Self {
            guard: OperationGuard::new(),
            risk_assessor: Some(RiskAssessor::new(Arc::clone(&runner))),
            breaking_detector: Some(BreakingChangeDetector::new(runner)),
        }
    }

    /// Guard-only manager; detected operations decide without provider
    /// consultation (everything detected is treated as MEDIUM).
    pub fn guard_only() -> Self {
        Self {
            guard: OperationGuard::new(),
            risk_assessor: None,
            breaking_detector: None,
        }
    }

    pub fn with_guard(mut self, guard: OperationGuard) -> Self {
        self.guard = guard;
        self
    }

    /// Comprehensive safety check over a proposed change set.
    #[instrument(skip_all, fields(files = files_changed.len(), deleted = files_deleted.len()))]
    pub async fn check_operation_safety(
        &self,
        files_changed: &[String],
        files_deleted: &[String],
        diff: &str,
    ) -> SafetyCheckResult {
        let operations = self.guard.detect_operations(files_changed, files_deleted, diff);
        if operations.is_empty() {
            info!("no concerning operations detected");
            return SafetyCheckResult::clear();
        }

        // Risk assessment of each detected operation runs alongside the
        // dialectical breaking-change pass over the diff.
        let assess_all = async {
            let mut assessments = Vec::new();
            if let Some(assessor) = &self.risk_assessor {
                for operation in &operations {
                    assessments.push(assessor.assess(operation, None).await);
                }
            }
            assessments
        };
        let analyze_breaking = async {
            match (&self.breaking_detector, diff.is_empty()) {
                (Some(detector), false) => Some(detector.analyze(diff, files_changed).await),
                _ => None,
            }
        };
        let (risk_assessments, breaking_change_analysis) =
            futures::join!(assess_all, analyze_breaking);

        let mut highest_risk = if self.risk_assessor.is_none() {
            // Without provider consultation every detected operation
            // warrants review.
            RiskLevel::Medium
        } else {
            risk_assessments
                .iter()
                .map(|a| a.risk_level)
                .max()
                .unwrap_or(RiskLevel::Low)
        };
        if let Some(analysis) = &breaking_change_analysis {
            if analysis.overall_severity == BreakingSeverity::Critical {
                highest_risk = RiskLevel::Critical;
            }
        }

        let (allowed, requires_approval, verdict) = match highest_risk {
            RiskLevel::Critical => (false, false, "operation blocked for safety"),
            RiskLevel::High => (false, true, "requires human approval"),
            RiskLevel::Medium => (true, true, "allowed with review"),
            RiskLevel::Low => (true, false, "allowed"),
        };

        let mut blocking_reasons = Vec::new();
        if highest_risk == RiskLevel::Critical {
            blocking_reasons.push("CRITICAL risk level - operation blocked for safety".to_string());
        }

        let mut summary_parts = vec![format!(
            "Overall Risk: {} - {verdict}",
            highest_risk.to_string().to_uppercase()
        )];
        if !risk_assessments.is_empty() {
            summary_parts.push(format!(
                "{} operation(s) assessed by the provider ensemble",
                risk_assessments.len()
            ));
        }
        if let Some(analysis) = &breaking_change_analysis {
            summary_parts.push(format!("Breaking changes: {}", analysis.overall_severity));
        }

        let result = SafetyCheckResult {
            allowed,
            requires_approval,
            risk_level: highest_risk,
            operations_detected: operations,
            risk_assessments,
            breaking_change_analysis,
            summary: summary_parts.join("\n"),
            blocking_reasons,
        };

        info!(
            allowed = result.allowed,
            requires_approval = result.requires_approval,
            risk = %result.risk_level,
            operations = result.operations_detected.len(),
            "safety check completed"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::subprocess::testing::ScriptedRunner;
    use crate::safety::types::OperationClass;
    use pretty_assertions::assert_eq;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_empty_change_set_is_clear() {
        let manager = SafetyManager::guard_only();
        let result = manager.check_operation_safety(&[], &[], "").await;

        assert!(result.allowed);
        assert!(!result.requires_approval);
        assert_eq!(result.risk_level, RiskLevel::Low);
        assert!(result.operations_detected.is_empty());
    }

    #[tokio::test]
    async fn test_critical_assessment_blocks_without_approval() {
        // Two operations detected (deletion + protected); both assessed,
        // the second comes back CRITICAL.
        let runner = Arc::new(ScriptedRunner::new(vec![
            ScriptedRunner::all_response(&[("anthropic", "Risk Level: LOW")]),
            ScriptedRunner::all_response(&[(
                "anthropic",
                "CRITICAL - deleting environment secrets",
            )]),
        ]));

        let manager = SafetyManager::new(runner);
        let result = manager
            .check_operation_safety(&[], &strings(&[".env"]), "")
            .await;

        assert!(!result.allowed);
        assert!(!result.requires_approval);
        assert_eq!(result.risk_level, RiskLevel::Critical);
        assert!(result
            .operations_detected
            .iter()
            .any(|op| op.class == OperationClass::ProtectedFileAccess));
        assert!(result
            .operations_detected
            .iter()
            .any(|op| op.class == OperationClass::FileDeletion));
        assert!(!result.blocking_reasons.is_empty());
    }

    #[tokio::test]
    async fn test_high_risk_requires_approval() {
        let runner = Arc::new(ScriptedRunner::new(vec![ScriptedRunner::all_response(&[(
            "anthropic",
            "HIGH risk: security-sensitive change",
        )])]));

        let manager = SafetyManager::new(runner);
        let result = manager
            .check_operation_safety(&strings(&["src/auth.rs"]), &[], "")
            .await;

        assert!(!result.allowed);
        assert!(result.requires_approval);
        assert_eq!(result.risk_level, RiskLevel::High);
    }

    #[tokio::test]
    async fn test_breaking_critical_elevates_overall() {
        // Risk assessment says LOW; dialectical breaking pass says CRITICAL.
        let runner = Arc::new(ScriptedRunner::new(vec![
            ScriptedRunner::all_response(&[("anthropic", "Risk Level: LOW")]),
            ScriptedRunner::dialectical_response("Overall Severity: CRITICAL - removed public API"),
        ]));

        let manager = SafetyManager::new(runner);
        // Additive diff: the guard's signature heuristic stays quiet and
        // only the dialectical pass flags the problem.
        let diff = "+serde = \"1.0\"\n";
        let result = manager
            .check_operation_safety(&strings(&["src/config.toml"]), &[], diff)
            .await;

        assert_eq!(result.risk_level, RiskLevel::Critical);
        assert!(!result.allowed);
        let breaking = result.breaking_change_analysis.unwrap();
        assert_eq!(breaking.overall_severity, BreakingSeverity::Critical);
    }

    #[tokio::test]
    async fn test_guard_only_detections_are_medium() {
        let manager = SafetyManager::guard_only();
        let result = manager
            .check_operation_safety(&strings(&["app/config.yaml"]), &[], "")
            .await;

        assert!(result.allowed);
        assert!(result.requires_approval);
        assert_eq!(result.risk_level, RiskLevel::Medium);
    }
}
