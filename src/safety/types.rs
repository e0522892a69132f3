//! Shared types for the safety arbitration layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered four-valued risk measure consumed by the decision matrix.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Escalate one step; Critical saturates.
    pub fn escalate(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

impl std::fmt::Display for RiskLevel {
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

/// Classification of a proposed externally-visible change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    FileDeletion,
    FileModification,
    SecurityChange,
    BreakingChange,
    ComplexChange,
    ProtectedFileAccess,
    DatabaseMigration,
    ConfigurationChange,
}

impl std::fmt::Display for OperationClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::FileDeletion => "file_deletion",
            Self::FileModification => "file_modification",
            Self::SecurityChange => "security_change",
            Self::BreakingChange => "breaking_change",
            Self::ComplexChange => "complex_change",
            Self::ProtectedFileAccess => "protected_file_access",
            Self::DatabaseMigration => "database_migration",
            Self::ConfigurationChange => "configuration_change",
        };
        write!(f, "{}", s)
    }
}

/// An operation requiring safety validation, emitted by the guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedOperation {
    pub class: OperationClass,
    pub description: String,
    pub files: Vec<String>,
    pub changes_summary: String,
    /// 0-10 scale, populated for complex changes
    pub complexity: u32,
    /// Brief description of impact scope
    pub scope: String,
}

impl DetectedOperation {
    pub fn new(class: OperationClass, description: impl Into<String>) -> Self {
        Self {
            class,
            description: description.into(),
            files: Vec::new(),
            changes_summary: String::new(),
            complexity: 0,
            scope: String::new(),
        }
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.changes_summary = summary.into();
        self
    }

    pub fn with_complexity(mut self, complexity: u32) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }
}

/// Risk assessment for one detected operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub operation: DetectedOperation,
    pub risk_level: RiskLevel,
    /// Share of providers voting for the chosen level (0.0-1.0)
    pub consensus_strength: f64,
    /// Provider id → extracted risk level keyword
    pub provider_votes: BTreeMap<String, String>,
    pub rationale: String,
    pub potential_impacts: Vec<String>,
    pub hidden_dependencies: Vec<String>,
    /// EASY / MODERATE / DIFFICULT / IRREVERSIBLE
    pub rollback_complexity: String,
    pub blast_radius: String,
    pub unanimous: bool,
    pub assessed_at: DateTime<Utc>,
}

/// Severity of a breaking-change analysis.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakingSeverity {
    None,
    Minor,
    Major,
    Critical,
}

impl std::fmt::Display for BreakingSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "NONE",
            Self::Minor => "MINOR",
            Self::Major => "MAJOR",
            Self::Critical => "CRITICAL",
        };
        write!(f, "{}", s)
    }
}

/// Result of the dialectical breaking-change pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakingChangeAnalysis {
    pub overall_severity: BreakingSeverity,
    pub consensus_reached: bool,
    /// Provider id → extracted severity
    pub provider_assessments: BTreeMap<String, BreakingSeverity>,
    pub recommendation: String,
}

/// Final decision from the safety manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyCheckResult {
    pub allowed: bool,
    pub requires_approval: bool,
    pub risk_level: RiskLevel,
    pub operations_detected: Vec<DetectedOperation>,
    pub risk_assessments: Vec<RiskAssessment>,
    pub breaking_change_analysis: Option<BreakingChangeAnalysis>,
    pub summary: String,
    pub blocking_reasons: Vec<String>,
}

impl SafetyCheckResult {
    /// The all-clear result used when no concerning operations are detected.
    pub fn clear() -> Self {
        Self {
            allowed: true,
            requires_approval: false,
            risk_level: RiskLevel::Low,
            operations_detected: Vec::new(),
            risk_assessments: Vec::new(),
            breaking_change_analysis: None,
            summary: "No safety concerns detected".to_string(),
            blocking_reasons: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }

    #[test]
    fn test_risk_escalation_saturates() {
        assert_eq!(RiskLevel::Low.escalate(), RiskLevel::Medium);
        assert_eq!(RiskLevel::High.escalate(), RiskLevel::Critical);
        assert_eq!(RiskLevel::Critical.escalate(), RiskLevel::Critical);
    }

    #[test]
    fn test_breaking_severity_ordering() {
        assert!(BreakingSeverity::None < BreakingSeverity::Minor);
        assert!(BreakingSeverity::Major < BreakingSeverity::Critical);
    }

    #[test]
    fn test_clear_result() {
        let result = SafetyCheckResult::clear();
        assert!(result.allowed);
        assert!(!result.requires_approval);
        assert_eq!(result.risk_level, RiskLevel::Low);
        assert!(result.operations_detected.is_empty());
    }
}
