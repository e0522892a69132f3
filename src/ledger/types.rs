//! Record types stored in the operations ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::ErrorKind;

/// Kind of recorded orchestrator work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Processing a tracked issue end to end
    ProcessIssue,
    /// Generating code via a reasoning provider
    GenerateCode,
    /// Creating, updating, or merging a pull request
    ManagePr,
    /// One pass of the roadmap pipeline
    RoadmapCycle,
    /// One pass of the learning pipeline
    LearningCycle,
    /// A multi-agent risk assessment
    RiskAssessment,
    /// A repository rollback
    Rollback,
    /// A liveness/health probe sweep
    HealthCheck,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ProcessIssue => "process_issue",
            Self::GenerateCode => "generate_code",
            Self::ManagePr => "manage_pr",
            Self::RoadmapCycle => "roadmap_cycle",
            Self::LearningCycle => "learning_cycle",
            Self::RiskAssessment => "risk_assessment",
            Self::Rollback => "rollback",
            Self::HealthCheck => "health_check",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "process_issue" => Self::ProcessIssue,
            "generate_code" => Self::GenerateCode,
            "manage_pr" => Self::ManagePr,
            "roadmap_cycle" => Self::RoadmapCycle,
            "learning_cycle" => Self::LearningCycle,
            "risk_assessment" => Self::RiskAssessment,
            "rollback" => Self::Rollback,
            "health_check" => Self::HealthCheck,
            other => return Err(format!("unknown operation kind: {other}")),
        })
    }
}

/// Stable identifier of a row in the `operations` table.
pub type OperationId = i64;

/// A single recorded unit of orchestrator work.
///
/// Created with `Success = false` and no completion time; mutated exactly
/// once on completion; never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: OperationId,
    pub kind: OperationKind,
    /// Free-form external identifier (issue number, PR number, cycle id)
    pub external_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub success: bool,
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub retry_count: u32,
    /// JSON-encoded context bag
    pub context: Option<Value>,
}

impl OperationRecord {
    /// Whether this operation has been completed.
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Per-issue metrics attached to a `ProcessIssue` operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueProcessingFact {
    pub issue_number: i64,
    pub complexity: Option<i64>,
    pub files_changed: Option<i64>,
    pub lines_added: Option<i64>,
    pub lines_deleted: Option<i64>,
    pub tests_added: Option<i64>,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub time_to_completion_seconds: Option<f64>,
}

/// Per-call metrics attached to a `GenerateCode` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeGenerationFact {
    pub issue_number: Option<i64>,
    pub provider: String,
    pub model: String,
    pub tokens_used: Option<i64>,
    pub cost: Option<f64>,
    pub first_attempt_success: bool,
    pub retry_count: u32,
    pub test_pass_rate: Option<f64>,
    pub error_kind: Option<ErrorKind>,
}

/// Per-PR metrics attached to a `ManagePr` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrManagementFact {
    pub pr_number: i64,
    pub issue_number: Option<i64>,
    pub created: bool,
    pub merged: bool,
    pub ci_passed: Option<bool>,
    pub review_approved: Option<bool>,
    pub time_to_merge_seconds: Option<f64>,
    pub ci_failure_count: u32,
}

/// Per-cycle metrics attached to a `RoadmapCycle` operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoadmapFact {
    pub proposals_generated: u32,
    pub proposals_validated: u32,
    pub proposals_approved: u32,
    pub issues_created: u32,
    pub issues_implemented: u32,
    pub average_proposal_quality: Option<f64>,
}

/// Side fact attachable to exactly one operation.
///
/// One operation carries zero or one fact per table; facts are immutable
/// after the insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "fact", rename_all = "snake_case")]
pub enum OperationFact {
    IssueProcessing(IssueProcessingFact),
    CodeGeneration(CodeGenerationFact),
    PrManagement(PrManagementFact),
    Roadmap(RoadmapFact),
}

/// Latest-only snapshot of repository facts prepended to rendered prompts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryContext {
    pub repository: String,
    pub default_branch: String,
    pub primary_language: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub facts: HashMap<String, Value>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl RepositoryContext {
    pub fn new(repository: impl Into<String>, default_branch: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            default_branch: default_branch.into(),
            primary_language: None,
            description: None,
            facts: HashMap::new(),
            last_updated: None,
        }
    }

    /// Render as the "Repository Context" block used in prompts.
    pub fn render(&self) -> String {
        let mut out = String::from("## Repository Context\n");
        out.push_str(&format!("- Repository: {}\n", self.repository));
        out.push_str(&format!("- Default branch: {}\n", self.default_branch));
        if let Some(lang) = &self.primary_language {
            out.push_str(&format!("- Primary language: {}\n", lang));
        }
        if let Some(desc) = &self.description {
            out.push_str(&format!("- Description: {}\n", desc));
        }
        let mut keys: Vec<_> = self.facts.keys().collect();
        keys.sort();
        for key in keys {
            out.push_str(&format!("- {}: {}\n", key, self.facts[key]));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_operation_kind_round_trip() {
        let kinds = [
            OperationKind::ProcessIssue,
            OperationKind::GenerateCode,
            OperationKind::ManagePr,
            OperationKind::RoadmapCycle,
            OperationKind::LearningCycle,
            OperationKind::RiskAssessment,
            OperationKind::Rollback,
            OperationKind::HealthCheck,
        ];
        for kind in kinds {
            let parsed: OperationKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_unknown_operation_kind_rejected() {
        assert!("definitely_not_a_kind".parse::<OperationKind>().is_err());
    }

    #[test]
    fn test_repository_context_render() {
        let mut ctx = RepositoryContext::new("acme/widgets", "main");
        ctx.primary_language = Some("Rust".into());
        ctx.facts
            .insert("open_issues".into(), serde_json::json!(12));

        let rendered = ctx.render();
        assert!(rendered.starts_with("## Repository Context"));
        assert!(rendered.contains("- Repository: acme/widgets"));
        assert!(rendered.contains("- Primary language: Rust"));
        assert!(rendered.contains("- open_issues: 12"));
    }

    #[test]
    fn test_fact_serialization_round_trip() {
        let fact = OperationFact::CodeGeneration(CodeGenerationFact {
            issue_number: Some(42),
            provider: "anthropic".into(),
            model: "claude-3-5-sonnet".into(),
            tokens_used: Some(1500),
            cost: Some(0.02),
            first_attempt_success: true,
            retry_count: 0,
            test_pass_rate: Some(1.0),
            error_kind: None,
        });

        let json = serde_json::to_string(&fact).unwrap();
        let back: OperationFact = serde_json::from_str(&json).unwrap();
        match back {
            OperationFact::CodeGeneration(f) => {
                assert_eq!(f.provider, "anthropic");
                assert_eq!(f.tokens_used, Some(1500));
            }
            _ => panic!("wrong fact variant"),
        }
    }
}
