//! Types flowing through the roadmap pipeline: proposals, critiques,
//! synthesis, validation, and issue creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Priority attached to a feature proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl ProposalPriority {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Critical => "priority-critical",
            Self::High => "priority-high",
            Self::Medium => "priority-medium",
            Self::Low => "priority-low",
        }
    }

    /// Parse from free text, defaulting to Medium.
    pub fn parse_lenient(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("critical") {
            Self::Critical
        } else if lower.contains("high") {
            Self::High
        } else if lower.contains("low") {
            Self::Low
        } else {
            Self::Medium
        }
    }
}

impl std::fmt::Display for ProposalPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        write!(f, "{}", s)
    }
}

/// A single feature proposal from one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureProposal {
    pub id: String,
    pub title: String,
    pub description: String,
    pub provider: String,
    pub value_proposition: String,
    /// 1-10
    pub complexity_estimate: u32,
    pub priority: ProposalPriority,
    pub dependencies: Vec<String>,
    pub success_metrics: Vec<String>,
    pub estimated_effort: Option<String>,
    pub category: Option<String>,
}

/// Cross-provider critique of one proposal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProposalCritique {
    pub proposal_id: String,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    /// 0-1
    pub feasibility_score: f64,
    /// 0-1
    pub value_score: f64,
    pub overlaps_with: Vec<String>,
    pub conflicts_with: Vec<String>,
    pub suggestions: Vec<String>,
    /// Provider → 1-10 rating
    pub provider_ratings: BTreeMap<String, u32>,
}

/// One named phase of the synthesized roadmap, referencing proposal ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoadmapPhase {
    pub name: String,
    pub timeline: String,
    pub features: Vec<String>,
}

/// Roadmap produced by dialectical synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesizedRoadmap {
    pub phases: Vec<RoadmapPhase>,
    /// 0-1
    pub consensus_confidence: f64,
    pub total_proposals_considered: usize,
    pub selected_proposals: usize,
    /// Provider → key emphasis
    pub provider_perspectives: BTreeMap<String, String>,
    pub synthesis_notes: String,
    pub created_at: DateTime<Utc>,
}

/// Complete output of the three ideation phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdeationResult {
    pub proposals: Vec<FeatureProposal>,
    /// Proposal id → critique
    pub critiques: BTreeMap<String, ProposalCritique>,
    pub synthesized_roadmap: SynthesizedRoadmap,
    pub total_cost: f64,
    pub total_tokens: u64,
}

/// Verdict on a proposal from dialectical validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationDecision {
    Approved,
    ApprovedWithChanges,
    NeedsRevision,
    Rejected,
}

impl ValidationDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved | Self::ApprovedWithChanges)
    }
}

impl std::fmt::Display for ValidationDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Approved => "approved",
            Self::ApprovedWithChanges => "approved_with_changes",
            Self::NeedsRevision => "needs_revision",
            Self::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

/// Validation verdict and supporting detail for one proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalValidation {
    pub proposal_id: String,
    pub decision: ValidationDecision,
    /// 0-1
    pub confidence: f64,
    pub strengths: Vec<String>,
    pub concerns: Vec<String>,
    pub risks: Vec<String>,
    pub suggestions: Vec<String>,
}

/// The thesis/antithesis/synthesis trace of a validation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialecticalValidation {
    pub thesis: String,
    pub antithesis: String,
    pub synthesis: String,
    /// 0-1
    pub consensus_confidence: f64,
}

/// Fully validated roadmap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedRoadmap {
    pub original_roadmap: SynthesizedRoadmap,
    pub validated_proposals: BTreeMap<String, ProposalValidation>,
    pub dialectical_validation: DialecticalValidation,
    pub approved_proposals: Vec<FeatureProposal>,
    pub rejected_proposals: Vec<FeatureProposal>,
    pub needs_revision: Vec<FeatureProposal>,
    pub refined_phases: Vec<RoadmapPhase>,
    /// 0-1
    pub overall_confidence: f64,
    pub total_cost: f64,
    pub total_tokens: u64,
}

/// One issue created from an approved proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedIssue {
    pub issue_number: u64,
    pub title: String,
    pub proposal_id: String,
    pub url: String,
    pub labels: Vec<String>,
}

/// Outcome of turning approved proposals into tracked issues.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueCreationResult {
    pub created_issues: Vec<CreatedIssue>,
    pub skipped_proposals: Vec<String>,
    pub failed_proposals: Vec<String>,
}

impl IssueCreationResult {
    pub fn total_created(&self) -> usize {
        self.created_issues.len()
    }
}

/// Outcome of a full roadmap cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoadmapCycleReport {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub proposals_generated: usize,
    pub proposals_validated: usize,
    pub proposals_approved: usize,
    pub proposals_rejected: usize,
    pub issues_created: usize,
    pub total_cost: f64,
    pub total_tokens: u64,
}
