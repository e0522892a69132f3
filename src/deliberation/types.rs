//! Result types for the deliberation engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Multi-perspective root cause analysis of a failure pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCauseAnalysis {
    pub pattern_id: String,
    /// Per-provider analysis text
    pub analyses: BTreeMap<String, String>,
    /// Runner-synthesized consensus, when provided
    pub consensus: Option<String>,
    pub confidence: f64,
    pub cost: f64,
    pub tokens_used: u64,
}

/// Lesson synthesized through the dialectical process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningLesson {
    pub pattern_id: String,
    /// What went wrong
    pub thesis: String,
    /// Why it happened
    pub antithesis: String,
    /// How to prevent it
    pub synthesis: String,
    pub actionable_items: Vec<String>,
    pub confidence: f64,
    pub cost: f64,
    pub tokens_used: u64,
}

/// Concrete improvements generated from a lesson.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImprovementRecommendations {
    pub pattern_id: String,
    /// Template id → improved template text
    pub prompt_improvements: BTreeMap<String, String>,
    pub validation_rules: Vec<String>,
    pub complexity_adjustments: BTreeMap<String, String>,
    pub context_additions: Vec<String>,
    pub consensus_score: f64,
    pub cost: f64,
    pub tokens_used: u64,
}

impl ImprovementRecommendations {
    pub fn is_empty(&self) -> bool {
        self.prompt_improvements.is_empty()
            && self.validation_rules.is_empty()
            && self.complexity_adjustments.is_empty()
            && self.context_additions.is_empty()
    }
}

/// Verdict on whether applied improvements should stay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Keep,
    Refine,
    Revert,
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Keep => "keep",
            Self::Refine => "refine",
            Self::Revert => "revert",
        };
        write!(f, "{}", s)
    }
}

/// Validation of improvement effectiveness against before/after metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectivenessValidation {
    pub pattern_id: String,
    pub prevented_failures: bool,
    pub failure_rate_before: f64,
    pub failure_rate_after: f64,
    pub side_effects: Vec<String>,
    pub recommendation: Recommendation,
    pub confidence: f64,
    pub cost: f64,
    pub tokens_used: u64,
}
