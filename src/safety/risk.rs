//! Multi-agent risk assessment with safety-first conservative consensus.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::types::{DetectedOperation, RiskAssessment, RiskLevel};
use crate::runner::{ProviderRunner, Strategy};

const ASSESSMENT_TIMEOUT: Duration = Duration::from_secs(180);
const MAX_LISTED_FILES: usize = 10;
const MAX_EXTRACTED_ITEMS: usize = 10;

/// Assesses operation risk across providers; the highest level any provider
/// returns wins, and an outright runner failure is CRITICAL.
pub struct RiskAssessor {
    runner: Arc<dyn ProviderRunner>,
    timeout: Duration,
}

impl RiskAssessor {
    pub fn new(runner: Arc<dyn ProviderRunner>) -> Self {
        Self {
            runner,
            timeout: ASSESSMENT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Assess one detected operation, fanning to all providers.
    #[instrument(skip(self, operation), fields(class = %operation.class))]
    pub async fn assess(
        &self,
        operation: &DetectedOperation,
        additional_context: Option<&str>,
    ) -> RiskAssessment {
        let prompt = build_assessment_prompt(operation, additional_context);

        let response = match self.runner.query(&prompt, Strategy::All, self.timeout).await {
            Ok(response) if response.success => response,
            Ok(response) => {
                warn!(error = ?response.error, "risk assessment runner failure");
                return Self::fail_closed(operation, response.error.as_deref());
            }
            Err(e) => {
                warn!(error = %e, "risk assessment could not invoke runner");
                return Self::fail_closed(operation, Some(&e.to_string()));
            }
        };

        let mut provider_votes = BTreeMap::new();
        for (provider, text) in &response.responses {
            provider_votes.insert(provider.clone(), extract_risk_keyword(text).to_string());
        }

        let (risk_level, consensus_strength, unanimous) = build_consensus(&provider_votes);

        let assessment = RiskAssessment {
            operation: operation.clone(),
            risk_level,
            consensus_strength,
            rationale: build_rationale(risk_level, consensus_strength, &provider_votes, &response.responses),
            potential_impacts: extract_bullets_after(
                &response.responses,
                &["potential impact", "what could go wrong", "failure scenario"],
                &["blast radius", "hidden depend", "rollback", "reasoning"],
            ),
            hidden_dependencies: extract_bullets_after(
                &response.responses,
                &["hidden depend", "implicit depend"],
                &["rollback", "reasoning", "risk level", "blast"],
            ),
            rollback_complexity: extract_rollback_complexity(&response.responses),
            blast_radius: extract_blast_radius(&response.responses),
            provider_votes,
            unanimous,
            assessed_at: Utc::now(),
        };

        info!(
            risk = %assessment.risk_level,
            consensus = assessment.consensus_strength,
            unanimous = assessment.unanimous,
            "operation risk assessed"
        );
        assessment
    }

    /// Assessment failure defaults to CRITICAL.
    fn fail_closed(operation: &DetectedOperation, error: Option<&str>) -> RiskAssessment {
        RiskAssessment {
            operation: operation.clone(),
            risk_level: RiskLevel::Critical,
            consensus_strength: 1.0,
            provider_votes: BTreeMap::new(),
            rationale: format!(
                "Risk assessment failed: {}. Defaulting to CRITICAL for safety.",
                error.unwrap_or("no response")
            ),
            potential_impacts: Vec::new(),
            hidden_dependencies: Vec::new(),
            rollback_complexity: String::new(),
            blast_radius: String::new(),
            unanimous: true,
            assessed_at: Utc::now(),
        }
    }
}

fn build_assessment_prompt(
    operation: &DetectedOperation,
    additional_context: Option<&str>,
) -> String {
    let file_list = if operation.files.is_empty() {
        String::new()
    } else {
        let shown: Vec<_> = operation
            .files
            .iter()
            .take(MAX_LISTED_FILES)
            .cloned()
            .collect();
        let ellipsis = if operation.files.len() > MAX_LISTED_FILES {
            "\n..."
        } else {
            ""
        };
        format!("**File List**: {}{}\n", shown.join(", "), ellipsis)
    };

    let context = additional_context
        .map(|c| format!("\n\nAdditional Context:\n{c}"))
        .unwrap_or_default();

    format!(
        "Assess the risk of this operation from your perspective as an AI assistant:\n\n\
         **Operation Type**: {class}\n\
         **Description**: {description}\n\
         **Files Affected**: {file_count} file(s)\n\
         {file_list}\
         **Changes Summary**: {summary}\n\
         **Scope**: {scope}\n\
         **Complexity**: {complexity}/10{context}\n\n\
         Please evaluate this operation and provide:\n\n\
         1. **Risk Level**: Choose ONE of: LOW, MEDIUM, HIGH, or CRITICAL\n\
            - LOW: Safe operation with minimal risk\n\
            - MEDIUM: Some risk, requires careful monitoring\n\
            - HIGH: Significant risk, requires approval\n\
            - CRITICAL: Dangerous operation, should be blocked\n\n\
         2. **Potential Impacts**: What could go wrong? List specific failure scenarios.\n\n\
         3. **Blast Radius**: If this fails, what's the scope of impact?\n\n\
         4. **Hidden Dependencies**: Are there implicit dependencies or assumptions\n\
            that could cause issues?\n\n\
         5. **Rollback Complexity**: How difficult would it be to undo this operation?\n\
            - EASY: Simple revert\n\
            - MODERATE: Some manual steps required\n\
            - DIFFICULT: Complex rollback with potential data loss\n\
            - IRREVERSIBLE: Cannot be undone\n\n\
         6. **Reasoning**: Explain your risk assessment in 2-3 sentences.\n\n\
         Format your response clearly with these sections. Be specific and thorough.",
        class = operation.class,
        description = operation.description,
        file_count = operation.files.len(),
        summary = operation.changes_summary,
        scope = operation.scope,
        complexity = operation.complexity,
    )
}

/// Extract a risk keyword, most conservative match first. A mention of
/// "critical" or "dangerous" always wins.
fn extract_risk_keyword(text: &str) -> &'static str {
    let upper = text.to_uppercase();
    if upper.contains("CRITICAL") || upper.contains("DANGEROUS") {
        "CRITICAL"
    } else if upper.contains("HIGH") && upper.contains("RISK") {
        "HIGH"
    } else if upper.contains("MEDIUM") {
        "MEDIUM"
    } else {
        "LOW"
    }
}

fn vote_to_level(vote: &str) -> RiskLevel {
    match vote {
        "CRITICAL" => RiskLevel::Critical,
        "HIGH" => RiskLevel::High,
        "MEDIUM" => RiskLevel::Medium,
        _ => RiskLevel::Low,
    }
}

/// Safety-first consensus: the final level is the highest any provider
/// returned; strength is the share of providers voting for that level.
fn build_consensus(votes: &BTreeMap<String, String>) -> (RiskLevel, f64, bool) {
    if votes.is_empty() {
        return (RiskLevel::Critical, 1.0, true);
    }

    let levels: Vec<RiskLevel> = votes.values().map(|v| vote_to_level(v)).collect();
    let highest = levels.iter().copied().max().unwrap_or(RiskLevel::Critical);
    let supporting = levels.iter().filter(|&&l| l == highest).count();
    let strength = supporting as f64 / levels.len() as f64;
    (highest, strength, (strength - 1.0).abs() < f64::EPSILON)
}

fn build_rationale(
    level: RiskLevel,
    strength: f64,
    votes: &BTreeMap<String, String>,
    responses: &BTreeMap<String, String>,
) -> String {
    let mut parts = vec![format!(
        "Risk Level: {} (Consensus: {:.0}%)",
        level.to_string().to_uppercase(),
        strength * 100.0
    )];

    let vote_list = votes
        .iter()
        .map(|(p, v)| format!("{p}: {v}"))
        .collect::<Vec<_>>()
        .join(", ");
    parts.push(format!("Provider Votes: {vote_list}"));

    let mut concerns = vec!["Key Concerns:".to_string()];
    for (provider, text) in responses {
        let lines: Vec<&str> = text.lines().collect();
        if let Some(idx) = lines
            .iter()
            .position(|l| l.to_lowercase().contains("reasoning"))
        {
            let reasoning: Vec<&str> = lines[idx + 1..]
                .iter()
                .map(|l| l.trim())
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .take(2)
                .collect();
            if !reasoning.is_empty() {
                concerns.push(format!("- {}: {}", provider.to_uppercase(), reasoning.join(" ")));
            }
        }
    }
    if concerns.len() > 1 {
        parts.extend(concerns);
    }

    parts.join("\n")
}

/// Bulleted items between a start keyword and the next section keyword,
/// across all provider responses, deduplicated.
fn extract_bullets_after(
    responses: &BTreeMap<String, String>,
    start_keywords: &[&str],
    stop_keywords: &[&str],
) -> Vec<String> {
    let mut items = Vec::new();

    for text in responses.values() {
        let mut in_section = false;
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let lower = trimmed.to_lowercase();

            if start_keywords.iter().any(|k| lower.contains(k)) {
                in_section = true;
                continue;
            }
            if in_section && stop_keywords.iter().any(|k| lower.starts_with(k)) {
                in_section = false;
            }
            if in_section && (trimmed.starts_with('-') || trimmed.starts_with('*')) {
                let item = trimmed.trim_start_matches(['-', '*', ' ']).to_string();
                if !item.is_empty() && !items.contains(&item) {
                    items.push(item);
                }
            }
        }
    }

    items.truncate(MAX_EXTRACTED_ITEMS);
    items
}

fn extract_rollback_complexity(responses: &BTreeMap<String, String>) -> String {
    for text in responses.values() {
        let upper = text.to_uppercase();
        if upper.contains("IRREVERSIBLE") {
            return "IRREVERSIBLE".to_string();
        }
        if upper.contains("ROLLBACK") {
            if upper.contains("DIFFICULT") {
                return "DIFFICULT".to_string();
            }
            if upper.contains("MODERATE") {
                return "MODERATE".to_string();
            }
            if upper.contains("EASY") {
                return "EASY".to_string();
            }
        }
    }
    "MODERATE".to_string()
}

fn extract_blast_radius(responses: &BTreeMap<String, String>) -> String {
    for text in responses.values() {
        let lines: Vec<&str> = text.lines().collect();
        for (i, line) in lines.iter().enumerate() {
            if line.to_lowercase().contains("blast radius") {
                for candidate in lines.iter().skip(i + 1).take(4) {
                    let trimmed = candidate.trim();
                    if !trimmed.is_empty() && !trimmed.starts_with('#') {
                        return trimmed.trim_start_matches(['-', '*', ' ']).to_string();
                    }
                }
            }
        }
    }
    "Unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::subprocess::testing::ScriptedRunner;
    use crate::safety::types::OperationClass;
    use pretty_assertions::assert_eq;

    fn operation() -> DetectedOperation {
        DetectedOperation::new(OperationClass::FileDeletion, "Deleting 1 file(s)")
            .with_files(vec![".env".to_string()])
    }

    #[tokio::test]
    async fn test_single_critical_vote_wins() {
        let runner = Arc::new(ScriptedRunner::new(vec![ScriptedRunner::all_response(&[
            ("anthropic", "Risk Level: LOW risk overall"),
            ("deepseek", "Risk Level: LOW risk"),
            ("openai", "Risk Level: LOW risk"),
            ("perplexity", "This is CRITICAL - touching secrets"),
        ])]));

        let assessor = RiskAssessor::new(runner);
        let assessment = assessor.assess(&operation(), None).await;

        assert_eq!(assessment.risk_level, RiskLevel::Critical);
        assert!((assessment.consensus_strength - 0.25).abs() < 1e-9);
        assert!(!assessment.unanimous);
        assert_eq!(assessment.provider_votes.len(), 4);
    }

    #[tokio::test]
    async fn test_unanimous_low() {
        let runner = Arc::new(ScriptedRunner::new(vec![ScriptedRunner::all_response(&[
            ("anthropic", "Risk Level: LOW. Simple doc change."),
            ("openai", "LOW risk, trivial."),
        ])]));

        let assessor = RiskAssessor::new(runner);
        let assessment = assessor.assess(&operation(), None).await;

        assert_eq!(assessment.risk_level, RiskLevel::Low);
        assert!(assessment.unanimous);
        assert!((assessment.consensus_strength - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_runner_failure_is_critical() {
        let runner = Arc::new(ScriptedRunner::failing());
        let assessor = RiskAssessor::new(runner);
        let assessment = assessor.assess(&operation(), None).await;

        assert_eq!(assessment.risk_level, RiskLevel::Critical);
        assert!(assessment.unanimous);
        assert!(assessment.rationale.contains("Defaulting to CRITICAL"));
    }

    #[tokio::test]
    async fn test_extracts_impacts_and_rollback() {
        let text = "\
Risk Level: HIGH risk

Potential Impacts:
- Production credentials exposed
- Deployment pipeline halts

Blast Radius:
All services reading this configuration

Rollback: DIFFICULT because secrets must be rotated

Reasoning:
Secrets files gate every deployment.
";
        let runner = Arc::new(ScriptedRunner::new(vec![ScriptedRunner::all_response(&[(
            "anthropic", text,
        )])]));

        let assessor = RiskAssessor::new(runner);
        let assessment = assessor.assess(&operation(), None).await;

        assert_eq!(assessment.risk_level, RiskLevel::High);
        assert_eq!(assessment.potential_impacts.len(), 2);
        assert_eq!(assessment.rollback_complexity, "DIFFICULT");
        assert_eq!(
            assessment.blast_radius,
            "All services reading this configuration"
        );
        assert!(assessment.rationale.contains("ANTHROPIC"));
    }

    #[test]
    fn test_keyword_extraction_conservative_order() {
        assert_eq!(extract_risk_keyword("this is dangerous"), "CRITICAL");
        assert_eq!(extract_risk_keyword("HIGH risk operation"), "HIGH");
        // "high" without "risk" nearby falls through
        assert_eq!(extract_risk_keyword("medium concern"), "MEDIUM");
        assert_eq!(extract_risk_keyword("nothing to see"), "LOW");
    }

    #[test]
    fn test_empty_votes_default_critical() {
        let (level, strength, unanimous) = build_consensus(&BTreeMap::new());
        assert_eq!(level, RiskLevel::Critical);
        assert!((strength - 1.0).abs() < f64::EPSILON);
        assert!(unanimous);
    }
}
