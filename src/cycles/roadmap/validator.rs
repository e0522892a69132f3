//! Dialectical validation of a synthesized roadmap: thesis, antithesis,
//! and synthesis passes producing per-proposal decisions.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{info, instrument};

use super::types::{
    DialecticalValidation, FeatureProposal, IdeationResult, ProposalValidation, RoadmapPhase,
    ValidatedRoadmap, ValidationDecision,
};
use crate::error::{Error, Result};
use crate::runner::{ProviderRunner, RunnerResponse, Strategy};

const VALIDATION_TIMEOUT: Duration = Duration::from_secs(300);

static CONFIDENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)confidence\s*[:=]\s*([0-9.]+)").expect("valid regex"));

/// Weight of the dialectical consensus in the overall confidence blend.
const DIALECTICAL_WEIGHT: f64 = 0.6;

/// Validates roadmap proposals through three deliberation phases.
pub struct RoadmapValidator {
    runner: Arc<dyn ProviderRunner>,
    timeout: Duration,
    min_confidence: f64,
}

impl RoadmapValidator {
    pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.8;

    pub fn new(runner: Arc<dyn ProviderRunner>) -> Self {
        Self {
            runner,
            timeout: VALIDATION_TIMEOUT,
            min_confidence: Self::DEFAULT_MIN_CONFIDENCE,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run thesis (ALL), antithesis (DIALECTICAL), and synthesis
    /// (DIALECTICAL); derive per-proposal decisions and refined phases.
    #[instrument(skip_all, fields(proposals = ideation.proposals.len()))]
    pub async fn validate(
        &self,
        ideation: &IdeationResult,
        project_goals: &[String],
    ) -> Result<ValidatedRoadmap> {
        let proposals = &ideation.proposals;
        let mut total_cost = 0.0;
        let mut total_tokens = 0;

        // Phase 1: thesis — independent analyses of the proposal set.
        let thesis_response = self
            .query(&self.thesis_prompt(proposals, project_goals), Strategy::All)
            .await?;
        total_cost += thesis_response.total_cost;
        total_tokens += thesis_response.total_tokens;
        let thesis = combined(&thesis_response);

        // Phase 2: antithesis — adversarial pass over the thesis.
        let antithesis_response = self
            .query(&self.antithesis_prompt(&thesis), Strategy::Dialectical)
            .await?;
        total_cost += antithesis_response.total_cost;
        total_tokens += antithesis_response.total_tokens;
        let antithesis = antithesis_response.combined_text().to_string();

        // Phase 3: synthesis — per-proposal decisions.
        let synthesis_response = self
            .query(
                &self.synthesis_prompt(proposals, &thesis, &antithesis),
                Strategy::Dialectical,
            )
            .await?;
        total_cost += synthesis_response.total_cost;
        total_tokens += synthesis_response.total_tokens;
        let synthesis = synthesis_response.combined_text().to_string();

        let validated_proposals = parse_validations(&synthesis, proposals);

        let dialectical_confidence = extract_confidence(&synthesis).unwrap_or(0.75);
        let dialectical_validation = DialecticalValidation {
            thesis,
            antithesis,
            synthesis,
            consensus_confidence: dialectical_confidence,
        };

        let mut approved_proposals = Vec::new();
        let mut rejected_proposals = Vec::new();
        let mut needs_revision = Vec::new();
        for proposal in proposals {
            let decision = validated_proposals
                .get(&proposal.id)
                .map(|v| v.decision)
                // Unvalidated proposals stay out of the approved set.
                .unwrap_or(ValidationDecision::NeedsRevision);
            match decision {
                d if d.is_approved() => approved_proposals.push(proposal.clone()),
                ValidationDecision::Rejected => rejected_proposals.push(proposal.clone()),
                _ => needs_revision.push(proposal.clone()),
            }
        }

        let refined_phases = refine_phases(
            &ideation.synthesized_roadmap.phases,
            &approved_proposals,
        );
        let overall_confidence =
            overall_confidence(&validated_proposals, dialectical_confidence);

        info!(
            approved = approved_proposals.len(),
            rejected = rejected_proposals.len(),
            needs_revision = needs_revision.len(),
            confidence = overall_confidence,
            "roadmap validation completed"
        );

        Ok(ValidatedRoadmap {
            original_roadmap: ideation.synthesized_roadmap.clone(),
            validated_proposals,
            dialectical_validation,
            approved_proposals,
            rejected_proposals,
            needs_revision,
            refined_phases,
            overall_confidence,
            total_cost,
            total_tokens,
        })
    }

    async fn query(&self, prompt: &str, strategy: Strategy) -> Result<RunnerResponse> {
        let response = self.runner.query(prompt, strategy, self.timeout).await?;
        if !response.success {
            return Err(Error::provider(
                response
                    .error
                    .unwrap_or_else(|| "runner reported failure".to_string()),
            ));
        }
        Ok(response)
    }

    fn thesis_prompt(&self, proposals: &[FeatureProposal], goals: &[String]) -> String {
        let goals_text = if goals.is_empty() {
            "None stated".to_string()
        } else {
            goals.join("; ")
        };
        format!(
            "Evaluate each roadmap proposal on alignment, feasibility, priority,\n\
             scope, dependencies, and value.\n\n\
             **Project goals:** {goals_text}\n\n\
             **Proposals:**\n{listing}\n\n\
             Give a structured assessment of every proposal.",
            listing = list_proposals(proposals),
        )
    }

    fn antithesis_prompt(&self, thesis: &str) -> String {
        format!(
            "Challenge the following assessments. Identify hidden risks,\n\
             over-optimistic feasibility estimates, missing dependencies, and\n\
             proposals that should not proceed.\n\n\
             **Initial assessments:**\n{thesis}\n",
        )
    }

    fn synthesis_prompt(
        &self,
        proposals: &[FeatureProposal],
        thesis: &str,
        antithesis: &str,
    ) -> String {
        format!(
            "Reconcile the initial assessments with the critical analysis and\n\
             issue a final decision for every proposal.\n\n\
             **Initial assessments:**\n{thesis}\n\n\
             **Critical analysis:**\n{antithesis}\n\n\
             **Proposals:**\n{listing}\n\n\
             For each proposal, format EXACTLY as:\n\n\
             Proposal: <proposal id>\n\
             Decision: <APPROVED|APPROVED_WITH_CHANGES|NEEDS_REVISION|REJECTED>\n\
             Confidence: <0-1>\n\
             Strengths:\n- <strength>\n\
             Concerns:\n- <concern>\n\
             Risks:\n- <risk>\n\
             Suggestions:\n- <suggestion>\n\n\
             Finish with an overall line:\n\
             Overall Confidence: <0-1>\n",
            listing = list_proposals(proposals),
        )
    }
}

fn list_proposals(proposals: &[FeatureProposal]) -> String {
    proposals
        .iter()
        .map(|p| {
            format!(
                "[{id}] {title} (complexity {complexity}, priority {priority}): {description}",
                id = p.id,
                title = p.title,
                complexity = p.complexity_estimate,
                priority = p.priority,
                description = p.description,
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn combined(response: &RunnerResponse) -> String {
    if let Some(summary) = &response.summary {
        return summary.clone();
    }
    response
        .responses
        .iter()
        .map(|(provider, text)| format!("**{provider}:**\n{text}"))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Decision keyword, most negative first; defaults to APPROVED in this
/// ideation path (approvals still flow through the issue-creation gate).
pub(crate) fn extract_decision(text: &str) -> ValidationDecision {
    let lower = text.to_lowercase();
    if lower.contains("reject") {
        ValidationDecision::Rejected
    } else if lower.contains("needs revision") || lower.contains("needs_revision") {
        ValidationDecision::NeedsRevision
    } else if lower.contains("approved with changes") || lower.contains("approved_with_changes") {
        ValidationDecision::ApprovedWithChanges
    } else {
        ValidationDecision::Approved
    }
}

fn extract_confidence(text: &str) -> Option<f64> {
    CONFIDENCE_RE
        .captures_iter(text)
        .filter_map(|caps| caps[1].parse::<f64>().ok())
        .map(|score| {
            if score <= 1.0 {
                score
            } else if score <= 10.0 {
                score / 10.0
            } else {
                (score / 100.0).min(1.0)
            }
        })
        .last()
}

/// Parse per-proposal validation blocks from the synthesis text.
pub(crate) fn parse_validations(
    text: &str,
    proposals: &[FeatureProposal],
) -> BTreeMap<String, ProposalValidation> {
    let known_ids: Vec<&str> = proposals.iter().map(|p| p.id.as_str()).collect();
    let mut validations = BTreeMap::new();
    let mut current: Option<ProposalValidation> = None;
    let mut section = String::new();

    for line in text.lines() {
        let trimmed = line.trim().trim_start_matches(['#', '*', ' ']);

        if let Some((key, value)) = trimmed.split_once(':') {
            let key_lower = key.trim().to_lowercase();
            let value = value.trim();

            match key_lower.as_str() {
                "proposal" => {
                    if let Some(validation) = current.take() {
                        validations.insert(validation.proposal_id.clone(), validation);
                    }
                    let id = known_ids
                        .iter()
                        .find(|id| value.contains(*id))
                        .map(|id| id.to_string());
                    current = id.map(|proposal_id| ProposalValidation {
                        proposal_id,
                        decision: ValidationDecision::Approved,
                        confidence: 0.75,
                        strengths: Vec::new(),
                        concerns: Vec::new(),
                        risks: Vec::new(),
                        suggestions: Vec::new(),
                    });
                    section.clear();
                    continue;
                }
                "decision" => {
                    if let Some(v) = current.as_mut() {
                        v.decision = extract_decision(value);
                    }
                    section.clear();
                    continue;
                }
                "confidence" => {
                    if let Some(v) = current.as_mut() {
                        if let Some(confidence) = extract_confidence(trimmed) {
                            v.confidence = confidence;
                        }
                    }
                    section.clear();
                    continue;
                }
                "strengths" | "concerns" | "risks" | "suggestions" => {
                    section = key_lower;
                    continue;
                }
                _ => {}
            }
        }

        let bullet = line.trim();
        if bullet.starts_with('-') || bullet.starts_with('*') {
            let item = bullet.trim_start_matches(['-', '*', ' ']).to_string();
            if item.is_empty() {
                continue;
            }
            if let Some(v) = current.as_mut() {
                match section.as_str() {
                    "strengths" => v.strengths.push(item),
                    "concerns" => v.concerns.push(item),
                    "risks" => v.risks.push(item),
                    "suggestions" => v.suggestions.push(item),
                    _ => {}
                }
            }
        }
    }
    if let Some(validation) = current.take() {
        validations.insert(validation.proposal_id.clone(), validation);
    }
    validations
}

/// Keep each original phase's features intersected with the approved set;
/// drop phases left empty.
pub(crate) fn refine_phases(
    original: &[RoadmapPhase],
    approved: &[FeatureProposal],
) -> Vec<RoadmapPhase> {
    let approved_ids: Vec<&str> = approved.iter().map(|p| p.id.as_str()).collect();
    original
        .iter()
        .filter_map(|phase| {
            let features: Vec<String> = phase
                .features
                .iter()
                .filter(|id| approved_ids.contains(&id.as_str()))
                .cloned()
                .collect();
            if features.is_empty() {
                None
            } else {
                Some(RoadmapPhase {
                    name: phase.name.clone(),
                    timeline: phase.timeline.clone(),
                    features,
                })
            }
        })
        .collect()
}

/// 60% dialectical consensus, 40% mean per-proposal confidence.
fn overall_confidence(
    validations: &BTreeMap<String, ProposalValidation>,
    dialectical_confidence: f64,
) -> f64 {
    if validations.is_empty() {
        return dialectical_confidence;
    }
    let mean: f64 =
        validations.values().map(|v| v.confidence).sum::<f64>() / validations.len() as f64;
    DIALECTICAL_WEIGHT * dialectical_confidence + (1.0 - DIALECTICAL_WEIGHT) * mean
}
