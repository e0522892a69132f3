//! Multi-agent ideation: parallel proposal generation, cross-critique, and
//! dialectical synthesis into a phased roadmap.

use chrono::Utc;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::types::{
    FeatureProposal, IdeationResult, ProposalCritique, ProposalPriority, RoadmapPhase,
    SynthesizedRoadmap,
};
use crate::codebase::CodebaseAnalysis;
use crate::error::{Error, Result};
use crate::runner::{ProviderRunner, RunnerResponse, Strategy};

const IDEATION_TIMEOUT: Duration = Duration::from_secs(300);

static SCORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(feasibility|value|rating|confidence)\s*[:=]\s*([0-9.]+)").expect("valid regex"));

static PHASE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^#{0,3}\s*Phase\s+\d+\s*[:-]\s*(.+)$").expect("valid regex"));

/// Generates a roadmap through three deliberation phases.
pub struct MultiAgentIdeation {
    runner: Arc<dyn ProviderRunner>,
    timeout: Duration,
}

impl MultiAgentIdeation {
    pub fn new(runner: Arc<dyn ProviderRunner>) -> Self {
        Self {
            runner,
            timeout: IDEATION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run parallel ideation, cross-critique, and dialectical synthesis.
    #[instrument(skip_all)]
    pub async fn generate(
        &self,
        analysis: &CodebaseAnalysis,
        project_goals: &[String],
    ) -> Result<IdeationResult> {
        let mut total_cost = 0.0;
        let mut total_tokens = 0;

        // Phase 1: parallel ideation, one set of proposals per provider.
        let response = self
            .query(&self.ideation_prompt(analysis, project_goals), Strategy::All)
            .await?;
        total_cost += response.total_cost;
        total_tokens += response.total_tokens;

        let mut proposals = Vec::new();
        for (provider, text) in &response.responses {
            let parsed = parse_proposals(provider, text);
            if parsed.is_empty() {
                warn!(provider, "provider produced no parseable proposals");
            }
            proposals.extend(parsed);
        }
        if proposals.is_empty() {
            return Err(Error::ValidationFailed(
                "ideation produced no proposals".to_string(),
            ));
        }
        info!(proposals = proposals.len(), "parallel ideation complete");

        // Phase 2: cross-critique of every proposal.
        let response = self
            .query(&self.critique_prompt(&proposals), Strategy::All)
            .await?;
        total_cost += response.total_cost;
        total_tokens += response.total_tokens;

        let mut critiques: BTreeMap<String, ProposalCritique> = BTreeMap::new();
        for (provider, text) in &response.responses {
            merge_critiques(&mut critiques, parse_critiques(provider, text, &proposals));
        }
        info!(critiques = critiques.len(), "cross-critique complete");

        // Phase 3: dialectical synthesis into phases.
        let response = self
            .query(
                &self.synthesis_prompt(&proposals, &critiques),
                Strategy::Dialectical,
            )
            .await?;
        total_cost += response.total_cost;
        total_tokens += response.total_tokens;

        let synthesized_roadmap = parse_synthesis(&response, &proposals);
        info!(
            phases = synthesized_roadmap.phases.len(),
            selected = synthesized_roadmap.selected_proposals,
            "dialectical synthesis complete"
        );

        Ok(IdeationResult {
            proposals,
            critiques,
            synthesized_roadmap,
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

    fn ideation_prompt(&self, analysis: &CodebaseAnalysis, goals: &[String]) -> String {
        let goals_text = if goals.is_empty() {
            "No explicit goals provided; infer from the codebase.".to_string()
        } else {
            goals
                .iter()
                .map(|g| format!("- {g}"))
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            "Propose features for this project from your specialized perspective.\n\n\
             **Codebase Overview:**\n{summary}\n\
             **Project Goals:**\n{goals_text}\n\n\
             Generate 5-8 feature proposals. Format each EXACTLY as:\n\n\
             Proposal: <short title>\n\
             Description: <what to build and why>\n\
             Value: <value proposition>\n\
             Complexity: <1-10>\n\
             Priority: <critical|high|medium|low>\n\
             Dependencies: <comma-separated, or none>\n\
             Metrics: <semicolon-separated success metrics>\n\
             Effort: <estimate, e.g. 2-3 weeks>\n\
             Category: <performance|security|reliability|feature|refactor|documentation>\n",
            summary = analysis.render_summary(),
        )
    }

    fn critique_prompt(&self, proposals: &[FeatureProposal]) -> String {
        let listing = proposals
            .iter()
            .map(|p| {
                format!(
                    "[{id}] {title} (from {provider}, complexity {complexity}, priority {priority})\n{description}\n",
                    id = p.id,
                    title = p.title,
                    provider = p.provider,
                    complexity = p.complexity_estimate,
                    priority = p.priority,
                    description = p.description,
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "Critique every proposal below, including those from other providers.\n\n\
             {listing}\n\
             For each proposal, format EXACTLY as:\n\n\
             Critique: <proposal id>\n\
             Strengths:\n- <strength>\n\
             Weaknesses:\n- <weakness>\n\
             Feasibility: <0-1>\n\
             Value: <0-1>\n\
             Overlaps: <comma-separated proposal ids, or none>\n\
             Conflicts: <comma-separated proposal ids, or none>\n\
             Suggestions:\n- <suggestion>\n\
             Rating: <1-10>\n",
        )
    }

    fn synthesis_prompt(
        &self,
        proposals: &[FeatureProposal],
        critiques: &BTreeMap<String, ProposalCritique>,
    ) -> String {
        let listing = proposals
            .iter()
            .map(|p| {
                let critique = critiques.get(&p.id);
                format!(
                    "[{id}] {title}: feasibility {feasibility:.2}, value {value:.2}",
                    id = p.id,
                    title = p.title,
                    feasibility = critique.map(|c| c.feasibility_score).unwrap_or(0.0),
                    value = critique.map(|c| c.value_score).unwrap_or(0.0),
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "Synthesize the critiqued proposals into a phased roadmap using\n\
             thesis, antithesis, and synthesis.\n\n\
             **Proposals and scores:**\n{listing}\n\n\
             Produce 3-4 phases. Format each EXACTLY as:\n\n\
             Phase 1: <name>\n\
             Timeline: <e.g. weeks 1-4>\n\
             Features: <comma-separated proposal ids>\n\n\
             Finish with:\n\
             Confidence: <0-1>\n\
             Notes: <one-paragraph synthesis rationale>\n",
        )
    }
}

/// Parse `Proposal:`-marked blocks from one provider's response.
pub(crate) fn parse_proposals(provider: &str, text: &str) -> Vec<FeatureProposal> {
    let mut proposals = Vec::new();
    let mut current: Option<FeatureProposal> = None;
    let mut counter = 0;

    for line in text.lines() {
        let trimmed = line.trim().trim_start_matches(['#', '*', ' ']);
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim().to_lowercase().as_str() {
            "proposal" => {
                if let Some(proposal) = current.take() {
                    proposals.push(proposal);
                }
                counter += 1;
                current = Some(FeatureProposal {
                    id: format!("{provider}-{counter}"),
                    title: value.to_string(),
                    description: String::new(),
                    provider: provider.to_string(),
                    value_proposition: String::new(),
                    complexity_estimate: 5,
                    priority: ProposalPriority::Medium,
                    dependencies: Vec::new(),
                    success_metrics: Vec::new(),
                    estimated_effort: None,
                    category: None,
                });
            }
            "description" => {
                if let Some(p) = current.as_mut() {
                    p.description = value.to_string();
                }
            }
            "value" => {
                if let Some(p) = current.as_mut() {
                    p.value_proposition = value.to_string();
                }
            }
            "complexity" => {
                if let Some(p) = current.as_mut() {
                    if let Ok(n) = value
                        .split(|c: char| !c.is_ascii_digit())
                        .find(|s| !s.is_empty())
                        .unwrap_or("")
                        .parse::<u32>()
                    {
                        p.complexity_estimate = n.clamp(1, 10);
                    }
                }
            }
            "priority" => {
                if let Some(p) = current.as_mut() {
                    p.priority = ProposalPriority::parse_lenient(value);
                }
            }
            "dependencies" => {
                if let Some(p) = current.as_mut() {
                    p.dependencies = split_list(value, ',');
                }
            }
            "metrics" => {
                if let Some(p) = current.as_mut() {
                    p.success_metrics = split_list(value, ';');
                }
            }
            "effort" => {
                if let Some(p) = current.as_mut() {
                    if !value.is_empty() {
                        p.estimated_effort = Some(value.to_string());
                    }
                }
            }
            "category" => {
                if let Some(p) = current.as_mut() {
                    if !value.is_empty() {
                        p.category = Some(value.to_lowercase());
                    }
                }
            }
            _ => {}
        }
    }
    if let Some(proposal) = current.take() {
        proposals.push(proposal);
    }

    // Drop placeholder blocks with no substance.
    proposals.retain(|p| !p.title.is_empty());
    proposals
}

fn split_list(value: &str, separator: char) -> Vec<String> {
    value
        .split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("none"))
        .map(str::to_string)
        .collect()
}

/// Parse `Critique:`-marked blocks from one provider's response.
pub(crate) fn parse_critiques(
    provider: &str,
    text: &str,
    proposals: &[FeatureProposal],
) -> Vec<ProposalCritique> {
    let known_ids: Vec<&str> = proposals.iter().map(|p| p.id.as_str()).collect();
    let mut critiques = Vec::new();
    let mut current: Option<ProposalCritique> = None;
    let mut section = String::new();

    for line in text.lines() {
        let trimmed = line.trim().trim_start_matches(['#', '*', ' ']);

        if let Some((key, value)) = trimmed.split_once(':') {
            let key_lower = key.trim().to_lowercase();
            let value = value.trim();

            match key_lower.as_str() {
                "critique" => {
                    if let Some(critique) = current.take() {
                        critiques.push(critique);
                    }
                    let id = known_ids
                        .iter()
                        .find(|id| value.contains(*id))
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| value.to_string());
                    current = Some(ProposalCritique {
                        proposal_id: id,
                        ..Default::default()
                    });
                    section.clear();
                    continue;
                }
                "strengths" | "weaknesses" | "suggestions" => {
                    section = key_lower;
                    continue;
                }
                "feasibility" => {
                    if let Some(c) = current.as_mut() {
                        c.feasibility_score = parse_unit_score(value);
                    }
                    section.clear();
                    continue;
                }
                "value" => {
                    if let Some(c) = current.as_mut() {
                        c.value_score = parse_unit_score(value);
                    }
                    section.clear();
                    continue;
                }
                "overlaps" => {
                    if let Some(c) = current.as_mut() {
                        c.overlaps_with = split_list(value, ',');
                    }
                    section.clear();
                    continue;
                }
                "conflicts" => {
                    if let Some(c) = current.as_mut() {
                        c.conflicts_with = split_list(value, ',');
                    }
                    section.clear();
                    continue;
                }
                "rating" => {
                    if let Some(c) = current.as_mut() {
                        if let Ok(rating) = value
                            .split(|ch: char| !ch.is_ascii_digit())
                            .find(|s| !s.is_empty())
                            .unwrap_or("")
                            .parse::<u32>()
                        {
                            c.provider_ratings
                                .insert(provider.to_string(), rating.clamp(1, 10));
                        }
                    }
                    section.clear();
                    continue;
                }
                _ => {}
            }
        }

        // Bulleted content under the active section.
        let bullet = line.trim();
        if bullet.starts_with('-') || bullet.starts_with('*') {
            let item = bullet.trim_start_matches(['-', '*', ' ']).to_string();
            if item.is_empty() {
                continue;
            }
            if let Some(c) = current.as_mut() {
                match section.as_str() {
                    "strengths" => c.strengths.push(item),
                    "weaknesses" => c.weaknesses.push(item),
                    "suggestions" => c.suggestions.push(item),
                    _ => {}
                }
            }
        }
    }
    if let Some(critique) = current.take() {
        critiques.push(critique);
    }
    critiques
}

/// Normalize a score to [0, 1]: values over 1 are treated as /10 or /100.
fn parse_unit_score(value: &str) -> f64 {
    let Some(number) = value
        .split_whitespace()
        .next()
        .and_then(|s| s.trim_end_matches(['.', ',']).parse::<f64>().ok())
    else {
        return 0.0;
    };
    if number <= 1.0 {
        number.max(0.0)
    } else if number <= 10.0 {
        number / 10.0
    } else if number <= 100.0 {
        number / 100.0
    } else {
        1.0
    }
}

fn merge_critiques(
    merged: &mut BTreeMap<String, ProposalCritique>,
    parsed: Vec<ProposalCritique>,
) {
    for critique in parsed {
        match merged.get_mut(&critique.proposal_id) {
            None => {
                merged.insert(critique.proposal_id.clone(), critique);
            }
            Some(existing) => {
                for strength in critique.strengths {
                    if !existing.strengths.contains(&strength) {
                        existing.strengths.push(strength);
                    }
                }
                for weakness in critique.weaknesses {
                    if !existing.weaknesses.contains(&weakness) {
                        existing.weaknesses.push(weakness);
                    }
                }
                for suggestion in critique.suggestions {
                    if !existing.suggestions.contains(&suggestion) {
                        existing.suggestions.push(suggestion);
                    }
                }
                // Averaged across providers that scored the proposal.
                if critique.feasibility_score > 0.0 {
                    existing.feasibility_score = if existing.feasibility_score > 0.0 {
                        (existing.feasibility_score + critique.feasibility_score) / 2.0
                    } else {
                        critique.feasibility_score
                    };
                }
                if critique.value_score > 0.0 {
                    existing.value_score = if existing.value_score > 0.0 {
                        (existing.value_score + critique.value_score) / 2.0
                    } else {
                        critique.value_score
                    };
                }
                existing.provider_ratings.extend(critique.provider_ratings);
            }
        }
    }
}

/// Parse the dialectical synthesis into phases, confidence, and notes.
pub(crate) fn parse_synthesis(
    response: &RunnerResponse,
    proposals: &[FeatureProposal],
) -> SynthesizedRoadmap {
    let text = response.combined_text();
    let known_ids: Vec<&str> = proposals.iter().map(|p| p.id.as_str()).collect();

    let mut phases = Vec::new();
    let mut current: Option<RoadmapPhase> = None;
    let mut notes = String::new();

    for line in text.lines() {
        if let Some(caps) = PHASE_RE.captures(line) {
            if let Some(phase) = current.take() {
                phases.push(phase);
            }
            current = Some(RoadmapPhase {
                name: caps[1].trim().to_string(),
                timeline: String::new(),
                features: Vec::new(),
            });
            continue;
        }

        let trimmed = line.trim().trim_start_matches(['#', '*', ' ']);
        if let Some((key, value)) = trimmed.split_once(':') {
            match key.trim().to_lowercase().as_str() {
                "timeline" => {
                    if let Some(phase) = current.as_mut() {
                        phase.timeline = value.trim().to_string();
                    }
                }
                "features" => {
                    if let Some(phase) = current.as_mut() {
                        phase.features = known_ids
                            .iter()
                            .filter(|id| value.contains(*id))
                            .map(|id| id.to_string())
                            .collect();
                    }
                }
                "notes" => {
                    notes = value.trim().to_string();
                }
                _ => {}
            }
        }
    }
    if let Some(phase) = current.take() {
        phases.push(phase);
    }

    let confidence = SCORE_RE
        .captures_iter(text)
        .filter(|caps| caps[1].eq_ignore_ascii_case("confidence"))
        .filter_map(|caps| caps[2].parse::<f64>().ok())
        .map(|score| {
            if score <= 1.0 {
                score
            } else if score <= 10.0 {
                score / 10.0
            } else {
                score / 100.0
            }
        })
        .last()
        .unwrap_or(0.75);

    let selected: usize = {
        let mut ids: Vec<&String> = phases.iter().flat_map(|p| p.features.iter()).collect();
        ids.sort();
        ids.dedup();
        ids.len()
    };

    SynthesizedRoadmap {
        phases,
        consensus_confidence: confidence.clamp(0.0, 1.0),
        total_proposals_considered: proposals.len(),
        selected_proposals: selected,
        provider_perspectives: response
            .responses
            .keys()
            .map(|provider| (provider.clone(), String::new()))
            .collect(),
        synthesis_notes: notes,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codebase::CodebaseAnalyzer;
    use crate::runner::subprocess::testing::ScriptedRunner;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const PROPOSAL_TEXT: &str = "\
Proposal: Add request tracing
Description: Correlate logs across the request path
Value: Cuts debugging time materially
Complexity: 4
Priority: high
Dependencies: none
Metrics: trace coverage above 90%; debug time halved
Effort: 2 weeks
Category: reliability

Proposal: Cache hot queries
Description: Introduce a read-through cache for the hottest queries
Value: Lower latency
Complexity: 6
Priority: medium
Dependencies: Add request tracing
Metrics: p95 latency under 100ms
Effort: 3 weeks
Category: performance
";

    #[test]
    fn test_parse_proposals() {
        let proposals = parse_proposals("anthropic", PROPOSAL_TEXT);
        assert_eq!(proposals.len(), 2);

        let first = &proposals[0];
        assert_eq!(first.id, "anthropic-1");
        assert_eq!(first.title, "Add request tracing");
        assert_eq!(first.priority, ProposalPriority::High);
        assert_eq!(first.complexity_estimate, 4);
        assert!(first.dependencies.is_empty());
        assert_eq!(first.success_metrics.len(), 2);
        assert_eq!(first.category.as_deref(), Some("reliability"));

        let second = &proposals[1];
        assert_eq!(second.dependencies, vec!["Add request tracing".to_string()]);
    }

    #[test]
    fn test_parse_critiques_and_merge() {
        let proposals = parse_proposals("anthropic", PROPOSAL_TEXT);
        let critique_text = "\
Critique: anthropic-1
Strengths:
- Observability pays for itself
Weaknesses:
- Adds runtime overhead
Feasibility: 0.9
Value: 8
Overlaps: none
Conflicts: none
Suggestions:
- Start with the ingest path
Rating: 8
";
        let critiques = parse_critiques("openai", critique_text, &proposals);
        assert_eq!(critiques.len(), 1);
        let critique = &critiques[0];
        assert_eq!(critique.proposal_id, "anthropic-1");
        assert_eq!(critique.strengths.len(), 1);
        assert!((critique.feasibility_score - 0.9).abs() < 1e-9);
        // 8 normalized from /10
        assert!((critique.value_score - 0.8).abs() < 1e-9);
        assert_eq!(critique.provider_ratings["openai"], 8);

        // Merge from a second provider averages scores.
        let mut merged = BTreeMap::new();
        merge_critiques(&mut merged, critiques);
        let second = parse_critiques(
            "deepseek",
            "Critique: anthropic-1\nFeasibility: 0.7\nValue: 0.6\nRating: 6\n",
            &proposals,
        );
        merge_critiques(&mut merged, second);

        let critique = &merged["anthropic-1"];
        assert!((critique.feasibility_score - 0.8).abs() < 1e-9);
        assert_eq!(critique.provider_ratings.len(), 2);
    }

    #[test]
    fn test_parse_synthesis() {
        let proposals = parse_proposals("anthropic", PROPOSAL_TEXT);
        let response = ScriptedRunner::dialectical_response(
            "THESIS\nBoth matter.\nANTITHESIS\nCapacity is limited.\nSYNTHESIS\n\
             Phase 1: Foundations\nTimeline: weeks 1-4\nFeatures: anthropic-1\n\
             Phase 2: Performance\nTimeline: weeks 5-8\nFeatures: anthropic-2\n\
             Confidence: 0.85\nNotes: Tracing first, cache second.\n",
        );

        let roadmap = parse_synthesis(&response, &proposals);
        assert_eq!(roadmap.phases.len(), 2);
        assert_eq!(roadmap.phases[0].name, "Foundations");
        assert_eq!(roadmap.phases[0].features, vec!["anthropic-1".to_string()]);
        assert_eq!(roadmap.phases[1].timeline, "weeks 5-8");
        assert!((roadmap.consensus_confidence - 0.85).abs() < 1e-9);
        assert_eq!(roadmap.selected_proposals, 2);
        assert_eq!(roadmap.synthesis_notes, "Tracing first, cache second.");
    }

    #[tokio::test]
    async fn test_three_phase_generation() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("main.rs"), "fn main() {}\n").unwrap();
        let analysis = CodebaseAnalyzer::new(dir.path()).analyze().unwrap();

        let runner = Arc::new(ScriptedRunner::new(vec![
            ScriptedRunner::all_response(&[("anthropic", PROPOSAL_TEXT)]),
            ScriptedRunner::all_response(&[(
                "openai",
                "Critique: anthropic-1\nFeasibility: 0.9\nValue: 0.9\nRating: 9\n\
                 Critique: anthropic-2\nFeasibility: 0.6\nValue: 0.7\nRating: 6\n",
            )]),
            ScriptedRunner::dialectical_response(
                "Phase 1: Foundations\nTimeline: weeks 1-4\nFeatures: anthropic-1, anthropic-2\n\
                 Confidence: 0.8\nNotes: ship it\n",
            ),
        ]));

        let ideation = MultiAgentIdeation::new(runner);
        let result = ideation.generate(&analysis, &[]).await.unwrap();

        assert_eq!(result.proposals.len(), 2);
        assert_eq!(result.critiques.len(), 2);
        assert_eq!(result.synthesized_roadmap.phases.len(), 1);
        assert!(result.total_cost > 0.0);
    }

    #[tokio::test]
    async fn test_no_proposals_is_validation_failure() {
        let dir = TempDir::new().unwrap();
        let analysis = CodebaseAnalyzer::new(dir.path()).analyze().unwrap();

        let runner = Arc::new(ScriptedRunner::new(vec![ScriptedRunner::all_response(&[(
            "anthropic",
            "I have no ideas today.",
        )])]));

        let ideation = MultiAgentIdeation::new(runner);
        let result = ideation.generate(&analysis, &[]).await;
        assert!(matches!(result, Err(Error::ValidationFailed(_))));
    }
}
