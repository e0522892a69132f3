//! End-to-end roadmap cycle: codebase analysis → multi-agent insights →
//! ideation → dialectical validation → issue creation, recorded in the
//! ledger.

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::ideation::MultiAgentIdeation;
use super::issues::IssueCreator;
use super::types::{IssueCreationResult, RoadmapCycleReport, ValidatedRoadmap};
use super::validator::RoadmapValidator;
use crate::codebase::{CodebaseAnalysis, CodebaseAnalyzer};
use crate::error::{Error, Result};
use crate::host::Host;
use crate::ledger::{Ledger, OperationFact, OperationKind, RoadmapFact};
use crate::runner::{ProviderRunner, Strategy};

const INSIGHTS_TIMEOUT: Duration = Duration::from_secs(240);

static RATING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(architecture|quality)\s*(?:rating)?\s*[:=]\s*([0-9.]+)")
        .expect("valid regex")
});

/// Multi-agent reading of the codebase that seeds ideation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodebaseInsights {
    /// Provider → free-form insight text
    pub provider_insights: BTreeMap<String, String>,
    /// 0-10
    pub architecture_rating: Option<f64>,
    /// 0-10
    pub quality_rating: Option<f64>,
    pub top_priorities: Vec<String>,
}

/// Drives one full roadmap iteration.
pub struct RoadmapCycle {
    ledger: Arc<Ledger>,
    runner: Arc<dyn ProviderRunner>,
    analyzer: CodebaseAnalyzer,
    ideation: MultiAgentIdeation,
    validator: RoadmapValidator,
    issue_creator: IssueCreator,
    auto_create_issues: bool,
}

impl RoadmapCycle {
    pub fn new(
        ledger: Arc<Ledger>,
        runner: Arc<dyn ProviderRunner>,
        host: Arc<dyn Host>,
        repository_path: impl AsRef<std::path::Path>,
    ) -> Self {
        Self {
            ledger,
            analyzer: CodebaseAnalyzer::new(repository_path),
            ideation: MultiAgentIdeation::new(Arc::clone(&runner)),
            validator: RoadmapValidator::new(Arc::clone(&runner)),
            issue_creator: IssueCreator::new(host),
            runner,
            auto_create_issues: true,
        }
    }

    pub fn with_auto_create_issues(mut self, enabled: bool) -> Self {
        self.auto_create_issues = enabled;
        self
    }

    pub fn with_validator(mut self, validator: RoadmapValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Execute one complete roadmap cycle.
    #[instrument(skip(self, project_goals))]
    pub async fn run(&self, project_goals: &[String]) -> Result<RoadmapCycleReport> {
        let cycle_id = format!(
            "roadmap-cycle-{}",
            Utc::now().format("%Y%m%d-%H%M%S")
        );
        let started_at = Utc::now();

        let op_id = self.ledger.start_operation(
            OperationKind::RoadmapCycle,
            Some(&cycle_id),
            None,
        )?;

        match self.run_inner(project_goals).await {
            Ok((validated, issue_creation, total_cost, total_tokens)) => {
                let report = RoadmapCycleReport {
                    cycle_id,
                    started_at,
                    completed_at: Utc::now(),
                    proposals_generated: validated.original_roadmap.total_proposals_considered,
                    proposals_validated: validated.validated_proposals.len(),
                    proposals_approved: validated.approved_proposals.len(),
                    proposals_rejected: validated.rejected_proposals.len(),
                    issues_created: issue_creation.total_created(),
                    total_cost,
                    total_tokens,
                };

                self.ledger.attach_fact(
                    op_id,
                    &OperationFact::Roadmap(RoadmapFact {
                        proposals_generated: report.proposals_generated as u32,
                        proposals_validated: report.proposals_validated as u32,
                        proposals_approved: report.proposals_approved as u32,
                        issues_created: report.issues_created as u32,
                        issues_implemented: 0,
                        average_proposal_quality: Some(validated.overall_confidence),
                    }),
                )?;
                self.ledger.complete_operation(op_id, true, None, None, 0)?;

                info!(
                    cycle_id = %report.cycle_id,
                    approved = report.proposals_approved,
                    issues = report.issues_created,
                    cost = report.total_cost,
                    "roadmap cycle completed"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "roadmap cycle failed");
                self.ledger.complete_operation(
                    op_id,
                    false,
                    Some(&e.to_string()),
                    Some(e.kind()),
                    0,
                )?;
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        project_goals: &[String],
    ) -> Result<(ValidatedRoadmap, IssueCreationResult, f64, u64)> {
        // Step 1: static codebase analysis.
        let analysis = self.analyzer.analyze()?;

        // Step 2: multi-agent insights over the analysis.
        let insights = self.codebase_insights(&analysis).await?;
        info!(
            providers = insights.provider_insights.len(),
            architecture = ?insights.architecture_rating,
            "codebase insights gathered"
        );

        // Step 3: three-phase ideation.
        let ideation = self.ideation.generate(&analysis, project_goals).await?;

        // Step 4: three-phase dialectical validation.
        let validated = self.validator.validate(&ideation, project_goals).await?;

        // Step 5/6: refined phases are part of the validated roadmap; turn
        // approved proposals into tracked issues.
        let issue_creation = if self.auto_create_issues {
            self.issue_creator
                .create_from_roadmap(&validated, true)
                .await?
        } else {
            IssueCreationResult::default()
        };

        let total_cost = ideation.total_cost + validated.total_cost;
        let total_tokens = ideation.total_tokens + validated.total_tokens;
        Ok((validated, issue_creation, total_cost, total_tokens))
    }

    /// One ALL-strategy pass asking every provider to read the codebase
    /// summary and rate it.
    async fn codebase_insights(&self, analysis: &CodebaseAnalysis) -> Result<CodebaseInsights> {
        let prompt = format!(
            "Review this codebase summary from your specialized perspective.\n\n\
             {summary}\n\
             Provide:\n\
             - Architecture rating: <0-10>\n\
             - Quality rating: <0-10>\n\
             - Priorities:\n- <top priority>\n- <next priority>\n",
            summary = analysis.render_summary(),
        );

        let response = self
            .runner
            .query(&prompt, Strategy::All, INSIGHTS_TIMEOUT)
            .await?;
        if !response.success {
            return Err(Error::provider(
                response
                    .error
                    .unwrap_or_else(|| "runner reported failure".to_string()),
            ));
        }

        let mut insights = CodebaseInsights {
            provider_insights: response.responses.clone(),
            ..Default::default()
        };

        let mut architecture = Vec::new();
        let mut quality = Vec::new();
        for text in response.responses.values() {
            for caps in RATING_RE.captures_iter(text) {
                if let Ok(score) = caps[2].parse::<f64>() {
                    let score = score.clamp(0.0, 10.0);
                    if caps[1].eq_ignore_ascii_case("architecture") {
                        architecture.push(score);
                    } else {
                        quality.push(score);
                    }
                }
            }
            let mut in_priorities = false;
            for line in text.lines() {
                let trimmed = line.trim();
                if trimmed.to_lowercase().starts_with("priorities") {
                    in_priorities = true;
                    continue;
                }
                if in_priorities {
                    if trimmed.starts_with('-') || trimmed.starts_with('*') {
                        let item = trimmed.trim_start_matches(['-', '*', ' ']).to_string();
                        if !item.is_empty() && !insights.top_priorities.contains(&item) {
                            insights.top_priorities.push(item);
                        }
                    } else if !trimmed.is_empty() {
                        in_priorities = false;
                    }
                }
            }
        }

        let mean = |scores: &[f64]| {
            if scores.is_empty() {
                None
            } else {
                Some(scores.iter().sum::<f64>() / scores.len() as f64)
            }
        };
        insights.architecture_rating = mean(&architecture);
        insights.quality_rating = mean(&quality);
        Ok(insights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::RecordingHost;
    use crate::runner::subprocess::testing::ScriptedRunner;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const PROPOSAL_TEXT: &str = "\
Proposal: Add request tracing
Description: Correlate logs across the request path
Value: Debugging speedup
Complexity: 4
Priority: high
Metrics: coverage above 90%
Category: reliability

Proposal: Rewrite everything in assembly
Description: Questionable performance play
Value: Marginal
Complexity: 10
Priority: low
Category: performance
";

    fn scripted_runner() -> Arc<ScriptedRunner> {
        Arc::new(ScriptedRunner::new(vec![
            // Step 2: codebase insights
            ScriptedRunner::all_response(&[(
                "anthropic",
                "Architecture rating: 7\nQuality rating: 6\nPriorities:\n- Add observability\n",
            )]),
            // Ideation phase 1
            ScriptedRunner::all_response(&[("anthropic", PROPOSAL_TEXT)]),
            // Ideation phase 2: critiques
            ScriptedRunner::all_response(&[(
                "openai",
                "Critique: anthropic-1\nFeasibility: 0.9\nValue: 0.9\nRating: 9\n\
                 Critique: anthropic-2\nFeasibility: 0.2\nValue: 0.2\nRating: 2\n",
            )]),
            // Ideation phase 3: synthesis
            ScriptedRunner::dialectical_response(
                "Phase 1: Foundations\nTimeline: weeks 1-4\nFeatures: anthropic-1, anthropic-2\n\
                 Confidence: 0.8\nNotes: tracing first\n",
            ),
            // Validation thesis
            ScriptedRunner::all_response(&[("anthropic", "Tracing strong; rewrite weak.")]),
            // Validation antithesis
            ScriptedRunner::dialectical_response("The rewrite is indefensible."),
            // Validation synthesis
            ScriptedRunner::dialectical_response(
                "Proposal: anthropic-1\nDecision: APPROVED\nConfidence: 0.9\n\
                 Strengths:\n- Clear payoff\n\n\
                 Proposal: anthropic-2\nDecision: REJECTED\nConfidence: 0.9\n\
                 Risks:\n- Unmaintainable\n\n\
                 Overall Confidence: 0.85\n",
            ),
        ]))
    }

    fn repo_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("main.rs"), "fn main() {}\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_full_cycle_creates_issues_for_approved_only() {
        let dir = repo_dir();
        let ledger = Arc::new(Ledger::in_memory().unwrap());
        let host = Arc::new(RecordingHost::new());

        let cycle = RoadmapCycle::new(
            Arc::clone(&ledger),
            scripted_runner(),
            Arc::clone(&host) as Arc<dyn Host>,
            dir.path(),
        );

        let report = cycle.run(&[]).await.unwrap();

        assert_eq!(report.proposals_generated, 2);
        assert_eq!(report.proposals_validated, 2);
        assert_eq!(report.proposals_approved, 1);
        assert_eq!(report.proposals_rejected, 1);
        assert_eq!(report.issues_created, 1);
        assert!(report.total_cost > 0.0);

        // The approved proposal became a labeled issue.
        let issues = host.issues.lock().unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].title, "Add request tracing");
        assert!(issues[0].labels.contains(&"priority-high".to_string()));
        assert!(issues[0].labels.contains(&"bot-approved".to_string()));

        // The cycle recorded a roadmap fact against its operation.
        let (_, roadmap_rows) = ledger
            .table_stats()
            .unwrap()
            .into_iter()
            .find(|(table, _)| table == "roadmap_tracking")
            .unwrap();
        assert_eq!(roadmap_rows, 1);
    }

    #[tokio::test]
    async fn test_existing_issue_skipped() {
        let dir = repo_dir();
        let ledger = Arc::new(Ledger::in_memory().unwrap());
        let host =
            Arc::new(RecordingHost::new().with_existing_issue(9, "Add request tracing"));

        let cycle = RoadmapCycle::new(
            Arc::clone(&ledger),
            scripted_runner(),
            Arc::clone(&host) as Arc<dyn Host>,
            dir.path(),
        );

        let report = cycle.run(&[]).await.unwrap();
        assert_eq!(report.issues_created, 0);
        assert_eq!(host.issues.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_cycle_recorded_in_ledger() {
        let dir = repo_dir();
        let ledger = Arc::new(Ledger::in_memory().unwrap());
        let host = Arc::new(RecordingHost::new());

        let cycle = RoadmapCycle::new(
            Arc::clone(&ledger),
            Arc::new(ScriptedRunner::failing()),
            host as Arc<dyn Host>,
            dir.path(),
        );

        let result = cycle.run(&[]).await;
        assert!(result.is_err());

        // Exactly one completed, failed roadmap operation.
        let failures = ledger
            .failed_operations_since(Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, OperationKind::RoadmapCycle);
    }
}
