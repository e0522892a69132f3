//! Turns approved roadmap proposals into tracked issues on the host.

use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::types::{
    CreatedIssue, FeatureProposal, IssueCreationResult, ProposalValidation, ValidatedRoadmap,
};
use crate::error::Result;
use crate::host::{Host, IssueState};

const ACTION_VERBS: &[&str] = &[
    "add", "implement", "create", "build", "improve", "optimize", "refactor", "fix", "update",
    "remove", "migrate", "integrate", "support", "enable", "introduce",
];

/// Creates host issues from validated proposals with priority, category,
/// and complexity labels.
pub struct IssueCreator {
    host: Arc<dyn Host>,
    auto_label: bool,
    add_bot_approved: bool,
}

impl IssueCreator {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self {
            host,
            auto_label: true,
            add_bot_approved: true,
        }
    }

    pub fn with_auto_label(mut self, enabled: bool) -> Self {
        self.auto_label = enabled;
        self
    }

    pub fn with_bot_approved_label(mut self, enabled: bool) -> Self {
        self.add_bot_approved = enabled;
        self
    }

    /// Create one issue per approved proposal. Failures on individual
    /// proposals are recorded without aborting the batch.
    #[instrument(skip_all, fields(approved = roadmap.approved_proposals.len()))]
    pub async fn create_from_roadmap(
        &self,
        roadmap: &ValidatedRoadmap,
        skip_existing: bool,
    ) -> Result<IssueCreationResult> {
        let mut result = IssueCreationResult::default();

        let existing_titles: Vec<String> = if skip_existing {
            self.host
                .list_issues(&[], &[], IssueState::Open)
                .await?
                .into_iter()
                .map(|issue| issue.title)
                .collect()
        } else {
            Vec::new()
        };

        for proposal in &roadmap.approved_proposals {
            let title = format_title(proposal);
            if skip_existing && existing_titles.contains(&title) {
                info!(proposal_id = %proposal.id, "issue already exists, skipping");
                result.skipped_proposals.push(proposal.id.clone());
                continue;
            }

            let validation = roadmap.validated_proposals.get(&proposal.id);
            let body = format_body(proposal, validation);
            let labels = if self.auto_label {
                determine_labels(proposal, self.add_bot_approved)
            } else {
                Vec::new()
            };

            match self
                .host
                .create_issue(&title, &body, &labels, &[])
                .await
            {
                Ok(issue) => {
                    info!(number = issue.number, proposal_id = %proposal.id, "issue created");
                    result.created_issues.push(CreatedIssue {
                        issue_number: issue.number,
                        title,
                        proposal_id: proposal.id.clone(),
                        url: issue.url,
                        labels,
                    });
                }
                Err(e) => {
                    warn!(proposal_id = %proposal.id, error = %e, "issue creation failed");
                    result.failed_proposals.push(proposal.id.clone());
                }
            }
        }

        info!(
            created = result.created_issues.len(),
            skipped = result.skipped_proposals.len(),
            failed = result.failed_proposals.len(),
            "issue creation completed"
        );
        Ok(result)
    }
}

/// Issue titles lead with an action verb; proposals without one get
/// "Implement" prefixed.
pub(crate) fn format_title(proposal: &FeatureProposal) -> String {
    let title = proposal.title.trim();
    let lower = title.to_lowercase();
    if ACTION_VERBS.iter().any(|verb| lower.starts_with(verb)) {
        title.to_string()
    } else {
        format!("Implement {title}")
    }
}

/// Markdown issue body assembled from the proposal and its validation.
pub(crate) fn format_body(
    proposal: &FeatureProposal,
    validation: Option<&ProposalValidation>,
) -> String {
    let mut body = String::new();

    body.push_str("## Description\n");
    body.push_str(&proposal.description);
    body.push('\n');

    body.push_str("\n## Rationale\n");
    body.push_str(&proposal.value_proposition);
    body.push('\n');

    if let Some(validation) = validation {
        if !validation.strengths.is_empty() {
            body.push_str("\n## Benefits\n");
            for strength in &validation.strengths {
                body.push_str(&format!("- {strength}\n"));
            }
        }
    }

    body.push_str("\n## Acceptance Criteria\n");
    if proposal.success_metrics.is_empty() {
        body.push_str(&format!("- [ ] Implement {}\n", proposal.title.to_lowercase()));
        body.push_str("- [ ] Add tests for new functionality\n");
        body.push_str("- [ ] Update documentation\n");
    } else {
        for metric in &proposal.success_metrics {
            body.push_str(&format!("- [ ] {metric}\n"));
        }
    }

    body.push_str("\n## Technical Notes\n");
    body.push_str(&format!(
        "- **Estimated complexity**: {}/10\n",
        proposal.complexity_estimate
    ));
    if let Some(effort) = &proposal.estimated_effort {
        body.push_str(&format!("- **Estimated effort**: {effort}\n"));
    }
    if let Some(category) = &proposal.category {
        body.push_str(&format!("- **Category**: {category}\n"));
    }
    if !proposal.dependencies.is_empty() {
        body.push_str(&format!(
            "- **Dependencies**: {}\n",
            proposal.dependencies.join(", ")
        ));
    }
    body.push_str(&format!(
        "- **Proposed by**: {}\n",
        proposal.provider.to_uppercase()
    ));

    if let Some(validation) = validation {
        if !validation.concerns.is_empty() || !validation.risks.is_empty() {
            body.push_str("\n## Risks & Concerns\n");
            for concern in &validation.concerns {
                body.push_str(&format!("- {concern}\n"));
            }
            for risk in &validation.risks {
                body.push_str(&format!("- {risk}\n"));
            }
        }
        if !validation.suggestions.is_empty() {
            body.push_str("\n## Implementation Suggestions\n");
            for suggestion in &validation.suggestions {
                body.push_str(&format!("- {suggestion}\n"));
            }
        }
        body.push_str(&format!(
            "\n---\n**Validation Confidence**: {:.0}%\n",
            validation.confidence * 100.0
        ));
    }

    body
}

/// Priority, category (default `enhancement`), complexity band, and the
/// optional bot-approved marker.
pub(crate) fn determine_labels(proposal: &FeatureProposal, bot_approved: bool) -> Vec<String> {
    let mut labels = vec![proposal.priority.label().to_string()];

    let category = match proposal.category.as_deref() {
        Some("performance") => "performance",
        Some("security") => "security",
        Some("reliability") => "reliability",
        Some("documentation") => "documentation",
        Some("refactor") => "refactor",
        Some("feature") => "feature",
        _ => "enhancement",
    };
    labels.push(category.to_string());

    let complexity = if proposal.complexity_estimate <= 3 {
        "complexity-simple"
    } else if proposal.complexity_estimate <= 7 {
        "complexity-medium"
    } else {
        "complexity-complex"
    };
    labels.push(complexity.to_string());

    if bot_approved {
        labels.push("bot-approved".to_string());
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycles::roadmap::types::{ProposalPriority, ValidationDecision};
    use pretty_assertions::assert_eq;

    fn proposal() -> FeatureProposal {
        FeatureProposal {
            id: "anthropic-1".to_string(),
            title: "Request tracing".to_string(),
            description: "Correlate logs across requests".to_string(),
            provider: "anthropic".to_string(),
            value_proposition: "Halve debugging time".to_string(),
            complexity_estimate: 4,
            priority: ProposalPriority::High,
            dependencies: vec!["logging".to_string()],
            success_metrics: vec!["90% trace coverage".to_string()],
            estimated_effort: Some("2 weeks".to_string()),
            category: Some("reliability".to_string()),
        }
    }

    fn validation() -> ProposalValidation {
        ProposalValidation {
            proposal_id: "anthropic-1".to_string(),
            decision: ValidationDecision::Approved,
            confidence: 0.9,
            strengths: vec!["Observability pays off".to_string()],
            concerns: vec!["Some overhead".to_string()],
            risks: vec![],
            suggestions: vec!["Start with ingest".to_string()],
        }
    }

    #[test]
    fn test_title_gets_action_verb() {
        let mut p = proposal();
        assert_eq!(format_title(&p), "Implement Request tracing");

        p.title = "Add request tracing".to_string();
        assert_eq!(format_title(&p), "Add request tracing");

        p.title = "Optimize query cache".to_string();
        assert_eq!(format_title(&p), "Optimize query cache");
    }

    #[test]
    fn test_body_sections() {
        let body = format_body(&proposal(), Some(&validation()));

        assert!(body.contains("## Description"));
        assert!(body.contains("## Rationale"));
        assert!(body.contains("## Benefits"));
        assert!(body.contains("- Observability pays off"));
        assert!(body.contains("- [ ] 90% trace coverage"));
        assert!(body.contains("**Estimated complexity**: 4/10"));
        assert!(body.contains("**Dependencies**: logging"));
        assert!(body.contains("**Proposed by**: ANTHROPIC"));
        assert!(body.contains("## Risks & Concerns"));
        assert!(body.contains("## Implementation Suggestions"));
        assert!(body.contains("**Validation Confidence**: 90%"));
    }

    #[test]
    fn test_body_without_metrics_gets_default_criteria() {
        let mut p = proposal();
        p.success_metrics.clear();
        let body = format_body(&p, None);
        assert!(body.contains("- [ ] Add tests for new functionality"));
    }

    #[test]
    fn test_labels() {
        let labels = determine_labels(&proposal(), true);
        assert_eq!(
            labels,
            vec![
                "priority-high".to_string(),
                "reliability".to_string(),
                "complexity-medium".to_string(),
                "bot-approved".to_string(),
            ]
        );

        let mut p = proposal();
        p.category = None;
        p.complexity_estimate = 9;
        let labels = determine_labels(&p, false);
        assert!(labels.contains(&"enhancement".to_string()));
        assert!(labels.contains(&"complexity-complex".to_string()));
        assert!(!labels.contains(&"bot-approved".to_string()));
    }

    #[test]
    fn test_complexity_bands() {
        let mut p = proposal();
        for (complexity, expected) in [(1, "complexity-simple"), (3, "complexity-simple"),
                                       (4, "complexity-medium"), (7, "complexity-medium"),
                                       (8, "complexity-complex"), (10, "complexity-complex")] {
            p.complexity_estimate = complexity;
            let labels = determine_labels(&p, false);
            assert!(labels.contains(&expected.to_string()), "complexity {complexity}");
        }
    }
}
