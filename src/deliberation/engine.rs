//! Multi-agent deliberation over failure patterns.
//!
//! Four operations, each a distinct prompt shape directed at the provider
//! runner: root cause analysis (ALL), lesson synthesis (DIALECTICAL),
//! improvement generation (ALL), effectiveness validation (DIALECTICAL).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use super::parsing;
use super::types::{
    EffectivenessValidation, ImprovementRecommendations, LearningLesson, RootCauseAnalysis,
};
use crate::error::{Error, Result};
use crate::patterns::FailurePattern;
use crate::runner::{ProviderRunner, RunnerResponse, Strategy};

const ROOT_CAUSE_EXAMPLES: usize = 5;
const SUCCESS_CONTRAST_EXAMPLES: usize = 3;

/// Drives the learning deliberations through the provider runner.
pub struct DeliberationEngine {
    runner: Arc<dyn ProviderRunner>,
    timeout: Duration,
}

impl DeliberationEngine {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(240);

    pub fn new(runner: Arc<dyn ProviderRunner>) -> Self {
        Self {
            runner,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Multi-perspective root cause analysis of a failure pattern.
    #[instrument(skip(self, pattern), fields(pattern_id = %pattern.pattern_id))]
    pub async fn analyze_root_cause(&self, pattern: &FailurePattern) -> Result<RootCauseAnalysis> {
        let prompt = self.root_cause_prompt(pattern);
        let response = self.query_ok(&prompt, Strategy::All).await?;

        let analyses: BTreeMap<String, String> = response.responses.clone();
        let confidence = parsing::consensus_confidence(analyses.len());

        let analysis = RootCauseAnalysis {
            pattern_id: pattern.pattern_id.clone(),
            analyses,
            consensus: response.summary.clone(),
            confidence,
            cost: response.total_cost,
            tokens_used: response.total_tokens,
        };

        info!(
            confidence,
            cost = analysis.cost,
            providers = analysis.analyses.len(),
            "root cause analysis completed"
        );
        Ok(analysis)
    }

    /// Synthesize a lesson through the dialectical process.
    #[instrument(skip(self, pattern, root_cause), fields(pattern_id = %pattern.pattern_id))]
    pub async fn synthesize_learning(
        &self,
        pattern: &FailurePattern,
        root_cause: &RootCauseAnalysis,
    ) -> Result<LearningLesson> {
        let prompt = self.lesson_prompt(pattern, root_cause);
        let response = self.query_ok(&prompt, Strategy::Dialectical).await?;

        let content = response.combined_text();
        let thesis = parsing::extract_section(content, "THESIS", Some("ANTITHESIS"));
        let antithesis = parsing::extract_section(content, "ANTITHESIS", Some("SYNTHESIS"));
        let synthesis = parsing::extract_section(content, "SYNTHESIS", None);
        let actionable_items = parsing::extract_actionable_items(&synthesis);
        let confidence = parsing::consensus_confidence(response.responses.len());

        let lesson = LearningLesson {
            pattern_id: pattern.pattern_id.clone(),
            thesis,
            antithesis,
            synthesis,
            actionable_items,
            confidence,
            cost: response.total_cost,
            tokens_used: response.total_tokens,
        };

        info!(
            actionable_items = lesson.actionable_items.len(),
            cost = lesson.cost,
            "learning synthesis completed"
        );
        Ok(lesson)
    }

    /// Generate concrete improvements from a lesson.
    #[instrument(skip_all, fields(pattern_id = %pattern.pattern_id))]
    pub async fn generate_improvements(
        &self,
        pattern: &FailurePattern,
        lesson: &LearningLesson,
        current_prompts: &BTreeMap<String, String>,
    ) -> Result<ImprovementRecommendations> {
        let prompt = self.improvements_prompt(pattern, lesson, current_prompts);
        let response = self.query_ok(&prompt, Strategy::All).await?;

        let mut recommendations = ImprovementRecommendations {
            pattern_id: pattern.pattern_id.clone(),
            consensus_score: parsing::consensus_confidence(response.responses.len()),
            cost: response.total_cost,
            tokens_used: response.total_tokens,
            ..Default::default()
        };

        for content in response.responses.values() {
            let parsed = parsing::parse_improvements(content);
            recommendations.prompt_improvements.extend(parsed.prompts);
            for rule in parsed.validation_rules {
                if !recommendations.validation_rules.contains(&rule) {
                    recommendations.validation_rules.push(rule);
                }
            }
            recommendations
                .complexity_adjustments
                .extend(parsed.complexity_adjustments);
            for addition in parsed.context_additions {
                if !recommendations.context_additions.contains(&addition) {
                    recommendations.context_additions.push(addition);
                }
            }
        }

        info!(
            prompt_improvements = recommendations.prompt_improvements.len(),
            validation_rules = recommendations.validation_rules.len(),
            cost = recommendations.cost,
            "improvement generation completed"
        );
        Ok(recommendations)
    }

    /// Validate the effectiveness of applied improvements.
    #[instrument(skip(self, improvements_applied, metrics_before, metrics_after))]
    pub async fn validate_effectiveness(
        &self,
        pattern_id: &str,
        improvements_applied: &serde_json::Value,
        metrics_before: &HashMap<String, f64>,
        metrics_after: &HashMap<String, f64>,
    ) -> Result<EffectivenessValidation> {
        let prompt = self.effectiveness_prompt(
            pattern_id,
            improvements_applied,
            metrics_before,
            metrics_after,
        );
        let response = self.query_ok(&prompt, Strategy::Dialectical).await?;

        let content = response.combined_text();
        let lower = content.to_lowercase();
        let prevented_failures = lower.contains("prevented") || lower.contains("success");

        let validation = EffectivenessValidation {
            pattern_id: pattern_id.to_string(),
            prevented_failures,
            failure_rate_before: metrics_before.get("failure_rate").copied().unwrap_or(0.0),
            failure_rate_after: metrics_after.get("failure_rate").copied().unwrap_or(0.0),
            side_effects: parsing::extract_side_effects(content),
            recommendation: parsing::extract_recommendation(content),
            confidence: parsing::consensus_confidence(response.responses.len()),
            cost: response.total_cost,
            tokens_used: response.total_tokens,
        };

        info!(
            recommendation = %validation.recommendation,
            confidence = validation.confidence,
            "effectiveness validation completed"
        );
        Ok(validation)
    }

    async fn query_ok(&self, prompt: &str, strategy: Strategy) -> Result<RunnerResponse> {
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

    // ==================== Prompt shapes ====================

    fn root_cause_prompt(&self, pattern: &FailurePattern) -> String {
        let failures = pattern
            .failure_examples
            .iter()
            .take(ROOT_CAUSE_EXAMPLES)
            .enumerate()
            .map(|(i, op)| {
                format!(
                    "Example {}:\n- Operation ID: {}\n- Error: {}\n- Retry Count: {}\n- Started: {}\n",
                    i + 1,
                    op.external_id.as_deref().unwrap_or("N/A"),
                    op.error_message.as_deref().unwrap_or("N/A"),
                    op.retry_count,
                    op.started_at,
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let successes = if pattern.success_examples.is_empty() {
            "No successful examples available for comparison".to_string()
        } else {
            pattern
                .success_examples
                .iter()
                .take(SUCCESS_CONTRAST_EXAMPLES)
                .enumerate()
                .map(|(i, op)| {
                    format!(
                        "Success {}:\n- Operation ID: {}\n- Duration: {} seconds\n- Started: {}\n",
                        i + 1,
                        op.external_id.as_deref().unwrap_or("N/A"),
                        op.duration_seconds
                            .map(|d| d.to_string())
                            .unwrap_or_else(|| "N/A".to_string()),
                        op.started_at,
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            "Analyze this failure pattern that has occurred {count} times:\n\n\
             **Pattern Details:**\n\
             - Operation Type: {kind}\n\
             - Error Type: {error}\n\
             - Severity: {severity}\n\
             - Time Span: {first} to {last}\n\
             - Common Error Prefix: {prefix}\n\
             - Average Retry Count: {retries}\n\n\
             **Failure Examples:**\n{failures}\n\n\
             **Similar Successful Operations:**\n{successes}\n\n\
             **Analysis Questions:**\n\
             From your perspective, analyze:\n\
             1. What is the root cause of these failures?\n\
             2. Why did similar operations succeed while these failed?\n\
             3. What patterns or commonalities do you observe?\n\
             4. What was the fundamental mistake or gap?\n\
             5. What assumptions or blind spots led to this failure?\n\n\
             Provide deep, actionable analysis, not surface-level observations.\n\
             Focus on what can be learned and improved.\n",
            count = pattern.occurrence_count,
            kind = pattern.kind,
            error = pattern.error_kind,
            severity = pattern.severity,
            first = pattern.first_seen,
            last = pattern.last_seen,
            prefix = pattern
                .common_attributes
                .common_error_prefix
                .as_deref()
                .unwrap_or("N/A"),
            retries = pattern
                .common_attributes
                .avg_retry_count
                .map(|r| format!("{r:.1}"))
                .unwrap_or_else(|| "N/A".to_string()),
        )
    }

    fn lesson_prompt(&self, pattern: &FailurePattern, root_cause: &RootCauseAnalysis) -> String {
        let analyses = root_cause
            .analyses
            .iter()
            .map(|(provider, analysis)| format!("**{provider}:** {analysis}"))
            .collect::<Vec<_>>()
            .join("\n\n");

        format!(
            "Learn from these failure analyses using dialectical reasoning:\n\n\
             **Failure Pattern:**\n\
             - Type: {kind}\n\
             - Error: {error}\n\
             - Occurrences: {count}\n\
             - Severity: {severity}\n\n\
             **Root Cause Analyses:**\n{analyses}\n\n\
             **Dialectical Learning Process:**\n\n\
             **THESIS - What Went Wrong:**\n\
             Synthesize the different root cause analyses.\n\
             What fundamentally went wrong across all perspectives?\n\n\
             **ANTITHESIS - Why It Happened:**\n\
             Why didn't the system catch this earlier?\n\
             What assumptions or blind spots enabled this failure?\n\n\
             **SYNTHESIS - How to Prevent:**\n\
             What specific, actionable changes will prevent this failure?\n\
             Consider prompt template improvements, validation enhancements,\n\
             error detection rules, process changes, and context additions.\n\n\
             Provide 3-5 concrete, actionable items.\n\
             Each should be specific enough to implement immediately.\n",
            kind = pattern.kind,
            error = pattern.error_kind,
            count = pattern.occurrence_count,
            severity = pattern.severity,
        )
    }

    fn improvements_prompt(
        &self,
        pattern: &FailurePattern,
        lesson: &LearningLesson,
        current_prompts: &BTreeMap<String, String>,
    ) -> String {
        let prompts_text = if current_prompts.is_empty() {
            "No existing prompts provided".to_string()
        } else {
            current_prompts
                .iter()
                .map(|(name, prompt)| format!("**{name}:**\n```\n{prompt}\n```"))
                .collect::<Vec<_>>()
                .join("\n\n")
        };

        format!(
            "Generate specific improvements to prevent this failure pattern:\n\n\
             **Failure Pattern:**\n\
             - Type: {kind}\n\
             - Error: {error}\n\
             - Occurrences: {count}\n\n\
             **Lesson Learned:**\n\
             - Thesis: {thesis}\n\
             - Antithesis: {antithesis}\n\
             - Synthesis: {synthesis}\n\
             - Actionable Items: {items}\n\n\
             **Current Prompts:**\n{prompts}\n\n\
             **Generate Specific Improvements:**\n\n\
             1. **Improved Prompt Templates:** format each as the template id\n\
                followed by a fenced code block with the full new template.\n\
             2. **Enhanced Validation Rules:** bulleted checks to add.\n\
             3. **Better Complexity Estimation:** factors that were missed and\n\
                suggested adjustments to scoring.\n\
             4. **Additional Context:** bulleted examples, warnings, or caveats\n\
                that would have prevented this.\n\n\
             Provide concrete, implementable suggestions.\n",
            kind = pattern.kind,
            error = pattern.error_kind,
            count = pattern.occurrence_count,
            thesis = lesson.thesis,
            antithesis = lesson.antithesis,
            synthesis = lesson.synthesis,
            items = lesson.actionable_items.join("; "),
            prompts = prompts_text,
        )
    }

    fn effectiveness_prompt(
        &self,
        pattern_id: &str,
        improvements_applied: &serde_json::Value,
        metrics_before: &HashMap<String, f64>,
        metrics_after: &HashMap<String, f64>,
    ) -> String {
        let fmt_metrics = |metrics: &HashMap<String, f64>| {
            let mut keys: Vec<_> = metrics.keys().collect();
            keys.sort();
            keys.iter()
                .map(|k| format!("- {k}: {:.4}", metrics[*k]))
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            "Validate the effectiveness of improvements applied to address a failure pattern:\n\n\
             **Pattern:** {pattern_id}\n\n\
             **Improvements Applied:**\n{improvements}\n\n\
             **Metrics Before Improvements:**\n{before}\n\n\
             **Metrics After Improvements:**\n{after}\n\n\
             **Evaluation Questions:**\n\
             1. Did the improvements prevent similar failures?\n\
             2. What is the failure rate change (before vs after)?\n\
             3. Are there any unintended side effects or new issues?\n\
             4. Should we keep, refine, or revert these improvements?\n\n\
             **Provide Recommendation:**\n\
             - \"keep\": improvements are effective, keep them\n\
             - \"refine\": improvements partially work, need refinement\n\
             - \"revert\": improvements caused problems, revert them\n",
            improvements = improvements_applied,
            before = fmt_metrics(metrics_before),
            after = fmt_metrics(metrics_after),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deliberation::types::Recommendation;
    use crate::error::ErrorKind;
    use crate::ledger::{Ledger, OperationKind};
    use crate::patterns::PatternDetector;
    use crate::runner::subprocess::testing::ScriptedRunner;
    use chrono::{Duration as ChronoDuration, Utc};
    use pretty_assertions::assert_eq;

    fn sample_pattern() -> FailurePattern {
        let ledger = Arc::new(Ledger::in_memory().unwrap());
        let now = Utc::now();
        for i in 0..5 {
            let started = now - ChronoDuration::hours(10 - i);
            let id = ledger
                .start_operation_at(
                    OperationKind::ProcessIssue,
                    Some(&format!("issue-{i}")),
                    None,
                    started,
                )
                .unwrap();
            ledger
                .complete_operation_at(
                    id,
                    false,
                    Some("provider timed out"),
                    Some(ErrorKind::ProviderFault),
                    1,
                    started + ChronoDuration::minutes(2),
                )
                .unwrap();
        }
        PatternDetector::new(ledger)
            .detect_patterns()
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn test_root_cause_confidence_scales_with_providers() {
        let pattern = sample_pattern();
        let runner = Arc::new(ScriptedRunner::new(vec![ScriptedRunner::all_response(&[
            ("anthropic", "Root cause: missing timeout budget"),
            ("openai", "Root cause: unbounded retries"),
            ("deepseek", "Root cause: no circuit breaker"),
            ("perplexity", "Root cause: silent queue growth"),
        ])]));

        let engine = DeliberationEngine::new(runner);
        let analysis = engine.analyze_root_cause(&pattern).await.unwrap();

        assert_eq!(analysis.analyses.len(), 4);
        assert!((analysis.confidence - 0.9).abs() < f64::EPSILON);
        assert_eq!(analysis.pattern_id, pattern.pattern_id);
    }

    #[tokio::test]
    async fn test_lesson_parses_dialectical_sections() {
        let pattern = sample_pattern();
        let runner = Arc::new(ScriptedRunner::new(vec![
            ScriptedRunner::all_response(&[("anthropic", "analysis text")]),
            ScriptedRunner::dialectical_response(
                "THESIS\nTimeouts were unbounded.\n\
                 ANTITHESIS\nNo budget enforcement existed.\n\
                 SYNTHESIS\n- Introduce per-call timeout budgets everywhere\n\
                 - Record budget exhaustion as a distinct error kind\n",
            ),
        ]));

        let engine = DeliberationEngine::new(runner);
        let root_cause = engine.analyze_root_cause(&pattern).await.unwrap();
        let lesson = engine.synthesize_learning(&pattern, &root_cause).await.unwrap();

        assert_eq!(lesson.thesis, "Timeouts were unbounded.");
        assert_eq!(lesson.antithesis, "No budget enforcement existed.");
        assert_eq!(lesson.actionable_items.len(), 2);
    }

    #[tokio::test]
    async fn test_improvements_deduplicated_across_providers() {
        let pattern = sample_pattern();
        let improvement_text = "\
**issue_analysis**:
```
Improved template body
```
## Validation checks
- Require an explicit complexity estimate in every response
";
        let runner = Arc::new(ScriptedRunner::new(vec![ScriptedRunner::all_response(&[
            ("anthropic", improvement_text),
            ("openai", improvement_text),
        ])]));

        let engine = DeliberationEngine::new(runner);
        let lesson = LearningLesson {
            pattern_id: pattern.pattern_id.clone(),
            thesis: "t".into(),
            antithesis: "a".into(),
            synthesis: "s".into(),
            actionable_items: vec![],
            confidence: 0.7,
            cost: 0.0,
            tokens_used: 0,
        };

        let recommendations = engine
            .generate_improvements(&pattern, &lesson, &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(recommendations.prompt_improvements.len(), 1);
        assert_eq!(recommendations.validation_rules.len(), 1);
    }

    #[tokio::test]
    async fn test_effectiveness_validation() {
        let runner = Arc::new(ScriptedRunner::new(vec![
            ScriptedRunner::dialectical_response(
                "The improvements prevented recurrence. Side effect: slightly higher token spend. keep",
            ),
        ]));
        let engine = DeliberationEngine::new(runner);

        let before = HashMap::from([("failure_rate".to_string(), 0.4)]);
        let after = HashMap::from([("failure_rate".to_string(), 0.1)]);

        let validation = engine
            .validate_effectiveness("pattern_x", &serde_json::json!({"prompts": 1}), &before, &after)
            .await
            .unwrap();

        assert!(validation.prevented_failures);
        assert_eq!(validation.recommendation, Recommendation::Keep);
        assert!((validation.failure_rate_before - 0.4).abs() < f64::EPSILON);
        assert_eq!(validation.side_effects.len(), 1);
    }

    #[tokio::test]
    async fn test_runner_failure_surfaces_as_provider_fault() {
        let pattern = sample_pattern();
        let runner = Arc::new(ScriptedRunner::failing());
        let engine = DeliberationEngine::new(runner);

        let result = engine.analyze_root_cause(&pattern).await;
        assert!(matches!(result, Err(Error::Provider(_))));
    }
}
