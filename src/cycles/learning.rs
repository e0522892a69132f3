//! The learning cycle: detect failure patterns, deliberate, and apply
//! prompt improvements.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{info, instrument, warn};

use crate::deliberation::{
    DeliberationEngine, ImprovementRecommendations, LearningLesson, RootCauseAnalysis,
};
use crate::error::{Error, Result};
use crate::ledger::{Ledger, OperationKind};
use crate::patterns::{FailurePattern, PatternDetector};
use crate::prompts::PromptLibrary;

/// Outcome of one learning cycle iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningCycleReport {
    pub patterns_detected: usize,
    pub patterns_analyzed: usize,
    pub improvements_generated: usize,
    pub improvements_applied: usize,
    pub errors: usize,
    pub total_cost: f64,
    pub total_tokens: u64,
}

/// One analyzed pattern with everything the deliberation produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningRecord {
    pub pattern_id: String,
    pub root_cause: RootCauseAnalysis,
    pub lesson: LearningLesson,
    pub improvements: ImprovementRecommendations,
}

/// Drives pattern detection → deliberation → prompt application.
pub struct LearningCycle {
    ledger: Arc<Ledger>,
    detector: PatternDetector,
    engine: DeliberationEngine,
    prompts: Arc<Mutex<PromptLibrary>>,
    auto_apply: bool,
    history: Mutex<Vec<LearningRecord>>,
}

impl LearningCycle {
    pub fn new(
        ledger: Arc<Ledger>,
        detector: PatternDetector,
        engine: DeliberationEngine,
        prompts: Arc<Mutex<PromptLibrary>>,
    ) -> Self {
        Self {
            ledger,
            detector,
            engine,
            prompts,
            auto_apply: false,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn with_auto_apply(mut self, enabled: bool) -> Self {
        self.auto_apply = enabled;
        self
    }

    /// Run one complete learning iteration. Failures on individual patterns
    /// are logged and counted without aborting the cycle.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<LearningCycleReport> {
        let op_id = self
            .ledger
            .start_operation(OperationKind::LearningCycle, None, None)?;

        let mut report = LearningCycleReport::default();

        let patterns = match self.detector.detect_patterns() {
            Ok(patterns) => patterns,
            Err(e) => {
                self.ledger.complete_operation(
                    op_id,
                    false,
                    Some(&e.to_string()),
                    Some(e.kind()),
                    0,
                )?;
                return Err(e);
            }
        };
        report.patterns_detected = patterns.len();

        if patterns.is_empty() {
            info!("learning cycle found no patterns");
            self.ledger.complete_operation(op_id, true, None, None, 0)?;
            return Ok(report);
        }

        for pattern in &patterns {
            if !self.detector.should_trigger_learning(pattern) {
                continue;
            }

            match self.learn_from_pattern(pattern, &mut report).await {
                Ok(()) => report.patterns_analyzed += 1,
                Err(e) => {
                    warn!(
                        pattern_id = %pattern.pattern_id,
                        error = %e,
                        "learning failed for pattern"
                    );
                    report.errors += 1;
                }
            }
        }

        info!(
            detected = report.patterns_detected,
            analyzed = report.patterns_analyzed,
            applied = report.improvements_applied,
            cost = report.total_cost,
            "learning cycle completed"
        );
        self.ledger.complete_operation(op_id, true, None, None, 0)?;
        Ok(report)
    }

    async fn learn_from_pattern(
        &self,
        pattern: &FailurePattern,
        report: &mut LearningCycleReport,
    ) -> Result<()> {
        let root_cause = self.engine.analyze_root_cause(pattern).await?;
        report.total_cost += root_cause.cost;
        report.total_tokens += root_cause.tokens_used;

        let lesson = self.engine.synthesize_learning(pattern, &root_cause).await?;
        report.total_cost += lesson.cost;
        report.total_tokens += lesson.tokens_used;

        let current_prompts = self.current_prompts()?;
        let improvements = self
            .engine
            .generate_improvements(pattern, &lesson, &current_prompts)
            .await?;
        report.total_cost += improvements.cost;
        report.total_tokens += improvements.tokens_used;

        if !improvements.is_empty() {
            report.improvements_generated += 1;
        }

        if self.auto_apply && self.apply_improvements(pattern, &improvements)? {
            report.improvements_applied += 1;
        }

        self.history
            .lock()
            .map_err(|e| Error::Internal(format!("history lock poisoned: {e}")))?
            .push(LearningRecord {
                pattern_id: pattern.pattern_id.clone(),
                root_cause,
                lesson,
                improvements,
            });
        Ok(())
    }

    /// Apply prompt improvements. Updates that do not change the template
    /// text are skipped so re-applying a recommendation is idempotent.
    fn apply_improvements(
        &self,
        pattern: &FailurePattern,
        improvements: &ImprovementRecommendations,
    ) -> Result<bool> {
        let mut prompts = self
            .prompts
            .lock()
            .map_err(|e| Error::Internal(format!("prompt lock poisoned: {e}")))?;

        let mut applied = false;
        for (prompt_id, new_template) in &improvements.prompt_improvements {
            if prompts.raw(prompt_id) == Some(new_template.as_str()) {
                continue;
            }
            prompts.update(
                prompt_id,
                new_template.clone(),
                format!("Learning from {}", pattern.pattern_id),
            )?;
            applied = true;
        }

        if applied {
            info!(
                pattern_id = %pattern.pattern_id,
                updates = improvements.prompt_improvements.len(),
                "prompt improvements applied"
            );
        }
        Ok(applied)
    }

    fn current_prompts(&self) -> Result<BTreeMap<String, String>> {
        let mut prompts = self
            .prompts
            .lock()
            .map_err(|e| Error::Internal(format!("prompt lock poisoned: {e}")))?;

        let mut current = BTreeMap::new();
        // The issue-analysis template always exists (created lazily).
        let rendered_ids = prompts.template_ids();
        if rendered_ids.is_empty() {
            prompts.get("issue_analysis", None)?;
        }
        for id in prompts.template_ids() {
            if let Some(raw) = prompts.raw(&id) {
                current.insert(id, raw.to_string());
            }
        }
        Ok(current)
    }

    /// Severity histogram of current patterns plus the count needing
    /// attention.
    pub fn patterns_summary(&self) -> Result<PatternsSummary> {
        let patterns = self.detector.detect_patterns()?;
        let mut by_severity = BTreeMap::new();
        let mut needing_attention = 0;
        for pattern in &patterns {
            *by_severity
                .entry(pattern.severity.to_string())
                .or_default() += 1;
            if self.detector.should_trigger_learning(pattern) {
                needing_attention += 1;
            }
        }
        Ok(PatternsSummary {
            total_patterns: patterns.len(),
            by_severity,
            needing_attention,
        })
    }

    /// Records of every analyzed pattern this process lifetime.
    pub fn history(&self) -> Result<Vec<LearningRecord>> {
        Ok(self
            .history
            .lock()
            .map_err(|e| Error::Internal(format!("history lock poisoned: {e}")))?
            .clone())
    }
}

/// Histogram of current failure patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternsSummary {
    pub total_patterns: usize,
    pub by_severity: BTreeMap<String, usize>,
    pub needing_attention: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::runner::subprocess::testing::ScriptedRunner;
    use chrono::{Duration as ChronoDuration, Utc};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn seeded_ledger() -> Arc<Ledger> {
        let ledger = Arc::new(Ledger::in_memory().unwrap());
        let now = Utc::now();
        for i in 0..5 {
            let started = now - ChronoDuration::hours(10) + ChronoDuration::hours(2) * i;
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
                    started + ChronoDuration::minutes(1),
                )
                .unwrap();
        }
        ledger
    }

    fn prompts() -> (TempDir, Arc<Mutex<PromptLibrary>>) {
        let dir = TempDir::new().unwrap();
        let library = PromptLibrary::open(dir.path().join("prompts.json")).unwrap();
        (dir, Arc::new(Mutex::new(library)))
    }

    fn improvement_response() -> crate::runner::RunnerResponse {
        ScriptedRunner::all_response(&[(
            "anthropic",
            "**issue_analysis**:\n```\nImproved analysis template\n```\n",
        )])
    }

    #[tokio::test]
    async fn test_full_cycle_applies_improvements() {
        let ledger = seeded_ledger();
        let (_dir, prompts) = prompts();

        let runner = Arc::new(ScriptedRunner::new(vec![
            ScriptedRunner::all_response(&[("anthropic", "Root cause: no timeout budget")]),
            ScriptedRunner::dialectical_response(
                "THESIS\nx\nANTITHESIS\ny\nSYNTHESIS\n- Add per-call budgets to everything\n",
            ),
            improvement_response(),
        ]));

        let cycle = LearningCycle::new(
            Arc::clone(&ledger),
            PatternDetector::new(Arc::clone(&ledger)),
            DeliberationEngine::new(runner),
            Arc::clone(&prompts),
        )
        .with_auto_apply(true);

        let report = cycle.run().await.unwrap();

        assert_eq!(report.patterns_detected, 1);
        assert_eq!(report.patterns_analyzed, 1);
        assert_eq!(report.improvements_generated, 1);
        assert_eq!(report.improvements_applied, 1);
        assert_eq!(report.errors, 0);
        assert!(report.total_cost > 0.0);

        let prompts = prompts.lock().unwrap();
        assert_eq!(prompts.raw("issue_analysis"), Some("Improved analysis template"));
        assert_eq!(prompts.version("issue_analysis"), Some(2));

        let history = cycle.history().unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_reapplying_same_improvement_is_idempotent() {
        let ledger = seeded_ledger();
        let (_dir, prompts) = prompts();

        let runner = Arc::new(ScriptedRunner::new(vec![
            // First cycle
            ScriptedRunner::all_response(&[("anthropic", "analysis")]),
            ScriptedRunner::dialectical_response("THESIS\nx\nANTITHESIS\ny\nSYNTHESIS\nz"),
            improvement_response(),
            // Second cycle with the identical improvement
            ScriptedRunner::all_response(&[("anthropic", "analysis")]),
            ScriptedRunner::dialectical_response("THESIS\nx\nANTITHESIS\ny\nSYNTHESIS\nz"),
            improvement_response(),
        ]));

        let cycle = LearningCycle::new(
            Arc::clone(&ledger),
            PatternDetector::new(Arc::clone(&ledger)),
            DeliberationEngine::new(runner),
            Arc::clone(&prompts),
        )
        .with_auto_apply(true);

        cycle.run().await.unwrap();
        let version_after_first = prompts.lock().unwrap().version("issue_analysis");

        let report = cycle.run().await.unwrap();
        assert_eq!(report.improvements_applied, 0);
        assert_eq!(
            prompts.lock().unwrap().version("issue_analysis"),
            version_after_first
        );
    }

    #[tokio::test]
    async fn test_provider_failure_counts_error_without_abort() {
        let ledger = seeded_ledger();
        let (_dir, prompts) = prompts();

        let runner = Arc::new(ScriptedRunner::failing());
        let cycle = LearningCycle::new(
            Arc::clone(&ledger),
            PatternDetector::new(Arc::clone(&ledger)),
            DeliberationEngine::new(runner),
            prompts,
        );

        let report = cycle.run().await.unwrap();
        assert_eq!(report.patterns_detected, 1);
        assert_eq!(report.patterns_analyzed, 0);
        assert_eq!(report.errors, 1);
    }

    #[tokio::test]
    async fn test_empty_ledger_short_circuits() {
        let ledger = Arc::new(Ledger::in_memory().unwrap());
        let (_dir, prompts) = prompts();
        let runner = Arc::new(ScriptedRunner::new(vec![]));

        let cycle = LearningCycle::new(
            Arc::clone(&ledger),
            PatternDetector::new(Arc::clone(&ledger)),
            DeliberationEngine::new(runner),
            prompts,
        );

        let report = cycle.run().await.unwrap();
        assert_eq!(report.patterns_detected, 0);
        assert_eq!(report.patterns_analyzed, 0);
    }

    #[tokio::test]
    async fn test_patterns_summary() {
        let ledger = seeded_ledger();
        let (_dir, prompts) = prompts();
        let runner = Arc::new(ScriptedRunner::new(vec![]));

        let cycle = LearningCycle::new(
            Arc::clone(&ledger),
            PatternDetector::new(Arc::clone(&ledger)),
            DeliberationEngine::new(runner),
            prompts,
        );

        let summary = cycle.patterns_summary().unwrap();
        assert_eq!(summary.total_patterns, 1);
        assert_eq!(summary.needing_attention, 1);
    }
}
