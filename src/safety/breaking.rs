//! Multi-agent breaking-change analysis over a diff.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::types::{BreakingChangeAnalysis, BreakingSeverity};
use crate::runner::{ProviderRunner, Strategy};

const ANALYSIS_TIMEOUT: Duration = Duration::from_secs(240);
const MAX_DIFF_CHARS: usize = 5000;
const MAX_LISTED_FILES: usize = 10;

/// Detects breaking changes through a dialectical provider pass.
pub struct BreakingChangeDetector {
    runner: Arc<dyn ProviderRunner>,
    timeout: Duration,
}

impl BreakingChangeDetector {
    pub fn new(runner: Arc<dyn ProviderRunner>) -> Self {
        Self {
            runner,
            timeout: ANALYSIS_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Analyze a diff for breaking changes. Severity is the most
    /// conservative any provider reported; an unusable runner response is
    /// treated as CRITICAL.
    pub async fn analyze(&self, diff: &str, files_changed: &[String]) -> BreakingChangeAnalysis {
        let prompt = build_prompt(diff, files_changed);

        let response = match self
            .runner
            .query(&prompt, Strategy::Dialectical, self.timeout)
            .await
        {
            Ok(response) if response.success => response,
            Ok(response) => {
                warn!(error = ?response.error, "breaking-change analysis runner failure");
                return fail_closed();
            }
            Err(e) => {
                warn!(error = %e, "breaking-change analysis could not invoke runner");
                return fail_closed();
            }
        };

        let mut provider_assessments = BTreeMap::new();
        for (provider, text) in &response.responses {
            provider_assessments.insert(provider.clone(), extract_severity(text));
        }

        let overall_severity = provider_assessments
            .values()
            .copied()
            .max()
            .unwrap_or(BreakingSeverity::None);
        let consensus_reached = {
            let mut distinct: Vec<_> = provider_assessments.values().collect();
            distinct.sort();
            distinct.dedup();
            distinct.len() <= 1
        };

        let analysis = BreakingChangeAnalysis {
            overall_severity,
            consensus_reached,
            provider_assessments,
            recommendation: recommendation_for(overall_severity),
        };

        info!(
            severity = %analysis.overall_severity,
            consensus = analysis.consensus_reached,
            "breaking-change analysis completed"
        );
        analysis
    }
}

fn fail_closed() -> BreakingChangeAnalysis {
    BreakingChangeAnalysis {
        overall_severity: BreakingSeverity::Critical,
        consensus_reached: true,
        provider_assessments: BTreeMap::new(),
        recommendation: "REJECT - Breaking-change analysis failed; treating as critical"
            .to_string(),
    }
}

fn build_prompt(diff: &str, files_changed: &[String]) -> String {
    let shown: Vec<_> = files_changed
        .iter()
        .take(MAX_LISTED_FILES)
        .cloned()
        .collect();
    let file_ellipsis = if files_changed.len() > MAX_LISTED_FILES {
        "\n..."
    } else {
        ""
    };
    let truncated: String = diff.chars().take(MAX_DIFF_CHARS).collect();
    let diff_ellipsis = if diff.chars().count() > MAX_DIFF_CHARS {
        "\n..."
    } else {
        ""
    };

    format!(
        "Identify breaking changes in this diff:\n\n\
         **Files Changed**: {files}{file_ellipsis}\n\n\
         **Diff**:\n```diff\n{truncated}{diff_ellipsis}\n```\n\n\
         Identify:\n\
         1. **API signature changes** (parameters, return types, removed methods)\n\
         2. **Database schema modifications**\n\
         3. **Configuration changes** affecting behavior\n\
         4. **Behavioral changes** affecting consumers\n\n\
         For each breaking change:\n\
         - **Severity**: MINOR / MAJOR / CRITICAL\n\
         - **Description**: What changed\n\
         - **Impact**: Who/what is affected\n\
         - **Migration**: How to fix consumers\n\n\
         Then provide:\n\
         - **Overall Severity**: NONE / MINOR / MAJOR / CRITICAL\n\
         - **Recommendation**: APPROVE / REVIEW / REJECT\n\n\
         Be specific and thorough.",
        files = shown.join(", "),
    )
}

/// Extract the most conservative severity keyword mentioned.
fn extract_severity(text: &str) -> BreakingSeverity {
    let upper = text.to_uppercase();
    if upper.contains("CRITICAL") {
        BreakingSeverity::Critical
    } else if upper.contains("MAJOR") {
        BreakingSeverity::Major
    } else if upper.contains("MINOR") {
        BreakingSeverity::Minor
    } else {
        BreakingSeverity::None
    }
}

fn recommendation_for(severity: BreakingSeverity) -> String {
    match severity {
        BreakingSeverity::Critical => "REJECT - Critical breaking changes detected".to_string(),
        BreakingSeverity::Major => {
            "REVIEW - Major breaking changes require careful review".to_string()
        }
        BreakingSeverity::Minor => {
            "APPROVE WITH CAUTION - Minor breaking changes detected".to_string()
        }
        BreakingSeverity::None => "APPROVE - No breaking changes detected".to_string(),
    }
}
