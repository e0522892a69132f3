//! Orchestrator configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::scheduler::CycleFrequency;

fn default_state_dir() -> String {
    "./state".to_string()
}

fn default_runner_binary() -> String {
    "multi-agent-runner".to_string()
}

fn default_frequency() -> CycleFrequency {
    CycleFrequency::Weekly
}

fn default_lookback_days() -> i64 {
    30
}

fn default_min_occurrences() -> usize {
    3
}

/// Process-wide configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Repository in `owner/name` form, for the host client
    pub repository: String,
    /// Local working tree the rollback manager and analyzer operate on
    pub repository_path: String,
    /// Directory holding the ledger, prompt library, and persisted state
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// Provider runner executable name or path
    #[serde(default = "default_runner_binary")]
    pub runner_binary: String,
    /// Optional provider subset for the runner
    #[serde(default)]
    pub providers: Option<Vec<String>>,
    /// Host API token; empty means unauthenticated (tests, dry runs)
    #[serde(default)]
    pub host_token: String,
    #[serde(default = "default_frequency")]
    pub roadmap_frequency: CycleFrequency,
    #[serde(default = "default_frequency")]
    pub learning_frequency: CycleFrequency,
    #[serde(default = "default_lookback_days")]
    pub pattern_lookback_days: i64,
    #[serde(default = "default_min_occurrences")]
    pub pattern_min_occurrences: usize,
    /// Apply prompt improvements without human review
    #[serde(default)]
    pub auto_apply_improvements: bool,
    /// Create host issues for approved proposals
    #[serde(default = "crate::config::default_true")]
    pub auto_create_issues: bool,
    /// Auto-approve low-risk gated operations
    #[serde(default)]
    pub auto_approve_low_risk: bool,
    /// Budget ceiling in USD per window, when set
    #[serde(default)]
    pub cost_budget: Option<f64>,
    /// Explicit project goals fed into roadmap ideation
    #[serde(default)]
    pub project_goals: Vec<String>,
}

pub(crate) fn default_true() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            repository: String::new(),
            repository_path: ".".to_string(),
            state_dir: default_state_dir(),
            runner_binary: default_runner_binary(),
            providers: None,
            host_token: String::new(),
            roadmap_frequency: default_frequency(),
            learning_frequency: default_frequency(),
            pattern_lookback_days: default_lookback_days(),
            pattern_min_occurrences: default_min_occurrences(),
            auto_apply_improvements: false,
            auto_create_issues: true,
            auto_approve_low_risk: false,
            cost_budget: None,
            project_goals: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from a JSON document, expanding `~` and env vars in paths.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.as_ref().display())))?;
        let mut config: Self = serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("parsing config: {e}")))?;
        config.expand_paths()?;
        config.validate()?;
        Ok(config)
    }

    fn expand_paths(&mut self) -> Result<()> {
        let expand = |value: &str| -> Result<String> {
            shellexpand::full(value)
                .map(|expanded| expanded.into_owned())
                .map_err(|e| Error::Config(format!("expanding '{value}': {e}")))
        };
        self.state_dir = expand(&self.state_dir)?;
        self.repository_path = expand(&self.repository_path)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.repository_path.is_empty() {
            return Err(Error::Config("repository_path must be set".to_string()));
        }
        Ok(())
    }

    pub fn ledger_path(&self) -> PathBuf {
        Path::new(&self.state_dir).join("ledger.db")
    }

    pub fn prompts_path(&self) -> PathBuf {
        Path::new(&self.state_dir).join("prompts.json")
    }

    pub fn rate_limiter_path(&self) -> PathBuf {
        Path::new(&self.state_dir).join("rate_limiter.json")
    }

    pub fn roadmap_schedule_path(&self) -> PathBuf {
        Path::new(&self.state_dir).join("roadmap_schedule.json")
    }

    pub fn learning_schedule_path(&self) -> PathBuf {
        Path::new(&self.state_dir).join("learning_schedule.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.roadmap_frequency, CycleFrequency::Weekly);
        assert_eq!(config.pattern_min_occurrences, 3);
        assert!(config.auto_create_issues);
        assert!(!config.auto_apply_improvements);
        assert!(config.ledger_path().ends_with("ledger.db"));
    }

    #[test]
    fn test_load_with_partial_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "repository": "acme/widgets",
                "repository_path": ".",
                "roadmap_frequency": "daily",
                "auto_apply_improvements": true
            }"#,
        )
        .unwrap();

        let config = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(config.repository, "acme/widgets");
        assert_eq!(config.roadmap_frequency, CycleFrequency::Daily);
        assert!(config.auto_apply_improvements);
        // Defaults fill the rest.
        assert_eq!(config.runner_binary, "multi-agent-runner");
    }

    #[test]
    fn test_env_expansion() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::env::set_var("REFLEX_TEST_STATE", "/tmp/reflex-state");
        std::fs::write(
            &path,
            r#"{
                "repository": "acme/widgets",
                "repository_path": ".",
                "state_dir": "$REFLEX_TEST_STATE"
            }"#,
        )
        .unwrap();

        let config = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(config.state_dir, "/tmp/reflex-state");
    }

    #[test]
    fn test_missing_file_is_config_error() {
        assert!(matches!(
            OrchestratorConfig::load("/nope/config.json"),
            Err(Error::Config(_))
        ));
    }
}
