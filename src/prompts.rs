//! Versioned prompt library with learning-driven updates.
//!
//! Templates live in a single JSON document keyed by template id. Every
//! write rewrites the document atomically (temp file + rename). Updates
//! append a history entry carrying the previous template so rollback can
//! restore any earlier version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::ledger::RepositoryContext;

/// One recorded improvement to a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptImprovement {
    /// Version the template moved *to* with this improvement
    pub version: u32,
    pub reason: String,
    pub previous_template: String,
    pub timestamp: DateTime<Utc>,
}

/// Running effectiveness aggregates for one template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptStatistics {
    pub uses: u64,
    pub successes: u64,
    pub total_execution_seconds: f64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feedback: Vec<String>,
}

impl PromptStatistics {
    pub fn success_rate(&self) -> f64 {
        if self.uses == 0 {
            return 0.0;
        }
        self.successes as f64 / self.uses as f64
    }

    pub fn avg_execution_seconds(&self) -> f64 {
        if self.uses == 0 {
            return 0.0;
        }
        self.total_execution_seconds / self.uses as f64
    }

    pub fn avg_tokens(&self) -> f64 {
        if self.uses == 0 {
            return 0.0;
        }
        self.total_tokens as f64 / self.uses as f64
    }
}

/// A stored template with its version history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub template: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub improvements: Vec<PromptImprovement>,
    #[serde(default)]
    pub statistics: PromptStatistics,
}

impl PromptTemplate {
    fn new(template: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            template: template.into(),
            version: 1,
            created_at: now,
            updated_at: now,
            improvements: Vec::new(),
            statistics: PromptStatistics::default(),
        }
    }
}

const ISSUE_ANALYSIS_TEMPLATE: &str = "\
Analyze this issue and determine its actionability:

Issue #{issue_number}: {title}

Description:
{body}

Labels: {labels}

Provide analysis:
1. Is this actionable? (yes/no with confidence)
2. Estimated complexity (0-10)
3. What needs to be done?
4. Any risks or concerns?
";

fn default_templates() -> BTreeMap<String, PromptTemplate> {
    let mut templates = BTreeMap::new();
    templates.insert(
        "issue_analysis".to_string(),
        PromptTemplate::new(ISSUE_ANALYSIS_TEMPLATE),
    );
    templates
}

/// Versioned, rollback-capable store of prompt templates.
pub struct PromptLibrary {
    path: PathBuf,
    templates: BTreeMap<String, PromptTemplate>,
    repository_context: Option<RepositoryContext>,
}

impl PromptLibrary {
    /// Open the library at `path`, loading the document if it exists.
    /// A missing document is seeded with the default templates and written.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut library = Self {
            path,
            templates: BTreeMap::new(),
            repository_context: None,
        };

        if library.path.exists() {
            let data = std::fs::read_to_string(&library.path)
                .map_err(|e| Error::storage(format!("reading prompt library: {e}")))?;
            library.templates = serde_json::from_str(&data)?;
            debug!(count = library.templates.len(), "prompt library loaded");
        } else {
            library.templates = default_templates();
            library.save()?;
            info!(path = %library.path.display(), "prompt library initialized with defaults");
        }

        Ok(library)
    }

    /// Bind a repository context snapshot; rendered templates get it
    /// prepended as a "Repository Context" block.
    pub fn bind_repository_context(&mut self, context: RepositoryContext) {
        self.repository_context = Some(context);
    }

    /// Render a template by id, prepending bound repository context and
    /// appending the task-specific context bag when provided.
    ///
    /// A defaulted key that is absent from the document is created lazily.
    pub fn get(
        &mut self,
        id: &str,
        additional_context: Option<&HashMap<String, String>>,
    ) -> Result<String> {
        if !self.templates.contains_key(id) {
            let defaults = default_templates();
            let Some(template) = defaults.get(id) else {
                return Err(Error::storage(format!("unknown prompt template: {id}")));
            };
            self.templates.insert(id.to_string(), template.clone());
            self.save()?;
        }

        let template = &self.templates[id].template;
        let mut rendered = String::new();

        if let Some(ctx) = &self.repository_context {
            rendered.push_str(&ctx.render());
            rendered.push('\n');
        }

        rendered.push_str(template);

        if let Some(extra) = additional_context {
            if !extra.is_empty() {
                rendered.push_str("\n## Task-Specific Context\n");
                let mut keys: Vec<_> = extra.keys().collect();
                keys.sort();
                for key in keys {
                    rendered.push_str(&format!("- {}: {}\n", key, extra[key]));
                }
            }
        }

        Ok(rendered)
    }

    /// Raw template text without context blocks, if present.
    pub fn raw(&self, id: &str) -> Option<&str> {
        self.templates.get(id).map(|t| t.template.as_str())
    }

    /// Current version of a template, if present.
    pub fn version(&self, id: &str) -> Option<u32> {
        self.templates.get(id).map(|t| t.version)
    }

    /// Improvement history for a template, oldest first.
    pub fn history(&self, id: &str) -> &[PromptImprovement] {
        self.templates
            .get(id)
            .map(|t| t.improvements.as_slice())
            .unwrap_or(&[])
    }

    /// Apply an improved template. Increments the version and appends a
    /// history entry carrying the previous template. A new id is created
    /// at version 1 with empty history.
    pub fn update(
        &mut self,
        id: &str,
        new_template: impl Into<String>,
        improvement_reason: impl Into<String>,
    ) -> Result<u32> {
        let new_template = new_template.into();
        let reason = improvement_reason.into();
        let now = Utc::now();

        let version = match self.templates.get_mut(id) {
            Some(existing) => {
                let previous = std::mem::replace(&mut existing.template, new_template);
                existing.version += 1;
                existing.updated_at = now;
                existing.improvements.push(PromptImprovement {
                    version: existing.version,
                    reason: reason.clone(),
                    previous_template: previous,
                    timestamp: now,
                });
                existing.version
            }
            None => {
                self.templates
                    .insert(id.to_string(), PromptTemplate::new(new_template));
                1
            }
        };

        self.save()?;
        info!(prompt_id = id, version, reason = %reason, "prompt updated");
        Ok(version)
    }

    /// Restore the template that was current at `version`.
    ///
    /// The text restored comes from the history entry recorded at
    /// `version + 1` (each entry stores the template it replaced). Version 1
    /// has no entry of its own, so rolling back to it returns false, as does
    /// rolling back to the current version.
    pub fn rollback(&mut self, id: &str, version: u32) -> Result<bool> {
        let Some(template) = self.templates.get_mut(id) else {
            return Ok(false);
        };

        if !template.improvements.iter().any(|i| i.version == version) {
            return Ok(false);
        }
        let Some(next) = template
            .improvements
            .iter()
            .find(|i| i.version == version + 1)
        else {
            return Ok(false);
        };

        template.template = next.previous_template.clone();
        template.version = version;
        template.updated_at = Utc::now();

        self.save()?;
        info!(prompt_id = id, version, "prompt rolled back");
        Ok(true)
    }

    /// Record one observed use of a template.
    pub fn track_effectiveness(
        &mut self,
        id: &str,
        success: bool,
        execution_time_secs: f64,
        tokens_used: u64,
        feedback: Option<&str>,
    ) -> Result<()> {
        let Some(template) = self.templates.get_mut(id) else {
            return Err(Error::storage(format!("unknown prompt template: {id}")));
        };

        let stats = &mut template.statistics;
        stats.uses += 1;
        if success {
            stats.successes += 1;
        }
        stats.total_execution_seconds += execution_time_secs;
        stats.total_tokens += tokens_used;
        if let Some(feedback) = feedback {
            stats.feedback.push(feedback.to_string());
        }

        self.save()
    }

    /// Effectiveness aggregates for a template.
    pub fn statistics(&self, id: &str) -> Option<&PromptStatistics> {
        self.templates.get(id).map(|t| &t.statistics)
    }

    /// Ids of all stored templates.
    pub fn template_ids(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }

    /// Atomically rewrite the document: write to a temp file in the same
    /// directory, then rename over the target.
    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::storage(format!("creating prompts dir: {e}")))?;
            }
        }

        let data = serde_json::to_string_pretty(&self.templates)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)
            .map_err(|e| Error::storage(format!("writing prompt library: {e}")))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| Error::storage(format!("replacing prompt library: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn library() -> (TempDir, PromptLibrary) {
        let dir = TempDir::new().unwrap();
        let library = PromptLibrary::open(dir.path().join("prompts.json")).unwrap();
        (dir, library)
    }

    #[test]
    fn test_default_prompt_available() {
        let (_dir, mut library) = library();
        let prompt = library.get("issue_analysis", None).unwrap();
        assert!(prompt.contains("Issue"));
        assert_eq!(library.version("issue_analysis"), Some(1));
    }

    #[test]
    fn test_unknown_template_rejected() {
        let (_dir, mut library) = library();
        assert!(library.get("nonexistent", None).is_err());
    }

    #[test]
    fn test_update_is_monotone() {
        let (_dir, mut library) = library();
        let v = library
            .update("issue_analysis", "New template", "Test improvement")
            .unwrap();
        assert_eq!(v, 2);
        assert_eq!(library.raw("issue_analysis"), Some("New template"));
        assert_eq!(library.history("issue_analysis").len(), 1);

        let v = library
            .update("issue_analysis", "Newer template", "Another improvement")
            .unwrap();
        assert_eq!(v, 3);
        assert_eq!(library.history("issue_analysis").len(), 2);
    }

    #[test]
    fn test_rollback_restores_template_current_at_version() {
        let (_dir, mut library) = library();
        library.update("issue_analysis", "V2", "first").unwrap();
        library.update("issue_analysis", "V3", "second").unwrap();
        assert_eq!(library.history("issue_analysis").len(), 2);

        // Rolling back to version 2 restores the template current at v2.
        assert!(library.rollback("issue_analysis", 2).unwrap());
        assert_eq!(library.raw("issue_analysis"), Some("V2"));
        assert_eq!(library.version("issue_analysis"), Some(2));

        // Version 1 never has a history entry of its own.
        assert!(!library.rollback("issue_analysis", 1).unwrap());
    }

    #[test]
    fn test_rollback_to_current_version_is_noop() {
        let (_dir, mut library) = library();
        library.update("issue_analysis", "V2", "first").unwrap();
        assert!(!library.rollback("issue_analysis", 2).unwrap());
        assert_eq!(library.raw("issue_analysis"), Some("V2"));
    }

    #[test]
    fn test_rollback_unknown_id() {
        let (_dir, mut library) = library();
        assert!(!library.rollback("missing", 1).unwrap());
    }

    #[test]
    fn test_save_load_identity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prompts.json");
        {
            let mut library = PromptLibrary::open(&path).unwrap();
            library.update("issue_analysis", "V2", "persisted").unwrap();
            library
                .track_effectiveness("issue_analysis", true, 1.5, 800, Some("good"))
                .unwrap();
        }

        let reloaded = PromptLibrary::open(&path).unwrap();
        assert_eq!(reloaded.raw("issue_analysis"), Some("V2"));
        assert_eq!(reloaded.version("issue_analysis"), Some(2));
        assert_eq!(reloaded.history("issue_analysis").len(), 1);
        let stats = reloaded.statistics("issue_analysis").unwrap();
        assert_eq!(stats.uses, 1);
        assert_eq!(stats.feedback, vec!["good".to_string()]);
    }

    #[test]
    fn test_effectiveness_running_sums() {
        let (_dir, mut library) = library();
        library
            .track_effectiveness("issue_analysis", true, 2.0, 1000, None)
            .unwrap();
        library
            .track_effectiveness("issue_analysis", false, 4.0, 3000, None)
            .unwrap();

        let stats = library.statistics("issue_analysis").unwrap();
        assert_eq!(stats.uses, 2);
        assert!((stats.success_rate() - 0.5).abs() < f64::EPSILON);
        assert!((stats.avg_execution_seconds() - 3.0).abs() < f64::EPSILON);
        assert!((stats.avg_tokens() - 2000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_context_blocks_rendered() {
        let (_dir, mut library) = library();
        let mut ctx = RepositoryContext::new("acme/widgets", "main");
        ctx.primary_language = Some("Rust".into());
        library.bind_repository_context(ctx);

        let mut extra = HashMap::new();
        extra.insert("issue_number".to_string(), "42".to_string());

        let rendered = library.get("issue_analysis", Some(&extra)).unwrap();
        assert!(rendered.starts_with("## Repository Context"));
        assert!(rendered.contains("acme/widgets"));
        assert!(rendered.contains("## Task-Specific Context"));
        assert!(rendered.contains("- issue_number: 42"));
    }

    #[test]
    fn test_repeated_identical_update_changes_version_not_text() {
        let (_dir, mut library) = library();
        library.update("issue_analysis", "Same", "first").unwrap();
        let before = library.raw("issue_analysis").unwrap().to_string();
        library.update("issue_analysis", "Same", "again").unwrap();
        assert_eq!(library.raw("issue_analysis").unwrap(), before);
    }
}
