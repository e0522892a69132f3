//! Operation guard: detects and classifies operations requiring safety
//! validation from a proposed change set (files changed/deleted + diff).

use glob::{MatchOptions, Pattern};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;
use tracing::{debug, info};

use super::types::{DetectedOperation, OperationClass};
use crate::error::{Error, Result};

/// Default protected file patterns. `*` matches across path separators, so
/// these behave as unanchored suffix/substring patterns.
const PROTECTED_PATTERNS: &[&str] = &[
    "*.env",
    "*.env.*",
    "*.key",
    "*.pem",
    "*.p12",
    "*.pfx",
    "*config/production/*",
    "*secrets/*",
    "*credentials*",
    "*.secret",
];

const SECURITY_KEYWORDS: &[&str] = &[
    "auth",
    "security",
    "permission",
    "crypto",
    "token",
    "session",
];

const MIGRATION_PATTERNS: &[&str] = &[
    "*database/migrations/*",
    "*migrations/*",
    "*alembic/*",
    "*flyway/*",
];

const CONFIG_PATTERNS: &[&str] = &["*config*.yaml", "*config*.yml", "*config*.json", "*.toml"];

/// Extensions considered source files for the keyword-based classifiers.
const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "jsx", "ts", "tsx", "go", "java", "rb", "c", "cc", "cpp", "h", "hpp", "cs",
    "php", "swift", "kt",
];

const COMPLEXITY_PER_FILE: f64 = 0.5;
const COMPLEXITY_PER_LINE: f64 = 0.001;
const COMPLEXITY_PER_CRITICAL_FILE: f64 = 2.0;
const COMPLEXITY_CAP: u32 = 10;

static REMOVED_SIGNATURE_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?m)^-\s*def\s+\w+\(",
        r"(?m)^-\s*async\s+def\s+\w+\(",
        r"(?m)^-\s*class\s+\w+",
        r"(?m)^-\s*(?:pub(?:\(\w+\))?\s+)?(?:async\s+)?fn\s+\w+\(",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

static RETURN_ANNOTATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([+-])\s*(?:pub(?:\(\w+\))?\s+)?(?:async\s+)?(?:fn|def)\s+(\w+)\s*\([^)]*\)\s*(?:->|:)\s*(.+?)\s*[{:]?\s*$")
        .expect("valid regex")
});

fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    }
}

fn has_source_extension(path: &str) -> bool {
    path.rsplit('.')
        .next()
        .map(|ext| SOURCE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Detects file deletions, protected/security/migration/config touches,
/// high-complexity changes, and breaking-change signatures.
pub struct OperationGuard {
    protected: Vec<Pattern>,
    migrations: Vec<Pattern>,
    configs: Vec<Pattern>,
    max_complexity: u32,
}

impl OperationGuard {
    pub const DEFAULT_MAX_COMPLEXITY: u32 = 8;

    pub fn new() -> Self {
        Self::with_extra_protected(&[]).expect("default patterns are valid")
    }

    /// Build a guard with additional protected patterns beyond the defaults.
    pub fn with_extra_protected(extra: &[String]) -> Result<Self> {
        let mut protected = Vec::with_capacity(PROTECTED_PATTERNS.len() + extra.len());
        for pattern in PROTECTED_PATTERNS.iter().copied() {
            protected.push(Pattern::new(pattern).map_err(|e| {
                Error::Config(format!("bad protected pattern '{pattern}': {e}"))
            })?);
        }
        for pattern in extra {
            protected.push(Pattern::new(pattern).map_err(|e| {
                Error::Config(format!("bad protected pattern '{pattern}': {e}"))
            })?);
        }

        let compile = |patterns: &[&str]| -> Vec<Pattern> {
            patterns
                .iter()
                .map(|p| Pattern::new(p).expect("built-in pattern is valid"))
                .collect()
        };

        Ok(Self {
            protected,
            migrations: compile(MIGRATION_PATTERNS),
            configs: compile(CONFIG_PATTERNS),
            max_complexity: Self::DEFAULT_MAX_COMPLEXITY,
        })
    }

    pub fn with_max_complexity(mut self, max_complexity: u32) -> Self {
        self.max_complexity = max_complexity;
        self
    }

    /// Detect all operations requiring safety validation in a change set.
    pub fn detect_operations(
        &self,
        files_changed: &[String],
        files_deleted: &[String],
        diff: &str,
    ) -> Vec<DetectedOperation> {
        let mut operations = Vec::new();

        if !files_deleted.is_empty() {
            let shown: Vec<_> = files_deleted.iter().take(5).cloned().collect();
            let ellipsis = if files_deleted.len() > 5 { "..." } else { "" };
            operations.push(
                DetectedOperation::new(
                    OperationClass::FileDeletion,
                    format!("Deleting {} file(s)", files_deleted.len()),
                )
                .with_files(files_deleted.to_vec())
                .with_summary(format!("Files to delete: {}{}", shown.join(", "), ellipsis))
                .with_scope(format!("{} files", files_deleted.len())),
            );
        }

        let all_files: Vec<String> = files_changed
            .iter()
            .chain(files_deleted.iter())
            .cloned()
            .collect();

        let protected = self.find_protected(&all_files);
        if !protected.is_empty() {
            operations.push(
                DetectedOperation::new(
                    OperationClass::ProtectedFileAccess,
                    format!("Accessing {} protected file(s)", protected.len()),
                )
                .with_summary(format!("Protected files: {}", protected.join(", ")))
                .with_scope(format!("{} protected files", protected.len()))
                .with_files(protected),
            );
        }

        let security = self.find_security(files_changed);
        if !security.is_empty() {
            operations.push(
                DetectedOperation::new(
                    OperationClass::SecurityChange,
                    format!("Modifying {} security-sensitive file(s)", security.len()),
                )
                .with_summary(format!("Security files: {}", security.join(", ")))
                .with_scope(format!("{} security files", security.len()))
                .with_files(security),
            );
        }

        let migrations = self.find_migrations(files_changed);
        if !migrations.is_empty() {
            operations.push(
                DetectedOperation::new(
                    OperationClass::DatabaseMigration,
                    format!("Database migration affecting {} file(s)", migrations.len()),
                )
                .with_summary(format!("Migration files: {}", migrations.join(", ")))
                .with_scope("Database schema")
                .with_files(migrations),
            );
        }

        let configs = self.find_configs(files_changed);
        if !configs.is_empty() {
            operations.push(
                DetectedOperation::new(
                    OperationClass::ConfigurationChange,
                    format!("Configuration change in {} file(s)", configs.len()),
                )
                .with_summary(format!("Config files: {}", configs.join(", ")))
                .with_scope("Application configuration")
                .with_files(configs),
            );
        }

        let complexity = self.complexity_score(files_changed, files_deleted, diff);
        if complexity > self.max_complexity {
            operations.push(
                DetectedOperation::new(
                    OperationClass::ComplexChange,
                    format!(
                        "High complexity change (score: {complexity}/{})",
                        self.max_complexity
                    ),
                )
                .with_files(all_files.clone())
                .with_summary(format!(
                    "{} files changed, {} deleted",
                    files_changed.len(),
                    files_deleted.len()
                ))
                .with_complexity(complexity)
                .with_scope(format!("{} files total", all_files.len())),
            );
        }

        if !diff.is_empty() && has_breaking_signatures(diff) {
            operations.push(
                DetectedOperation::new(
                    OperationClass::BreakingChange,
                    "Potential breaking API changes detected",
                )
                .with_files(files_changed.to_vec())
                .with_summary("Breaking changes detected in diff")
                .with_scope("API consumers"),
            );
        }

        info!(
            operation_count = operations.len(),
            classes = ?operations.iter().map(|op| op.class).collect::<Vec<_>>(),
            "operations detected"
        );
        operations
    }

    /// Complexity score (0-10): per-file, per-line, and per-critical-file
    /// factors summed, truncated, then capped.
    pub fn complexity_score(
        &self,
        files_changed: &[String],
        files_deleted: &[String],
        diff: &str,
    ) -> u32 {
        let mut score = 0.0;
        score += files_changed.len() as f64 * COMPLEXITY_PER_FILE;
        score += files_deleted.len() as f64 * COMPLEXITY_PER_FILE;

        let (added, deleted) = count_diff_lines(diff);
        score += added as f64 * COMPLEXITY_PER_LINE;
        score += deleted as f64 * COMPLEXITY_PER_LINE;

        let critical: BTreeSet<String> = self
            .find_protected(files_changed)
            .into_iter()
            .chain(self.find_security(files_changed))
            .chain(self.find_migrations(files_changed))
            .collect();
        score += critical.len() as f64 * COMPLEXITY_PER_CRITICAL_FILE;

        debug!(score, "complexity computed");
        (score as u32).min(COMPLEXITY_CAP)
    }

    fn find_protected(&self, files: &[String]) -> Vec<String> {
        let options = match_options();
        files
            .iter()
            .filter(|f| self.protected.iter().any(|p| p.matches_with(f, options)))
            .cloned()
            .collect()
    }

    fn find_security(&self, files: &[String]) -> Vec<String> {
        files
            .iter()
            .filter(|f| {
                has_source_extension(f)
                    && SECURITY_KEYWORDS.iter().any(|k| f.to_lowercase().contains(k))
            })
            .cloned()
            .collect()
    }

    fn find_migrations(&self, files: &[String]) -> Vec<String> {
        let options = match_options();
        files
            .iter()
            .filter(|f| self.migrations.iter().any(|p| p.matches_with(f, options)))
            .cloned()
            .collect()
    }

    fn find_configs(&self, files: &[String]) -> Vec<String> {
        let options = match_options();
        files
            .iter()
            .filter(|f| {
                self.configs.iter().any(|p| p.matches_with(f, options))
                    || (has_source_extension(f) && f.to_lowercase().contains("settings"))
            })
            .cloned()
            .collect()
    }
}

impl Default for OperationGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Count added and deleted lines from a unified diff, excluding file
/// headers.
pub fn count_diff_lines(diff: &str) -> (usize, usize) {
    let mut added = 0;
    let mut deleted = 0;
    for line in diff.lines() {
        if line.starts_with('+') && !line.starts_with("+++") {
            added += 1;
        } else if line.starts_with('-') && !line.starts_with("---") {
            deleted += 1;
        }
    }
    (added, deleted)
}

/// Heuristic: removed function/class signatures, or a removed/added
/// signature pair for the same name with differing return annotations.
pub fn has_breaking_signatures(diff: &str) -> bool {
    if REMOVED_SIGNATURE_RES.iter().any(|re| re.is_match(diff)) {
        return true;
    }

    // Paired removed/added signature with a changed return annotation.
    let mut removed_returns: Vec<(String, String)> = Vec::new();
    let mut added_returns: Vec<(String, String)> = Vec::new();
    for caps in RETURN_ANNOTATION_RE.captures_iter(diff) {
        let entry = (caps[2].to_string(), caps[3].trim().to_string());
        match &caps[1] {
            "-" => removed_returns.push(entry),
            _ => added_returns.push(entry),
        }
    }
    removed_returns.iter().any(|(name, ret)| {
        added_returns
            .iter()
            .any(|(other_name, other_ret)| name == other_name && ret != other_ret)
    })
}
