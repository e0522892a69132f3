//! Static codebase metrics: a plain directory walk feeding the roadmap
//! cycle. No semantic parsing, just counts, a language histogram, and
//! manifest sniffing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Error, Result};

const SKIP_DIRS: &[&str] = &[
    ".git",
    "target",
    "node_modules",
    "vendor",
    "__pycache__",
    ".venv",
    "venv",
    "dist",
    "build",
];

/// Overall file and line counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodebaseMetrics {
    pub total_files: usize,
    pub total_lines: usize,
    /// Language → file count
    pub languages: BTreeMap<String, usize>,
    /// Extension → file count
    pub file_types: BTreeMap<String, usize>,
}

/// Detected project-level patterns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodebasePatterns {
    pub has_tests: bool,
    pub has_documentation: bool,
    pub has_ci: bool,
    pub package_managers: Vec<String>,
    pub frameworks: Vec<String>,
}

/// Complete codebase analysis result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodebaseAnalysis {
    pub repository_path: String,
    pub analyzed_at: DateTime<Utc>,
    pub metrics: CodebaseMetrics,
    pub patterns: CodebasePatterns,
}

impl CodebaseAnalysis {
    /// The language with the most files, if any.
    pub fn primary_language(&self) -> Option<&str> {
        self.metrics
            .languages
            .iter()
            .max_by_key(|(_, &count)| count)
            .map(|(lang, _)| lang.as_str())
    }

    /// Compact rendering used in ideation prompts.
    pub fn render_summary(&self) -> String {
        let languages = self
            .metrics
            .languages
            .iter()
            .map(|(lang, count)| format!("{lang} ({count})"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "- Files: {}\n- Lines: {}\n- Languages: {}\n- Tests: {}\n- Documentation: {}\n- CI: {}\n- Package managers: {}\n",
            self.metrics.total_files,
            self.metrics.total_lines,
            if languages.is_empty() { "none detected" } else { &languages },
            self.patterns.has_tests,
            self.patterns.has_documentation,
            self.patterns.has_ci,
            if self.patterns.package_managers.is_empty() {
                "none".to_string()
            } else {
                self.patterns.package_managers.join(", ")
            },
        )
    }
}

fn language_for_extension(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "rs" => "Rust",
        "py" => "Python",
        "js" | "jsx" => "JavaScript",
        "ts" | "tsx" => "TypeScript",
        "go" => "Go",
        "java" => "Java",
        "rb" => "Ruby",
        "c" | "h" => "C",
        "cc" | "cpp" | "hpp" => "C++",
        "cs" => "C#",
        "php" => "PHP",
        "swift" => "Swift",
        "kt" => "Kotlin",
        "sh" => "Shell",
        "sql" => "SQL",
        _ => return None,
    })
}

/// Analyzes a repository working tree.
pub struct CodebaseAnalyzer {
    repository_path: PathBuf,
}

impl CodebaseAnalyzer {
    pub fn new(repository_path: impl AsRef<Path>) -> Self {
        Self {
            repository_path: repository_path.as_ref().to_path_buf(),
        }
    }

    pub fn analyze(&self) -> Result<CodebaseAnalysis> {
        if !self.repository_path.is_dir() {
            return Err(Error::Config(format!(
                "not a directory: {}",
                self.repository_path.display()
            )));
        }

        let mut metrics = CodebaseMetrics::default();
        let mut patterns = CodebasePatterns::default();
        self.walk(&self.repository_path, &mut metrics, &mut patterns)?;

        patterns.package_managers = self.detect_package_managers();
        patterns.frameworks = self.detect_frameworks();

        info!(
            files = metrics.total_files,
            lines = metrics.total_lines,
            languages = metrics.languages.len(),
            "codebase analyzed"
        );

        Ok(CodebaseAnalysis {
            repository_path: self.repository_path.display().to_string(),
            analyzed_at: Utc::now(),
            metrics,
            patterns,
        })
    }

    fn walk(
        &self,
        dir: &Path,
        metrics: &mut CodebaseMetrics,
        patterns: &mut CodebasePatterns,
    ) -> Result<()> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| Error::storage(format!("reading {}: {e}", dir.display())))?;

        for entry in entries {
            let entry = entry.map_err(|e| Error::storage(e.to_string()))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();

            if path.is_dir() {
                if SKIP_DIRS.contains(&name.as_str()) {
                    continue;
                }
                let lower = name.to_lowercase();
                if lower == "tests" || lower == "test" {
                    patterns.has_tests = true;
                }
                if lower == "docs" || lower == "doc" {
                    patterns.has_documentation = true;
                }
                if name == ".github" && path.join("workflows").is_dir() {
                    patterns.has_ci = true;
                }
                self.walk(&path, metrics, patterns)?;
                continue;
            }

            let lower = name.to_lowercase();
            if lower.starts_with("readme") {
                patterns.has_documentation = true;
            }
            if lower == ".gitlab-ci.yml" || lower == ".travis.yml" {
                patterns.has_ci = true;
            }
            if lower.contains("test") {
                patterns.has_tests = true;
            }

            metrics.total_files += 1;
            if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                *metrics.file_types.entry(ext.to_string()).or_default() += 1;
                if let Some(language) = language_for_extension(ext) {
                    *metrics.languages.entry(language.to_string()).or_default() += 1;
                    if let Ok(content) = std::fs::read_to_string(&path) {
                        metrics.total_lines += content.lines().count();
                    }
                }
            }
        }
        Ok(())
    }

    fn detect_package_managers(&self) -> Vec<String> {
        let manifests = [
            ("Cargo.toml", "cargo"),
            ("package.json", "npm"),
            ("requirements.txt", "pip"),
            ("pyproject.toml", "pip"),
            ("go.mod", "go"),
            ("pom.xml", "maven"),
            ("Gemfile", "bundler"),
        ];
        let mut managers = Vec::new();
        for (file, manager) in manifests {
            if self.repository_path.join(file).exists()
                && !managers.contains(&manager.to_string())
            {
                managers.push(manager.to_string());
            }
        }
        managers
    }

    /// Framework names sniffed from manifest contents.
    fn detect_frameworks(&self) -> Vec<String> {
        let mut frameworks = Vec::new();
        let known = [
            ("tokio", "tokio"),
            ("axum", "axum"),
            ("actix-web", "actix"),
            ("django", "django"),
            ("flask", "flask"),
            ("fastapi", "fastapi"),
            ("react", "react"),
            ("express", "express"),
        ];

        for manifest in ["Cargo.toml", "package.json", "requirements.txt", "pyproject.toml"] {
            let path = self.repository_path.join(manifest);
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            for (needle, framework) in known {
                if content.contains(needle) && !frameworks.contains(&framework.to_string()) {
                    frameworks.push(framework.to_string());
                }
            }
        }
        debug!(?frameworks, "frameworks detected");
        frameworks
    }
}
