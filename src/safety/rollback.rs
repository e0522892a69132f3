//! Repository-level rollback: tagged rollback points, revert commits,
//! branch cleanup, and revert PRs for merged pull requests.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::host::{Host, PullRequest};

const GIT_TIMEOUT: Duration = Duration::from_secs(10);
const TAG_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// An annotated repository marker that can be rolled back to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPoint {
    pub commit_sha: String,
    pub tag_name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub branch_name: String,
    pub work_item_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Outcome of a rollback operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackResult {
    pub success: bool,
    pub rollback_point: RollbackPoint,
    pub reverted_commits: Vec<String>,
    pub cleaned_branches: Vec<String>,
    pub revert_commit_sha: Option<String>,
    pub revert_pr: Option<u64>,
    pub error: Option<String>,
}

/// Executes rollback operations over a local working tree via git.
pub struct RollbackManager {
    repository_path: PathBuf,
    auto_cleanup_branches: bool,
}

impl RollbackManager {
    pub fn new(repository_path: impl AsRef<Path>) -> Result<Self> {
        let repository_path = repository_path.as_ref().to_path_buf();
        if !repository_path.join(".git").exists() {
            return Err(Error::Config(format!(
                "not a git repository: {}",
                repository_path.display()
            )));
        }
        Ok(Self {
            repository_path,
            auto_cleanup_branches: true,
        })
    }

    pub fn with_auto_cleanup(mut self, enabled: bool) -> Self {
        self.auto_cleanup_branches = enabled;
        self
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.repository_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| Error::Subprocess(format!("spawning git {}: {e}", args.join(" "))))?;

        let output = tokio::time::timeout(GIT_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| Error::timeout(GIT_TIMEOUT.as_millis() as u64))?
            .map_err(|e| Error::Subprocess(format!("waiting for git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::Subprocess(format!(
                "git {} failed: {stderr}",
                args.join(" ")
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Tag the current HEAD as a rollback point.
    pub async fn create_rollback_point(
        &self,
        description: &str,
        work_item_id: Option<&str>,
    ) -> Result<RollbackPoint> {
        let commit_sha = self.git(&["rev-parse", "HEAD"]).await?;
        let branch_name = self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;

        let created_at = Utc::now();
        let timestamp = created_at.format(TAG_TIMESTAMP_FORMAT).to_string();
        let tag_name = match work_item_id {
            Some(id) => format!("rollback-{id}-{timestamp}"),
            None => format!("rollback-{timestamp}"),
        };

        self.git(&["tag", "-a", &tag_name, &commit_sha, "-m", description])
            .await?;

        info!(
            tag = %tag_name,
            sha = &commit_sha[..commit_sha.len().min(8)],
            branch = %branch_name,
            "rollback point created"
        );

        Ok(RollbackPoint {
            commit_sha,
            tag_name,
            description: description.to_string(),
            created_at,
            branch_name,
            work_item_id: work_item_id.map(str::to_string),
            metadata: HashMap::new(),
        })
    }

    /// Roll the working tree back to a rollback point, either with a revert
    /// commit (preserving history) or a hard reset (destructive).
    pub async fn rollback(
        &self,
        point: &RollbackPoint,
        cleanup_branches: Option<bool>,
        create_revert_commit: bool,
    ) -> RollbackResult {
        match self
            .rollback_inner(point, cleanup_branches, create_revert_commit)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(tag = %point.tag_name, error = %e, "rollback failed");
                RollbackResult {
                    success: false,
                    rollback_point: point.clone(),
                    reverted_commits: Vec::new(),
                    cleaned_branches: Vec::new(),
                    revert_commit_sha: None,
                    revert_pr: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn rollback_inner(
        &self,
        point: &RollbackPoint,
        cleanup_branches: Option<bool>,
        create_revert_commit: bool,
    ) -> Result<RollbackResult> {
        let current = self.git(&["rev-parse", "HEAD"]).await?;

        let range = format!("{}..{}", point.commit_sha, current);
        let reverted_commits: Vec<String> = self
            .git(&["rev-list", &range])
            .await?
            .lines()
            .map(str::to_string)
            .collect();

        let revert_commit_sha = if create_revert_commit {
            if reverted_commits.is_empty() {
                None
            } else {
                self.git(&["revert", "--no-commit", &range]).await?;
                self.git(&[
                    "commit",
                    "-m",
                    &format!("Rollback to {}: {}", point.tag_name, point.description),
                ])
                .await?;
                Some(self.git(&["rev-parse", "HEAD"]).await?)
            }
        } else {
            self.git(&["reset", "--hard", &point.commit_sha]).await?;
            None
        };

        let mut cleaned_branches = Vec::new();
        let should_cleanup = cleanup_branches.unwrap_or(self.auto_cleanup_branches);
        if should_cleanup && !point.branch_name.is_empty() {
            let head_branch = self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
            if point.branch_name != head_branch {
                match self.cleanup_branch(&point.branch_name).await {
                    Ok(()) => cleaned_branches.push(point.branch_name.clone()),
                    Err(e) => {
                        warn!(branch = %point.branch_name, error = %e, "branch cleanup failed")
                    }
                }
            }
        }

        info!(
            tag = %point.tag_name,
            commits_reverted = reverted_commits.len(),
            branches_cleaned = cleaned_branches.len(),
            "rollback completed"
        );

        Ok(RollbackResult {
            success: true,
            rollback_point: point.clone(),
            reverted_commits,
            cleaned_branches,
            revert_commit_sha,
            revert_pr: None,
            error: None,
        })
    }

    async fn cleanup_branch(&self, branch: &str) -> Result<()> {
        self.git(&["branch", "-D", branch]).await?;
        // The remote branch may already be gone.
        if let Err(e) = self.git(&["push", "origin", "--delete", branch]).await {
            warn!(branch, error = %e, "remote branch delete failed");
        }
        Ok(())
    }

    /// Revert a merged pull request, either through a revert PR opened via
    /// the host or by reverting in place on the current branch.
    pub async fn rollback_pr(
        &self,
        host: &dyn Host,
        pr_number: u64,
        reason: &str,
        create_revert_pr: bool,
    ) -> Result<RollbackResult> {
        let pull: PullRequest = host.get_pr(pr_number).await?;
        if !pull.merged {
            return Err(Error::ValidationFailed(format!(
                "PR #{pr_number} is not merged; nothing to roll back"
            )));
        }
        let merge_sha = pull.merge_commit_sha.clone().ok_or_else(|| {
            Error::host(format!("PR #{pr_number} has no merge commit recorded"))
        })?;

        let point = RollbackPoint {
            commit_sha: merge_sha.clone(),
            tag_name: format!("pr-{pr_number}"),
            description: reason.to_string(),
            created_at: Utc::now(),
            branch_name: pull.base_ref.clone(),
            work_item_id: Some(pr_number.to_string()),
            metadata: HashMap::new(),
        };

        if create_revert_pr {
            let branch = format!("revert-pr-{pr_number}");
            self.git(&["fetch", "origin", &pull.base_ref]).await?;
            self.git(&["checkout", "-b", &branch, &format!("origin/{}", pull.base_ref)])
                .await?;
            self.git(&["revert", "--no-edit", "-m", "1", &merge_sha])
                .await?;
            let revert_sha = self.git(&["rev-parse", "HEAD"]).await?;
            self.git(&["push", "origin", &branch]).await?;

            let revert = host
                .create_pr(
                    &format!("Revert \"{}\"", pull.title),
                    &format!(
                        "Reverts #{pr_number}.\n\n**Reason**: {reason}\n\nMerge commit `{merge_sha}` is reverted with `-m 1`."
                    ),
                    &branch,
                    &pull.base_ref,
                    false,
                )
                .await?;

            info!(pr = pr_number, revert_pr = revert.number, "revert PR opened");
            Ok(RollbackResult {
                success: true,
                rollback_point: point,
                reverted_commits: vec![merge_sha],
                cleaned_branches: Vec::new(),
                revert_commit_sha: Some(revert_sha),
                revert_pr: Some(revert.number),
                error: None,
            })
        } else {
            self.git(&["revert", "--no-edit", "-m", "1", &merge_sha])
                .await?;
            let revert_sha = self.git(&["rev-parse", "HEAD"]).await?;

            info!(pr = pr_number, "PR reverted in place");
            Ok(RollbackResult {
                success: true,
                rollback_point: point,
                reverted_commits: vec![merge_sha],
                cleaned_branches: Vec::new(),
                revert_commit_sha: Some(revert_sha),
                revert_pr: None,
                error: None,
            })
        }
    }

    /// Enumerate rollback points from `rollback-*` tags.
    pub async fn list_rollback_points(&self) -> Result<Vec<RollbackPoint>> {
        let tags = self.git(&["tag", "-l", "rollback-*"]).await?;
        let mut points = Vec::new();

        for tag in tags.lines().filter(|l| !l.is_empty()) {
            let commit_sha = self.git(&["rev-list", "-n", "1", tag]).await?;
            let description = self
                .git(&["tag", "-l", "--format=%(contents:subject)", tag])
                .await
                .unwrap_or_default();

            points.push(RollbackPoint {
                commit_sha,
                tag_name: tag.to_string(),
                description,
                created_at: parse_tag_timestamp(tag).unwrap_or_else(Utc::now),
                branch_name: String::new(),
                work_item_id: parse_tag_work_item(tag),
                metadata: HashMap::new(),
            });
        }

        points.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(points)
    }
}

/// Recover the creation time from a `rollback-[workitem-]yyyymmdd-HHMMSS`
/// tag name.
fn parse_tag_timestamp(tag: &str) -> Option<DateTime<Utc>> {
    let parts: Vec<&str> = tag.split('-').collect();
    if parts.len() < 3 {
        return None;
    }
    let candidate = format!(
        "{}-{}",
        parts[parts.len() - 2],
        parts[parts.len() - 1]
    );
    NaiveDateTime::parse_from_str(&candidate, TAG_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// The optional work item segment between the prefix and the timestamp.
fn parse_tag_work_item(tag: &str) -> Option<String> {
    let rest = tag.strip_prefix("rollback-")?;
    let parts: Vec<&str> = rest.split('-').collect();
    if parts.len() <= 2 {
        return None;
    }
    Some(parts[..parts.len() - 2].join("-"))
}
