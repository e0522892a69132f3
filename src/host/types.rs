//! Types exchanged with the upstream issue tracker / code host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tracked issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub state: String,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default)]
    pub url: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub state: String,
    #[serde(default)]
    pub merged: bool,
    pub merge_commit_sha: Option<String>,
    pub head_ref: String,
    pub base_ref: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub url: String,
}

/// Issue state filter for listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    Open,
    Closed,
    All,
}

impl std::fmt::Display for IssueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::All => "all",
        };
        write!(f, "{}", s)
    }
}

/// Merge method for pull requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    Merge,
    Squash,
    Rebase,
}

impl std::fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Merge => "merge",
            Self::Squash => "squash",
            Self::Rebase => "rebase",
        };
        write!(f, "{}", s)
    }
}

/// Overall outcome of a PR's check suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Passed,
    Failed,
    Pending,
    NoChecks,
    Unknown,
}

/// One check run on a PR head.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRun {
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
}

/// Roll-up of a PR's checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrChecks {
    pub overall: CheckOutcome,
    pub checks: Vec<CheckRun>,
}

impl PrChecks {
    /// Derive the overall outcome from individual check runs: any failure
    /// fails the suite, any incomplete run leaves it pending.
    pub fn roll_up(checks: Vec<CheckRun>) -> Self {
        if checks.is_empty() {
            return Self {
                overall: CheckOutcome::NoChecks,
                checks,
            };
        }

        let mut pending = false;
        let mut failed = false;
        for check in &checks {
            if check.status != "completed" {
                pending = true;
                continue;
            }
            match check.conclusion.as_deref() {
                Some("success") | Some("neutral") | Some("skipped") => {}
                Some("failure") | Some("timed_out") | Some("cancelled")
                | Some("action_required") => failed = true,
                _ => pending = true,
            }
        }

        let overall = if failed {
            CheckOutcome::Failed
        } else if pending {
            CheckOutcome::Pending
        } else {
            CheckOutcome::Passed
        };
        Self { overall, checks }
    }
}

/// Rate limit snapshot from the host, fed into the rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}
