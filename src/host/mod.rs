//! External code-host interface: the orchestrator depends on this contract
//! and treats the host itself as a collaborator.

pub mod github;
pub mod types;

use async_trait::async_trait;

use crate::error::Result;
pub use github::{GithubHost, GithubHostConfig};
pub use types::{
    CheckOutcome, CheckRun, Issue, IssueState, MergeMethod, PrChecks, PullRequest,
    RateLimitSnapshot,
};

/// Issue tracker / code host operations the orchestrator relies on.
#[async_trait]
pub trait Host: Send + Sync {
    async fn list_issues(
        &self,
        labels: &[String],
        exclude_labels: &[String],
        state: IssueState,
    ) -> Result<Vec<Issue>>;

    async fn get_issue(&self, number: u64) -> Result<Issue>;

    async fn create_issue(
        &self,
        title: &str,
        body: &str,
        labels: &[String],
        assignees: &[String],
    ) -> Result<Issue>;

    async fn comment(&self, number: u64, body: &str) -> Result<()>;

    async fn add_labels(&self, number: u64, labels: &[String]) -> Result<()>;

    async fn remove_label(&self, number: u64, label: &str) -> Result<()>;

    async fn close_issue(&self, number: u64, comment: Option<&str>) -> Result<()>;

    async fn create_pr(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
        draft: bool,
    ) -> Result<PullRequest>;

    async fn get_pr(&self, number: u64) -> Result<PullRequest>;

    async fn merge_pr(
        &self,
        number: u64,
        method: MergeMethod,
        title: Option<&str>,
        message: Option<&str>,
    ) -> Result<bool>;

    async fn pr_checks(&self, number: u64) -> Result<PrChecks>;

    async fn request_review(&self, number: u64, reviewers: &[String]) -> Result<()>;

    async fn file_contents(&self, path: &str, git_ref: Option<&str>) -> Result<String>;

    /// Remaining API budget, fed into the rate limiter.
    async fn rate_limit(&self) -> Result<RateLimitSnapshot>;
}
