//! GitHub REST implementation of the [`Host`] trait.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::types::*;
use super::Host;
use crate::error::{Error, Result};

const DEFAULT_BASE_URL: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("reflex-core/", env!("CARGO_PKG_VERSION"));
const READ_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Configuration for the GitHub host client.
#[derive(Debug, Clone)]
pub struct GithubHostConfig {
    /// Repository in `owner/name` form
    pub repository: String,
    pub token: String,
    /// Base URL override (enterprise installs, tests)
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl GithubHostConfig {
    pub fn new(repository: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            token: token.into(),
            base_url: None,
            timeout_secs: 30,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }
}

/// GitHub REST v3 client.
pub struct GithubHost {
    config: GithubHostConfig,
    http: Client,
}

impl GithubHost {
    pub fn new(config: GithubHostConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Config(format!("building host client: {e}")))?;
        Ok(Self { config, http })
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}",
            self.base_url(),
            self.config.repository,
            path
        )
    }

    /// Read requests are retried; write requests surface immediately.
    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        let is_read = method == Method::GET;
        let attempts = if is_read { READ_RETRIES } else { 1 };

        let mut last_error = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(RETRY_DELAY).await;
            }

            let mut request = self
                .http
                .request(method.clone(), url)
                .header("Authorization", format!("Bearer {}", self.config.token))
                .header("Accept", "application/vnd.github+json");
            if let Some(body) = &body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        if status == StatusCode::NO_CONTENT {
                            return Ok(Value::Null);
                        }
                        return response
                            .json()
                            .await
                            .map_err(|e| Error::host(format!("decoding response: {e}")));
                    }
                    let text = response.text().await.unwrap_or_default();
                    let err = Error::host(format!("{method} {url}: {status}: {text}"));
                    // Client errors are not transient; do not retry.
                    if status.is_client_error() {
                        return Err(err);
                    }
                    warn!(attempt, %status, url, "host request failed");
                    last_error = Some(err);
                }
                Err(e) => {
                    warn!(attempt, error = %e, url, "host request errored");
                    last_error = Some(Error::host(format!("{method} {url}: {e}")));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::host("request never attempted")))
    }
}

#[derive(Debug, Deserialize)]
struct ApiLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct ApiIssue {
    number: u64,
    title: String,
    body: Option<String>,
    #[serde(default)]
    labels: Vec<ApiLabel>,
    state: String,
    #[serde(default)]
    assignees: Vec<ApiUser>,
    html_url: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    /// Present when the "issue" is actually a pull request
    pull_request: Option<Value>,
}

impl From<ApiIssue> for Issue {
    fn from(api: ApiIssue) -> Self {
        Issue {
            number: api.number,
            title: api.title,
            body: api.body.unwrap_or_default(),
            labels: api.labels.into_iter().map(|l| l.name).collect(),
            state: api.state,
            assignees: api.assignees.into_iter().map(|a| a.login).collect(),
            url: api.html_url.unwrap_or_default(),
            created_at: api.created_at,
            updated_at: api.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiPull {
    number: u64,
    title: String,
    body: Option<String>,
    state: String,
    #[serde(default)]
    merged: bool,
    merge_commit_sha: Option<String>,
    head: ApiRef,
    base: ApiRef,
    #[serde(default)]
    draft: bool,
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiRef {
    #[serde(rename = "ref")]
    git_ref: String,
    sha: Option<String>,
}

impl From<ApiPull> for PullRequest {
    fn from(api: ApiPull) -> Self {
        PullRequest {
            number: api.number,
            title: api.title,
            body: api.body.unwrap_or_default(),
            state: api.state,
            merged: api.merged,
            merge_commit_sha: api.merge_commit_sha,
            head_ref: api.head.git_ref,
            base_ref: api.base.git_ref,
            draft: api.draft,
            url: api.html_url.unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Host for GithubHost {
    async fn list_issues(
        &self,
        labels: &[String],
        exclude_labels: &[String],
        state: IssueState,
    ) -> Result<Vec<Issue>> {
        let mut url = format!("{}?state={state}&per_page=100", self.repo_url("issues"));
        if !labels.is_empty() {
            url.push_str(&format!("&labels={}", labels.join(",")));
        }

        let value = self.request(Method::GET, &url, None).await?;
        let issues: Vec<ApiIssue> = serde_json::from_value(value)?;
        Ok(issues
            .into_iter()
            .filter(|issue| issue.pull_request.is_none())
            .map(Issue::from)
            .filter(|issue| {
                !issue
                    .labels
                    .iter()
                    .any(|label| exclude_labels.contains(label))
            })
            .collect())
    }

    async fn get_issue(&self, number: u64) -> Result<Issue> {
        let url = self.repo_url(&format!("issues/{number}"));
        let value = self.request(Method::GET, &url, None).await?;
        let issue: ApiIssue = serde_json::from_value(value)?;
        Ok(issue.into())
    }

    async fn create_issue(
        &self,
        title: &str,
        body: &str,
        labels: &[String],
        assignees: &[String],
    ) -> Result<Issue> {
        let url = self.repo_url("issues");
        let payload = json!({
            "title": title,
            "body": body,
            "labels": labels,
            "assignees": assignees,
        });
        let value = self.request(Method::POST, &url, Some(payload)).await?;
        let issue: ApiIssue = serde_json::from_value(value)?;
        debug!(number = issue.number, "issue created");
        Ok(issue.into())
    }

    async fn comment(&self, number: u64, body: &str) -> Result<()> {
        let url = self.repo_url(&format!("issues/{number}/comments"));
        self.request(Method::POST, &url, Some(json!({ "body": body })))
            .await?;
        Ok(())
    }

    async fn add_labels(&self, number: u64, labels: &[String]) -> Result<()> {
        let url = self.repo_url(&format!("issues/{number}/labels"));
        self.request(Method::POST, &url, Some(json!({ "labels": labels })))
            .await?;
        Ok(())
    }

    async fn remove_label(&self, number: u64, label: &str) -> Result<()> {
        let url = self.repo_url(&format!("issues/{number}/labels/{label}"));
        self.request(Method::DELETE, &url, None).await?;
        Ok(())
    }

    async fn close_issue(&self, number: u64, comment: Option<&str>) -> Result<()> {
        if let Some(comment) = comment {
            self.comment(number, comment).await?;
        }
        let url = self.repo_url(&format!("issues/{number}"));
        self.request(Method::PATCH, &url, Some(json!({ "state": "closed" })))
            .await?;
        Ok(())
    }

    async fn create_pr(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
        draft: bool,
    ) -> Result<PullRequest> {
        let url = self.repo_url("pulls");
        let payload = json!({
            "title": title,
            "body": body,
            "head": head,
            "base": base,
            "draft": draft,
        });
        let value = self.request(Method::POST, &url, Some(payload)).await?;
        let pull: ApiPull = serde_json::from_value(value)?;
        Ok(pull.into())
    }

    async fn get_pr(&self, number: u64) -> Result<PullRequest> {
        let url = self.repo_url(&format!("pulls/{number}"));
        let value = self.request(Method::GET, &url, None).await?;
        let pull: ApiPull = serde_json::from_value(value)?;
        Ok(pull.into())
    }

    async fn merge_pr(
        &self,
        number: u64,
        method: MergeMethod,
        title: Option<&str>,
        message: Option<&str>,
    ) -> Result<bool> {
        let url = self.repo_url(&format!("pulls/{number}/merge"));
        let mut payload = json!({ "merge_method": method.to_string() });
        if let Some(title) = title {
            payload["commit_title"] = json!(title);
        }
        if let Some(message) = message {
            payload["commit_message"] = json!(message);
        }

        let value = self.request(Method::PUT, &url, Some(payload)).await?;
        Ok(value
            .get("merged")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn pr_checks(&self, number: u64) -> Result<PrChecks> {
        let url = self.repo_url(&format!("pulls/{number}"));
        let value = self.request(Method::GET, &url, None).await?;
        let pull: ApiPull = serde_json::from_value(value)?;
        let head_sha = pull
            .head
            .sha
            .ok_or_else(|| Error::host(format!("PR {number} missing head sha")))?;

        let url = self.repo_url(&format!("commits/{head_sha}/check-runs"));
        let value = self.request(Method::GET, &url, None).await?;

        #[derive(Debug, Deserialize)]
        struct ApiCheckRun {
            name: String,
            status: String,
            conclusion: Option<String>,
        }
        #[derive(Debug, Deserialize)]
        struct ApiCheckRuns {
            #[serde(default)]
            check_runs: Vec<ApiCheckRun>,
        }

        let runs: ApiCheckRuns = serde_json::from_value(value)?;
        let checks = runs
            .check_runs
            .into_iter()
            .map(|run| CheckRun {
                name: run.name,
                status: run.status,
                conclusion: run.conclusion,
            })
            .collect();
        Ok(PrChecks::roll_up(checks))
    }

    async fn request_review(&self, number: u64, reviewers: &[String]) -> Result<()> {
        let url = self.repo_url(&format!("pulls/{number}/requested_reviewers"));
        self.request(Method::POST, &url, Some(json!({ "reviewers": reviewers })))
            .await?;
        Ok(())
    }

    async fn file_contents(&self, path: &str, git_ref: Option<&str>) -> Result<String> {
        let mut url = self.repo_url(&format!("contents/{path}"));
        if let Some(git_ref) = git_ref {
            url.push_str(&format!("?ref={git_ref}"));
        }

        let value = self.request(Method::GET, &url, None).await?;
        let content = value
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::host(format!("no content for {path}")))?;

        decode_base64(&content.replace(['\n', '\r'], ""))
    }

    async fn rate_limit(&self) -> Result<RateLimitSnapshot> {
        let url = format!("{}/rate_limit", self.base_url());
        let value = self.request(Method::GET, &url, None).await?;
        let core = value
            .get("resources")
            .and_then(|r| r.get("core"))
            .ok_or_else(|| Error::host("rate limit payload missing resources.core"))?;

        let limit = core.get("limit").and_then(Value::as_u64).unwrap_or(0);
        let remaining = core.get("remaining").and_then(Value::as_u64).unwrap_or(0);
        let reset = core.get("reset").and_then(Value::as_i64).unwrap_or(0);

        Ok(RateLimitSnapshot {
            limit,
            remaining,
            reset_at: Utc
                .timestamp_opt(reset, 0)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }
}

/// Minimal standard-alphabet base64 decoder for content payloads.
fn decode_base64(input: &str) -> Result<String> {
    const ALPHABET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    let mut table = [255u8; 256];
    for (i, &c) in ALPHABET.iter().enumerate() {
        table[c as usize] = i as u8;
    }

    let input = input.trim_end_matches('=');
    let mut bytes = Vec::with_capacity(input.len() * 3 / 4);
    let mut buffer: u32 = 0;
    let mut bits = 0;

    for c in input.bytes() {
        let value = table[c as usize];
        if value == 255 {
            return Err(Error::host(format!("invalid base64 character: {c}")));
        }
        buffer = (buffer << 6) | value as u32;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            bytes.push((buffer >> bits) as u8);
        }
    }

    String::from_utf8(bytes).map_err(|e| Error::host(format!("content is not UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_base64() {
        assert_eq!(decode_base64("aGVsbG8=").unwrap(), "hello");
        assert_eq!(decode_base64("aGVsbG8gd29ybGQ=").unwrap(), "hello world");
        assert_eq!(decode_base64("").unwrap(), "");
        assert!(decode_base64("not base64 !!!").is_err());
    }

    #[test]
    fn test_repo_url_shape() {
        let host = GithubHost::new(GithubHostConfig::new("acme/widgets", "token")).unwrap();
        assert_eq!(
            host.repo_url("issues/5"),
            "https://api.github.com/repos/acme/widgets/issues/5"
        );
    }

    #[test]
    fn test_api_issue_conversion() {
        let api = ApiIssue {
            number: 7,
            title: "Fix flaky test".to_string(),
            body: None,
            labels: vec![ApiLabel {
                name: "bug".to_string(),
            }],
            state: "open".to_string(),
            assignees: vec![ApiUser {
                login: "alice".to_string(),
            }],
            html_url: None,
            created_at: None,
            updated_at: None,
            pull_request: None,
        };
        let issue: Issue = api.into();
        assert_eq!(issue.number, 7);
        assert_eq!(issue.body, "");
        assert_eq!(issue.labels, vec!["bug".to_string()]);
        assert_eq!(issue.assignees, vec!["alice".to_string()]);
    }
}
