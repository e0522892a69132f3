//! Subprocess adapter over the external multi-provider reasoning runner.
//!
//! The runner executable receives the strategy, timeout, and optional
//! provider subset as arguments and the prompt on stdin; it prints a single
//! JSON document on stdout. Nonzero exit becomes a failed response carrying
//! the stderr text; expiry of the timeout kills the subprocess.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::types::{RunnerDocument, RunnerResponse, RunnerStats, Strategy};
use crate::error::{Error, Result};

/// Language-model-neutral client that fans one prompt to N providers.
#[async_trait]
pub trait ProviderRunner: Send + Sync {
    /// Execute one query under the named strategy, bounded by `timeout`.
    ///
    /// Runner-level failures (timeout, nonzero exit, malformed output) are
    /// reported inside the returned response with `success = false`; `Err`
    /// is reserved for failures to invoke the runner at all.
    async fn query(
        &self,
        prompt: &str,
        strategy: Strategy,
        timeout: Duration,
    ) -> Result<RunnerResponse>;

    /// Whether the runner looks invocable right now.
    async fn health_check(&self) -> bool;

    /// Running spend counters since construction.
    fn statistics(&self) -> RunnerStats;
}

/// Configuration for the subprocess runner.
#[derive(Debug, Clone)]
pub struct SubprocessRunnerConfig {
    /// Path or name of the runner executable
    pub binary: String,
    /// Optional provider subset forwarded as `--providers a,b,c`
    pub providers: Option<Vec<String>>,
}

impl SubprocessRunnerConfig {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            providers: None,
        }
    }

    pub fn with_providers(mut self, providers: Vec<String>) -> Self {
        self.providers = Some(providers);
        self
    }
}

/// [`ProviderRunner`] backed by an external executable.
pub struct SubprocessRunner {
    config: SubprocessRunnerConfig,
    stats: Arc<Mutex<RunnerStats>>,
}

impl SubprocessRunner {
    pub fn new(config: SubprocessRunnerConfig) -> Self {
        Self {
            config,
            stats: Arc::new(Mutex::new(RunnerStats::default())),
        }
    }

    fn resolve_binary(&self) -> Result<PathBuf> {
        which::which(&self.config.binary)
            .map_err(|e| Error::provider(format!("runner binary '{}': {e}", self.config.binary)))
    }

    fn record(&self, response: &RunnerResponse) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.record(response);
        }
    }

    async fn invoke(
        &self,
        prompt: &str,
        strategy: Strategy,
        timeout: Duration,
    ) -> Result<RunnerResponse> {
        let binary = self.resolve_binary()?;

        let mut cmd = Command::new(&binary);
        cmd.arg("query")
            .arg("--strategy")
            .arg(strategy.to_string())
            .arg("--timeout-secs")
            .arg(timeout.as_secs().to_string());
        if let Some(providers) = &self.config.providers {
            cmd.arg("--providers").arg(providers.join(","));
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::provider(format!("spawning runner: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A runner that already exited (or answered early) may have
            // closed its stdin; the exit status carries the real outcome.
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                debug!(error = %e, "runner closed stdin before reading prompt");
            }
            drop(stdin);
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => {
                result.map_err(|e| Error::provider(format!("waiting for runner: {e}")))?
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "runner query timed out");
                return Ok(RunnerResponse::failed(strategy, "timeout"));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(exit = ?output.status.code(), "runner exited nonzero");
            return Ok(RunnerResponse::failed(
                strategy,
                if stderr.is_empty() {
                    format!("runner exited with status {:?}", output.status.code())
                } else {
                    stderr
                },
            ));
        }

        let document: RunnerDocument = match serde_json::from_slice(&output.stdout) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "runner produced malformed output");
                return Ok(RunnerResponse::failed(
                    strategy,
                    format!("malformed runner output: {e}"),
                ));
            }
        };

        Ok(RunnerResponse {
            responses: document.responses,
            strategy,
            total_tokens: document.total_tokens,
            total_cost: document.total_cost,
            success: true,
            error: None,
            summary: document.summary,
        })
    }
}

#[async_trait]
impl ProviderRunner for SubprocessRunner {
    async fn query(
        &self,
        prompt: &str,
        strategy: Strategy,
        timeout: Duration,
    ) -> Result<RunnerResponse> {
        debug!(
            strategy = %strategy,
            timeout_secs = timeout.as_secs(),
            prompt_bytes = prompt.len(),
            "runner query started"
        );

        let response = self.invoke(prompt, strategy, timeout).await?;
        self.record(&response);

        info!(
            strategy = %strategy,
            success = response.success,
            providers = response.responses.len(),
            tokens = response.total_tokens,
            cost = response.total_cost,
            "runner query finished"
        );
        Ok(response)
    }

    async fn health_check(&self) -> bool {
        self.resolve_binary().is_ok()
    }

    fn statistics(&self) -> RunnerStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }
}
