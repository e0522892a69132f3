//! Liveness probes for the orchestrator and its collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use sysinfo::{Disks, System};
use tracing::{info, instrument};

use crate::host::Host;
use crate::runner::ProviderRunner;

/// Status of one health check. Variants are ordered by severity so the
/// overall status is simply the maximum across checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unknown,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Result of a single probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
    pub checked_at: DateTime<Utc>,
    pub duration_ms: f64,
}

/// Full probe sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall_status: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub fn healthy_count(&self) -> usize {
        self.checks
            .iter()
            .filter(|c| c.status == HealthStatus::Healthy)
            .count()
    }

    pub fn unhealthy_count(&self) -> usize {
        self.checks
            .iter()
            .filter(|c| c.status == HealthStatus::Unhealthy)
            .count()
    }
}

/// Probes system resources, the VCS binary, the host, and the runner.
pub struct HealthChecker {
    host: Option<Arc<dyn Host>>,
    runner: Option<Arc<dyn ProviderRunner>>,
    memory_threshold_pct: f64,
    disk_threshold_pct: f64,
    cpu_threshold_pct: f64,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            host: None,
            runner: None,
            memory_threshold_pct: 90.0,
            disk_threshold_pct: 90.0,
            cpu_threshold_pct: 80.0,
        }
    }

    pub fn with_host(mut self, host: Arc<dyn Host>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn ProviderRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Run every probe; overall status is the most severe.
    #[instrument(skip(self))]
    pub async fn check(&self) -> HealthReport {
        let mut checks = vec![self.check_memory(), self.check_disk(), self.check_cpu()];
        checks.push(self.check_git());

        if let Some(host) = &self.host {
            checks.push(Self::check_host(host.as_ref()).await);
        }
        if let Some(runner) = &self.runner {
            checks.push(Self::check_runner(runner.as_ref()).await);
        }

        let overall_status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Unknown);

        info!(
            overall = %overall_status,
            checks = checks.len(),
            "health sweep completed"
        );
        HealthReport {
            overall_status,
            checks,
            timestamp: Utc::now(),
        }
    }

    fn graded(percent: f64, threshold: f64, what: &str) -> (HealthStatus, String) {
        if percent < threshold {
            (HealthStatus::Healthy, format!("{what} usage: {percent:.1}%"))
        } else if percent < 95.0 {
            (
                HealthStatus::Degraded,
                format!("{what} usage high: {percent:.1}%"),
            )
        } else {
            (
                HealthStatus::Unhealthy,
                format!("{what} usage critical: {percent:.1}%"),
            )
        }
    }

    fn check_memory(&self) -> HealthCheckResult {
        let start = Instant::now();
        let mut sys = System::new();
        sys.refresh_memory();

        let total = sys.total_memory();
        let used = sys.used_memory();
        let (status, message, details) = if total == 0 {
            (
                HealthStatus::Unknown,
                "memory information unavailable".to_string(),
                HashMap::new(),
            )
        } else {
            let percent = used as f64 / total as f64 * 100.0;
            let (status, message) = Self::graded(percent, self.memory_threshold_pct, "Memory");
            let mut details = HashMap::new();
            details.insert("percent_used".to_string(), serde_json::json!(percent));
            details.insert(
                "total_gb".to_string(),
                serde_json::json!(total as f64 / 1e9),
            );
            (status, message, details)
        };

        HealthCheckResult {
            name: "memory".to_string(),
            status,
            message,
            details,
            checked_at: Utc::now(),
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        }
    }

    fn check_disk(&self) -> HealthCheckResult {
        let start = Instant::now();
        let disks = Disks::new_with_refreshed_list();

        // The most-used mounted disk decides the status.
        let mut worst_percent: Option<f64> = None;
        for disk in disks.list() {
            let total = disk.total_space();
            if total == 0 {
                continue;
            }
            let used = total - disk.available_space();
            let percent = used as f64 / total as f64 * 100.0;
            worst_percent = Some(worst_percent.map_or(percent, |w: f64| w.max(percent)));
        }

        let (status, message) = match worst_percent {
            Some(percent) => Self::graded(percent, self.disk_threshold_pct, "Disk"),
            None => (
                HealthStatus::Unknown,
                "no disks reported".to_string(),
            ),
        };

        HealthCheckResult {
            name: "disk_space".to_string(),
            status,
            message,
            details: HashMap::new(),
            checked_at: Utc::now(),
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        }
    }

    fn check_cpu(&self) -> HealthCheckResult {
        let start = Instant::now();
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        // A second refresh after the minimum interval gives a usable delta.
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_cpu_usage();

        let percent = sys.global_cpu_usage() as f64;
        let (status, message) = Self::graded(percent, self.cpu_threshold_pct, "CPU");

        HealthCheckResult {
            name: "cpu".to_string(),
            status,
            message,
            details: HashMap::new(),
            checked_at: Utc::now(),
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        }
    }

    fn check_git(&self) -> HealthCheckResult {
        let start = Instant::now();
        let (status, message) = match which::which("git") {
            Ok(path) => (
                HealthStatus::Healthy,
                format!("git available at {}", path.display()),
            ),
            Err(_) => (HealthStatus::Unhealthy, "git binary not found".to_string()),
        };

        HealthCheckResult {
            name: "git".to_string(),
            status,
            message,
            details: HashMap::new(),
            checked_at: Utc::now(),
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        }
    }

    async fn check_host(host: &dyn Host) -> HealthCheckResult {
        let start = Instant::now();
        let (status, message) = match host.rate_limit().await {
            Ok(snapshot) => (
                HealthStatus::Healthy,
                format!(
                    "host reachable ({}/{} requests remaining)",
                    snapshot.remaining, snapshot.limit
                ),
            ),
            Err(e) => (HealthStatus::Unhealthy, format!("host unreachable: {e}")),
        };

        HealthCheckResult {
            name: "host".to_string(),
            status,
            message,
            details: HashMap::new(),
            checked_at: Utc::now(),
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        }
    }

    async fn check_runner(runner: &dyn ProviderRunner) -> HealthCheckResult {
        let start = Instant::now();
        let (status, message) = if runner.health_check().await {
            (HealthStatus::Healthy, "provider runner reachable".to_string())
        } else {
            (
                HealthStatus::Unhealthy,
                "provider runner not invocable".to_string(),
            )
        };

        HealthCheckResult {
            name: "provider_runner".to_string(),
            status,
            message,
            details: HashMap::new(),
            checked_at: Utc::now(),
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}
