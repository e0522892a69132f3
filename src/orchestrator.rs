//! Process-wide wiring and the long-running control loop.
//!
//! One orchestrator owns every component; cycles run strictly sequentially
//! within the process, never interleaved.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use crate::analytics::AnalyticsCollector;
use crate::config::OrchestratorConfig;
use crate::cycles::roadmap::RoadmapCycle;
use crate::cycles::{LearningCycle, LearningCycleReport, RoadmapCycleReport};
use crate::deliberation::DeliberationEngine;
use crate::error::Result;
use crate::host::{GithubHost, GithubHostConfig, Host};
use crate::ledger::Ledger;
use crate::patterns::PatternDetector;
use crate::prompts::PromptLibrary;
use crate::runner::{ProviderRunner, SubprocessRunner, SubprocessRunnerConfig};
use crate::safety::{ApprovalWorkflow, CostTracker, RateLimiter, RiskAssessor, SafetyManager};
use crate::scheduler::{CycleScheduler, HealthChecker, HealthReport, HealthStatus};

/// How long the run loop sleeps between ticks.
const TICK_INTERVAL: Duration = Duration::from_secs(600);

/// What one orchestrator tick did.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickReport {
    pub health: Option<HealthStatus>,
    pub learning: Option<LearningCycleReport>,
    pub roadmap: Option<RoadmapCycleReport>,
}

/// The long-running control plane.
pub struct Orchestrator {
    config: OrchestratorConfig,
    ledger: Arc<Ledger>,
    prompts: Arc<Mutex<PromptLibrary>>,
    runner: Arc<dyn ProviderRunner>,
    host: Arc<dyn Host>,
    pub safety: SafetyManager,
    pub approvals: ApprovalWorkflow,
    pub rate_limiter: RateLimiter,
    pub cost_tracker: CostTracker,
    learning_cycle: LearningCycle,
    roadmap_cycle: RoadmapCycle,
    learning_schedule: CycleScheduler,
    roadmap_schedule: CycleScheduler,
    health: HealthChecker,
}

impl Orchestrator {
    /// Build the orchestrator with its production collaborators: the
    /// subprocess runner and the GitHub host.
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        let mut runner_config = SubprocessRunnerConfig::new(&config.runner_binary);
        if let Some(providers) = &config.providers {
            runner_config = runner_config.with_providers(providers.clone());
        }
        let runner: Arc<dyn ProviderRunner> = Arc::new(SubprocessRunner::new(runner_config));

        let host: Arc<dyn Host> = Arc::new(GithubHost::new(GithubHostConfig::new(
            &config.repository,
            &config.host_token,
        ))?);

        Self::with_collaborators(config, runner, host)
    }

    /// Build with externally supplied collaborators (tests, alternate
    /// hosts or runners).
    pub fn with_collaborators(
        config: OrchestratorConfig,
        runner: Arc<dyn ProviderRunner>,
        host: Arc<dyn Host>,
    ) -> Result<Self> {
        let ledger = Arc::new(Ledger::open(config.ledger_path())?);
        // Operations left open by a crashed process become unknown failures.
        ledger.fail_stale_operations(chrono::Utc::now())?;

        let mut prompt_library = PromptLibrary::open(config.prompts_path())?;
        if let Some(context) = ledger.load_repository_context()? {
            prompt_library.bind_repository_context(context);
        }
        let prompts = Arc::new(Mutex::new(prompt_library));

        let detector = PatternDetector::new(Arc::clone(&ledger))
            .with_min_occurrences(config.pattern_min_occurrences)
            .with_lookback_days(config.pattern_lookback_days);

        let learning_cycle = LearningCycle::new(
            Arc::clone(&ledger),
            detector,
            DeliberationEngine::new(Arc::clone(&runner)),
            Arc::clone(&prompts),
        )
        .with_auto_apply(config.auto_apply_improvements);

        let roadmap_cycle = RoadmapCycle::new(
            Arc::clone(&ledger),
            Arc::clone(&runner),
            Arc::clone(&host),
            &config.repository_path,
        )
        .with_auto_create_issues(config.auto_create_issues);

        let safety = SafetyManager::new(Arc::clone(&runner));
        let approvals = ApprovalWorkflow::new()
            .with_risk_assessor(Arc::new(RiskAssessor::new(Arc::clone(&runner))))
            .with_auto_approve_low_risk(config.auto_approve_low_risk);

        let mut cost_tracker = CostTracker::new();
        if let Some(budget) = config.cost_budget {
            cost_tracker = cost_tracker.with_budget(budget);
        }

        let health = HealthChecker::new()
            .with_host(Arc::clone(&host))
            .with_runner(Arc::clone(&runner));

        Ok(Self {
            learning_schedule: CycleScheduler::open(
                config.learning_frequency,
                config.learning_schedule_path(),
            ),
            roadmap_schedule: CycleScheduler::open(
                config.roadmap_frequency,
                config.roadmap_schedule_path(),
            ),
            rate_limiter: RateLimiter::open(config.rate_limiter_path()),
            cost_tracker,
            safety,
            approvals,
            learning_cycle,
            roadmap_cycle,
            health,
            ledger,
            prompts,
            runner,
            host,
            config,
        })
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn prompts(&self) -> &Arc<Mutex<PromptLibrary>> {
        &self.prompts
    }

    pub fn analytics(&self) -> AnalyticsCollector {
        AnalyticsCollector::new(Arc::clone(&self.ledger))
    }

    pub fn learning_cycle(&self) -> &LearningCycle {
        &self.learning_cycle
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    /// Probe liveness of the process and its collaborators.
    pub async fn check_health(&self) -> HealthReport {
        self.health.check().await
    }

    /// Feed the host's remaining API budget into the rate limiter.
    pub async fn refresh_host_rate_limit(&self) -> Result<()> {
        let snapshot = self.host.rate_limit().await?;
        self.rate_limiter.update(
            "host",
            snapshot.limit,
            snapshot.remaining,
            snapshot.reset_at,
        )
    }

    /// Run the learning cycle now, regardless of schedule.
    pub async fn run_learning_cycle(&self) -> Result<LearningCycleReport> {
        let report = self.learning_cycle.run().await?;
        let stats = self.runner.statistics();
        info!(
            runner_invocations = stats.invocations,
            runner_cost = stats.total_cost,
            "learning cycle finished"
        );
        Ok(report)
    }

    /// Run the roadmap cycle now, regardless of schedule.
    pub async fn run_roadmap_cycle(&self) -> Result<RoadmapCycleReport> {
        match self.roadmap_cycle.run(&self.config.project_goals).await {
            Ok(report) => {
                self.roadmap_schedule
                    .mark_complete(&report.cycle_id, report.completed_at)?;
                Ok(report)
            }
            Err(e) => {
                self.roadmap_schedule.mark_failed(&e.to_string())?;
                Err(e)
            }
        }
    }

    /// One tick: health sweep, then any due cycle, strictly in sequence.
    /// Cycle failures are recorded and do not abort the tick.
    pub async fn run_once(&self, force: bool) -> TickReport {
        let mut report = TickReport::default();

        let health = self.check_health().await;
        let status = health.overall_status;
        report.health = Some(status);
        if status == HealthStatus::Unhealthy && !force {
            warn!("skipping cycles: orchestrator unhealthy");
            return report;
        }

        if let Err(e) = self.refresh_host_rate_limit().await {
            warn!(error = %e, "host rate limit refresh failed");
        }

        if self.learning_schedule.should_generate(force) {
            match self.run_learning_cycle().await {
                Ok(learning) => {
                    let cycle_id = format!(
                        "learning-{}",
                        chrono::Utc::now().format("%Y%m%d-%H%M%S")
                    );
                    if let Err(e) = self
                        .learning_schedule
                        .mark_complete(&cycle_id, chrono::Utc::now())
                    {
                        warn!(error = %e, "could not persist learning schedule");
                    }
                    report.learning = Some(learning);
                }
                Err(e) => {
                    warn!(error = %e, "learning cycle failed");
                    let _ = self.learning_schedule.mark_failed(&e.to_string());
                }
            }
        }

        if self.roadmap_schedule.should_generate(force) {
            match self.run_roadmap_cycle().await {
                Ok(roadmap) => report.roadmap = Some(roadmap),
                Err(e) => warn!(error = %e, "roadmap cycle failed"),
            }
        }

        report
    }

    /// Run until the process is stopped, ticking on a fixed interval.
    pub async fn run(&self) -> Result<()> {
        info!("orchestrator started");
        loop {
            let tick = self.run_once(false).await;
            info!(
                health = ?tick.health,
                ran_learning = tick.learning.is_some(),
                ran_roadmap = tick.roadmap.is_some(),
                "tick completed"
            );
            tokio::time::sleep(TICK_INTERVAL).await;
        }
    }
}
