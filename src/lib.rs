//! # reflex-core
//!
//! A self-reflexive development orchestrator: a long-running control plane
//! that observes a project's operational history, mines recurring failure
//! patterns, consults an ensemble of external reasoning providers, and
//! applies the results either to its own prompt templates (learning cycle)
//! or as tracked work items on the code host (roadmap cycle). Every
//! externally-visible mutation passes through the safety arbitration layer.
//!
//! ## Core Components
//!
//! - **Ledger**: durable relational record of operations and side facts
//! - **Patterns**: failure grouping with density-derived severity
//! - **Deliberation**: multi-provider root cause → lesson → improvements
//! - **Safety**: guards, risk consensus, rate/cost limits, approvals,
//!   rollback, and the highest-risk-wins decision matrix
//!
//! ## Example
//!
//! ```rust,ignore
//! use reflex_core::{Orchestrator, OrchestratorConfig};
//!
//! let config = OrchestratorConfig::load("config.json")?;
//! let orchestrator = Orchestrator::new(config)?;
//! orchestrator.run().await?;
//! ```

pub mod analytics;
pub mod codebase;
pub mod config;
pub mod cycles;
pub mod deliberation;
pub mod error;
pub mod host;
pub mod ledger;
pub mod orchestrator;
pub mod patterns;
pub mod prompts;
pub mod runner;
pub mod safety;
pub mod scheduler;

// Re-exports for convenience
pub use analytics::{AnalyticsCollector, InsightsGenerator, OperationsSummary};
pub use codebase::{CodebaseAnalysis, CodebaseAnalyzer, CodebaseMetrics, CodebasePatterns};
pub use config::OrchestratorConfig;
pub use cycles::{
    LearningCycle, LearningCycleReport, LearningRecord, RoadmapCycle, RoadmapCycleReport,
};
pub use deliberation::{
    DeliberationEngine, EffectivenessValidation, ImprovementRecommendations, LearningLesson,
    Recommendation, RootCauseAnalysis,
};
pub use error::{Error, ErrorKind, Result};
pub use host::{
    CheckOutcome, GithubHost, GithubHostConfig, Host, Issue, IssueState, MergeMethod, PrChecks,
    PullRequest, RateLimitSnapshot,
};
pub use ledger::{
    CodeGenerationFact, IssueProcessingFact, Ledger, OperationFact, OperationId, OperationKind,
    OperationRecord, PrManagementFact, RepositoryContext, RoadmapFact, SCHEMA_VERSION,
};
pub use orchestrator::{Orchestrator, TickReport};
pub use patterns::{CommonAttributes, FailurePattern, PatternDetector, Severity};
pub use prompts::{PromptLibrary, PromptStatistics, PromptTemplate};
pub use runner::{
    ProviderRunner, RunnerResponse, RunnerStats, Strategy, SubprocessRunner,
    SubprocessRunnerConfig,
};
pub use safety::{
    ApprovalDecision, ApprovalRequest, ApprovalWorkflow, BreakingChangeAnalysis,
    BreakingChangeDetector, BreakingSeverity, CostTracker, DetectedOperation, OperationClass,
    OperationGuard, RateLimiter, RiskAssessment, RiskAssessor, RiskLevel, RollbackManager,
    RollbackPoint, RollbackResult, SafetyCheckResult, SafetyManager,
};
pub use scheduler::{
    CycleFrequency, CycleScheduler, HealthChecker, HealthReport, HealthStatus,
};
