//! Safety arbitration layer: guards, risk assessment, rate and cost
//! controls, approvals, rollback, and the decision matrix that binds them.

pub mod approval;
pub mod breaking;
pub mod cost;
pub mod guard;
pub mod manager;
pub mod rate_limit;
pub mod risk;
pub mod rollback;
pub mod types;

pub use approval::{ApprovalDecision, ApprovalRequest, ApprovalStatus, ApprovalWorkflow};
pub use breaking::BreakingChangeDetector;
pub use cost::{CostTracker, SpendSummary};
pub use guard::OperationGuard;
pub use manager::SafetyManager;
pub use rate_limit::{RateLimitState, RateLimiter, ThrottleStatus};
pub use risk::RiskAssessor;
pub use rollback::{RollbackManager, RollbackPoint, RollbackResult};
pub use types::{
    BreakingChangeAnalysis, BreakingSeverity, DetectedOperation, OperationClass, RiskAssessment,
    RiskLevel, SafetyCheckResult,
};
