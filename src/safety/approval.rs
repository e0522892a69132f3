//! Human approval workflow for gated operations.
//!
//! Requests move PENDING → APPROVED | DENIED | TIMEOUT | CANCELLED. A
//! decision resolves any in-flight wait; expiry is computed from the
//! request's window, never stored. Pending requests live in memory only and
//! do not survive a restart.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

use super::risk::RiskAssessor;
use super::types::{DetectedOperation, OperationClass, RiskLevel};
use crate::error::{Error, Result};

pub const DEFAULT_TIMEOUT_HOURS: f64 = 24.0;
const EXPIRING_SOON_HOURS: f64 = 1.0;

/// Status of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Timeout,
    Cancelled,
}

/// A request for human approval of an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub operation: String,
    pub risk_level: RiskLevel,
    pub concerns: Vec<String>,
    pub context: Value,
    pub timeout_hours: f64,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRequest {
    fn new(
        operation: String,
        risk_level: RiskLevel,
        concerns: Vec<String>,
        context: Value,
        timeout_hours: f64,
    ) -> Self {
        let created_at = Utc::now();
        let request_id = derive_request_id(&operation, created_at);
        Self {
            request_id,
            operation,
            risk_level,
            concerns,
            context,
            timeout_hours,
            created_at,
        }
    }

    pub fn timeout_at(&self) -> DateTime<Utc> {
        self.created_at
            + ChronoDuration::milliseconds((self.timeout_hours * 3_600_000.0) as i64)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.timeout_at()
    }

    pub fn hours_remaining(&self) -> f64 {
        let remaining = self.timeout_at() - Utc::now();
        (remaining.num_milliseconds() as f64 / 3_600_000.0).max(0.0)
    }
}

/// Unique request id from the operation name and creation second.
fn derive_request_id(operation: &str, created_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    hasher.update(created_at.timestamp().to_be_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    format!("approval-{operation}-{hex}")
}

/// Decision on an approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub request_id: String,
    pub approved: bool,
    pub auto_approved: bool,
    pub risk_level: RiskLevel,
    pub rationale: String,
    pub decided_by: String,
    pub decided_at: DateTime<Utc>,
}

/// Summary of outstanding approval requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSummary {
    pub total_pending: usize,
    pub by_risk_level: BTreeMap<String, usize>,
    pub by_operation: BTreeMap<String, usize>,
    /// Requests with under one hour remaining
    pub expiring_soon: Vec<String>,
}

type NotificationCallback = Box<dyn Fn(&ApprovalRequest) + Send + Sync>;

struct PendingEntry {
    request: ApprovalRequest,
    resolver: Option<oneshot::Sender<ApprovalDecision>>,
}

struct WorkflowState {
    pending: HashMap<String, PendingEntry>,
    history: Vec<ApprovalDecision>,
}

/// Async request/decide/expire engine for human-gated operations.
pub struct ApprovalWorkflow {
    state: Arc<Mutex<WorkflowState>>,
    risk_assessor: Option<Arc<RiskAssessor>>,
    notification: Option<NotificationCallback>,
    auto_approve_low_risk: bool,
    default_timeout_hours: f64,
}

impl ApprovalWorkflow {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(WorkflowState {
                pending: HashMap::new(),
                history: Vec::new(),
            })),
            risk_assessor: None,
            notification: None,
            auto_approve_low_risk: false,
            default_timeout_hours: DEFAULT_TIMEOUT_HOURS,
        }
    }

    pub fn with_risk_assessor(mut self, assessor: Arc<RiskAssessor>) -> Self {
        self.risk_assessor = Some(assessor);
        self
    }

    pub fn with_notification(
        mut self,
        callback: impl Fn(&ApprovalRequest) + Send + Sync + 'static,
    ) -> Self {
        self.notification = Some(Box::new(callback));
        self
    }

    pub fn with_auto_approve_low_risk(mut self, enabled: bool) -> Self {
        self.auto_approve_low_risk = enabled;
        self
    }

    pub fn with_default_timeout_hours(mut self, hours: f64) -> Self {
        self.default_timeout_hours = hours;
        self
    }

    /// Request approval and await the outcome: an explicit decision, an
    /// auto-approval, or a timeout decision by the system.
    pub async fn request_approval(
        &self,
        operation: &str,
        context: Value,
        timeout_hours: Option<f64>,
        use_multi_agent: bool,
    ) -> Result<ApprovalDecision> {
        let (risk_level, concerns) = match (&self.risk_assessor, use_multi_agent) {
            (Some(assessor), true) => Self::assess_risk(assessor, operation, &context).await,
            _ => assess_risk_rules(operation, &context),
        };

        let request = ApprovalRequest::new(
            operation.to_string(),
            risk_level,
            concerns,
            context,
            timeout_hours.unwrap_or(self.default_timeout_hours),
        );
        info!(
            request_id = %request.request_id,
            operation,
            risk = %risk_level,
            "approval requested"
        );

        if self.auto_approve_low_risk && risk_level == RiskLevel::Low {
            let decision = ApprovalDecision {
                request_id: request.request_id.clone(),
                approved: true,
                auto_approved: true,
                risk_level,
                rationale: "Auto-approved: low risk operation".to_string(),
                decided_by: "system".to_string(),
                decided_at: Utc::now(),
            };
            self.lock()?.history.push(decision.clone());
            return Ok(decision);
        }

        let (sender, receiver) = oneshot::channel();
        let timeout = Duration::from_secs_f64(request.timeout_hours.max(0.0) * 3600.0);
        let request_id = request.request_id.clone();
        {
            let mut state = self.lock()?;
            state.pending.insert(
                request_id.clone(),
                PendingEntry {
                    request: request.clone(),
                    resolver: Some(sender),
                },
            );
        }

        if let Some(notify) = &self.notification {
            notify(&request);
        }

        let decision = match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) | Err(_) => {
                warn!(request_id = %request_id, "approval request timed out");
                ApprovalDecision {
                    request_id: request_id.clone(),
                    approved: false,
                    auto_approved: false,
                    risk_level,
                    rationale: format!(
                        "Approval request timed out after {} hours",
                        request.timeout_hours
                    ),
                    decided_by: "system".to_string(),
                    decided_at: Utc::now(),
                }
            }
        };

        {
            let mut state = self.lock()?;
            state.pending.remove(&request_id);
            state.history.push(decision.clone());
        }

        info!(
            request_id = %request_id,
            approved = decision.approved,
            decided_by = %decision.decided_by,
            "approval decided"
        );
        Ok(decision)
    }

    /// Approve a pending request. Returns false when the request is missing
    /// or expired.
    pub fn approve(&self, request_id: &str, decided_by: &str, rationale: &str) -> Result<bool> {
        self.decide(request_id, decided_by, rationale, true)
    }

    /// Deny a pending request. Returns false when the request is missing or
    /// expired.
    pub fn deny(&self, request_id: &str, decided_by: &str, rationale: &str) -> Result<bool> {
        self.decide(request_id, decided_by, rationale, false)
    }

    fn decide(
        &self,
        request_id: &str,
        decided_by: &str,
        rationale: &str,
        approved: bool,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(entry) = state.pending.get_mut(request_id) else {
            warn!(request_id, "approval decision for unknown request");
            return Ok(false);
        };
        if entry.request.is_expired() {
            warn!(request_id, "approval decision for expired request");
            return Ok(false);
        }

        let decision = ApprovalDecision {
            request_id: request_id.to_string(),
            approved,
            auto_approved: false,
            risk_level: entry.request.risk_level,
            rationale: if rationale.is_empty() {
                format!(
                    "{} by {decided_by}",
                    if approved { "Approved" } else { "Denied" }
                )
            } else {
                rationale.to_string()
            },
            decided_by: decided_by.to_string(),
            decided_at: Utc::now(),
        };

        if let Some(resolver) = entry.resolver.take() {
            // The awaiting side records history and removes the entry.
            let _ = resolver.send(decision);
        } else {
            state.pending.remove(request_id);
            state.history.push(decision);
        }
        Ok(true)
    }

    /// Prune expired requests and summarize what remains.
    pub fn check_pending(&self) -> Result<PendingSummary> {
        let mut state = self.lock()?;

        let expired: Vec<String> = state
            .pending
            .iter()
            .filter(|(_, e)| e.request.is_expired())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            state.pending.remove(id);
            info!(request_id = %id, "expired approval pruned");
        }

        let mut summary = PendingSummary {
            total_pending: state.pending.len(),
            by_risk_level: BTreeMap::new(),
            by_operation: BTreeMap::new(),
            expiring_soon: Vec::new(),
        };
        for entry in state.pending.values() {
            *summary
                .by_risk_level
                .entry(entry.request.risk_level.to_string())
                .or_default() += 1;
            *summary
                .by_operation
                .entry(entry.request.operation.clone())
                .or_default() += 1;
            if entry.request.hours_remaining() < EXPIRING_SOON_HOURS {
                summary.expiring_soon.push(entry.request.request_id.clone());
            }
        }
        Ok(summary)
    }

    /// Past decisions, newest first.
    pub fn history(&self, limit: Option<usize>) -> Result<Vec<ApprovalDecision>> {
        let state = self.lock()?;
        let mut history = state.history.clone();
        history.sort_by(|a, b| b.decided_at.cmp(&a.decided_at));
        if let Some(limit) = limit {
            history.truncate(limit);
        }
        Ok(history)
    }

    async fn assess_risk(
        assessor: &RiskAssessor,
        operation: &str,
        context: &Value,
    ) -> (RiskLevel, Vec<String>) {
        let detected = DetectedOperation::new(OperationClass::FileModification, operation)
            .with_summary(context.to_string())
            .with_scope("approval-gated operation");
        let assessment = assessor.assess(&detected, None).await;

        let concerns = if assessment.potential_impacts.is_empty() {
            vec!["Multiple perspectives assessed".to_string()]
        } else {
            assessment.potential_impacts.clone()
        };
        (assessment.risk_level, concerns)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, WorkflowState>> {
        self.state
            .lock()
            .map_err(|e| Error::Internal(format!("approval lock poisoned: {e}")))
    }
}

impl Default for ApprovalWorkflow {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed rule-table risk classification used when multi-agent assessment is
/// disabled or unavailable.
fn assess_risk_rules(operation: &str, context: &Value) -> (RiskLevel, Vec<String>) {
    let mut concerns = Vec::new();

    let mut risk = match operation {
        "merge_to_main" | "production_deploy" => {
            concerns.push(format!("{operation} affects production systems"));
            RiskLevel::Critical
        }
        "breaking_change" | "security_related" | "database_migration" => {
            concerns.push(format!("{operation} may impact system stability"));
            RiskLevel::High
        }
        "configuration_change" | "dependency_update" => {
            concerns.push(format!("{operation} requires careful review"));
            RiskLevel::Medium
        }
        _ => {
            concerns.push(format!("{operation} is routine"));
            RiskLevel::Low
        }
    };

    let flag = |key: &str| context.get(key).and_then(Value::as_bool).unwrap_or(false);
    if flag("affects_multiple_components") {
        risk = risk.escalate();
        concerns.push("Affects multiple components".to_string());
    }
    if flag("no_tests_available") {
        risk = risk.escalate();
        concerns.push("No automated tests available".to_string());
    }
    if flag("time_sensitive") {
        concerns.push("Time-sensitive operation".to_string());
    }

    (risk, concerns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_timeout_decides_negatively() {
        let workflow = ApprovalWorkflow::new();
        let decision = workflow
            .request_approval("deploy", json!({}), Some(0.0001), false)
            .await
            .unwrap();

        assert!(!decision.approved);
        assert!(!decision.auto_approved);
        assert_eq!(decision.decided_by, "system");
        assert!(decision.rationale.contains("timed out"));
    }

    #[tokio::test]
    async fn test_auto_approve_low_risk() {
        let workflow = ApprovalWorkflow::new().with_auto_approve_low_risk(true);
        let decision = workflow
            .request_approval("routine_cleanup", json!({}), Some(1.0), false)
            .await
            .unwrap();

        assert!(decision.approved);
        assert!(decision.auto_approved);
        assert_eq!(decision.risk_level, RiskLevel::Low);
    }

    #[tokio::test]
    async fn test_human_approval_resolves_wait() {
        let notified: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let notified_clone = Arc::clone(&notified);
        let workflow = Arc::new(ApprovalWorkflow::new().with_notification(move |request| {
            *notified_clone.lock().unwrap() = Some(request.request_id.clone());
        }));

        let waiter = {
            let workflow = Arc::clone(&workflow);
            tokio::spawn(async move {
                workflow
                    .request_approval("database_migration", json!({}), Some(1.0), false)
                    .await
                    .unwrap()
            })
        };

        // Wait until the notification fires with the request id.
        let request_id = loop {
            if let Some(id) = notified.lock().unwrap().clone() {
                break id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        assert!(workflow.approve(&request_id, "alice", "looks safe").unwrap());
        let decision = waiter.await.unwrap();

        assert!(decision.approved);
        assert_eq!(decision.decided_by, "alice");
        assert_eq!(decision.risk_level, RiskLevel::High);

        // Decided request leaves the pending set.
        let summary = workflow.check_pending().unwrap();
        assert_eq!(summary.total_pending, 0);

        // History records the decision.
        let history = workflow.history(None).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_deny_unknown_request() {
        let workflow = ApprovalWorkflow::new();
        assert!(!workflow.deny("missing-id", "bob", "").unwrap());
    }

    #[test]
    fn test_rule_table_classification() {
        let (risk, _) = assess_risk_rules("merge_to_main", &json!({}));
        assert_eq!(risk, RiskLevel::Critical);

        let (risk, _) = assess_risk_rules("breaking_change", &json!({}));
        assert_eq!(risk, RiskLevel::High);

        let (risk, _) = assess_risk_rules("dependency_update", &json!({}));
        assert_eq!(risk, RiskLevel::Medium);

        let (risk, concerns) = assess_risk_rules("doc_fix", &json!({}));
        assert_eq!(risk, RiskLevel::Low);
        assert_eq!(concerns, vec!["doc_fix is routine".to_string()]);
    }

    #[test]
    fn test_rule_table_escalation() {
        let context = json!({
            "affects_multiple_components": true,
            "no_tests_available": true,
            "time_sensitive": true,
        });
        let (risk, concerns) = assess_risk_rules("dependency_update", &context);
        // Medium escalated twice.
        assert_eq!(risk, RiskLevel::Critical);
        assert!(concerns.iter().any(|c| c.contains("Time-sensitive")));
    }

    #[test]
    fn test_request_id_derivation_stable() {
        let at = Utc::now();
        let a = derive_request_id("deploy", at);
        let b = derive_request_id("deploy", at);
        assert_eq!(a, b);
        assert!(a.starts_with("approval-deploy-"));

        let c = derive_request_id("rollback", at);
        assert_ne!(a, c);
    }

    #[test]
    fn test_zero_timeout_request_expires_immediately() {
        let request = ApprovalRequest::new(
            "x".to_string(),
            RiskLevel::Low,
            Vec::new(),
            json!({}),
            0.0,
        );
        assert!(request.is_expired());
        assert_eq!(request.hours_remaining(), 0.0);
    }
}
