//! Error types for reflex-core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using reflex-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during orchestrator operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger or prompt-library I/O failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Provider runner subprocess missing, crashed, returned non-JSON, or timed out
    #[error("Provider runner error: {0}")]
    Provider(String),

    /// Upstream code host unreachable or returned a non-success status
    #[error("Host error: {0}")]
    Host(String),

    /// Rate limiter refused the request
    #[error("Rate limit exceeded for {api}: resets in {retry_after_secs:.0}s")]
    RateLimited { api: String, retry_after_secs: f64 },

    /// A human explicitly denied the operation
    #[error("Operation denied: {0}")]
    ApprovalDenied(String),

    /// Approval was not given within the request's window
    #[error("Approval request {0} timed out")]
    ApprovalTimeout(String),

    /// The safety manager decided allowed=false
    #[error("Operation blocked for safety: {0}")]
    SafetyBlocked(String),

    /// A proposal or PR gate rejected the change
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Internal consistency check failed
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Timeout during an externally-bounded operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Subprocess communication error (git, runner)
    #[error("Subprocess error: {0}")]
    Subprocess(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a provider runner error.
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }

    /// Create a host error.
    pub fn host(message: impl Into<String>) -> Self {
        Self::Host(message.into())
    }

    /// Create a rate-limited error.
    pub fn rate_limited(api: impl Into<String>, retry_after_secs: f64) -> Self {
        Self::RateLimited {
            api: api.into(),
            retry_after_secs,
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// The taxonomy bucket recorded in the ledger for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(_) => ErrorKind::StorageFault,
            Self::Provider(_) | Self::Timeout { .. } => ErrorKind::ProviderFault,
            Self::Host(_) => ErrorKind::HostFault,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::ApprovalDenied(_) => ErrorKind::ApprovalDenied,
            Self::ApprovalTimeout(_) => ErrorKind::ApprovalTimeout,
            Self::SafetyBlocked(_) => ErrorKind::SafetyBlocked,
            Self::ValidationFailed(_) => ErrorKind::ValidationFailed,
            Self::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Self::Subprocess(_)
            | Self::Serialization(_)
            | Self::Config(_)
            | Self::Internal(_) => ErrorKind::Unknown,
        }
    }
}

/// Closed error taxonomy stored as `error_type` in the operations ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StorageFault,
    ProviderFault,
    HostFault,
    RateLimited,
    ApprovalDenied,
    ApprovalTimeout,
    SafetyBlocked,
    ValidationFailed,
    InvariantViolation,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StorageFault => "storage_fault",
            Self::ProviderFault => "provider_fault",
            Self::HostFault => "host_fault",
            Self::RateLimited => "rate_limited",
            Self::ApprovalDenied => "approval_denied",
            Self::ApprovalTimeout => "approval_timeout",
            Self::SafetyBlocked => "safety_blocked",
            Self::ValidationFailed => "validation_failed",
            Self::InvariantViolation => "invariant_violation",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "storage_fault" => Self::StorageFault,
            "provider_fault" => Self::ProviderFault,
            "host_fault" => Self::HostFault,
            "rate_limited" => Self::RateLimited,
            "approval_denied" => Self::ApprovalDenied,
            "approval_timeout" => Self::ApprovalTimeout,
            "safety_blocked" => Self::SafetyBlocked,
            "validation_failed" => Self::ValidationFailed,
            "invariant_violation" => Self::InvariantViolation,
            _ => Self::Unknown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(Error::storage("disk full").kind(), ErrorKind::StorageFault);
        assert_eq!(Error::timeout(5000).kind(), ErrorKind::ProviderFault);
        assert_eq!(
            Error::rate_limited("github", 120.0).kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(
            Error::SafetyBlocked("critical risk".into()).kind(),
            ErrorKind::SafetyBlocked
        );
    }

    #[test]
    fn test_error_kind_round_trip() {
        let kinds = [
            ErrorKind::StorageFault,
            ErrorKind::ProviderFault,
            ErrorKind::HostFault,
            ErrorKind::RateLimited,
            ErrorKind::ApprovalDenied,
            ErrorKind::ApprovalTimeout,
            ErrorKind::SafetyBlocked,
            ErrorKind::ValidationFailed,
            ErrorKind::InvariantViolation,
            ErrorKind::Unknown,
        ];
        for kind in kinds {
            let parsed: ErrorKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_unrecognized_error_type_maps_to_unknown() {
        let parsed: ErrorKind = "SomeLegacyError".parse().unwrap();
        assert_eq!(parsed, ErrorKind::Unknown);
    }

    #[test]
    fn test_rate_limited_is_distinguishable() {
        let err = Error::rate_limited("github", 30.0);
        match err {
            Error::RateLimited {
                ref api,
                retry_after_secs,
            } => {
                assert_eq!(api, "github");
                assert!((retry_after_secs - 30.0).abs() < f64::EPSILON);
            }
            _ => panic!("expected RateLimited"),
        }
    }
}
