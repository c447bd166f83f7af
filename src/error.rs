//! Wire error taxonomy for the control boundary (spec.md §6/§7).
//!
//! Internal plumbing keeps using `anyhow::Result` the way the rest of this
//! codebase does; `TunnelError` is the one place we surface a machine-readable
//! code, since a caller across the control interface needs to branch on it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One `{field, issue}` pair for a validation failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub issue: String,
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed")]
    Validation(Vec<ValidationIssue>),

    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("host key verification failed: {0}")]
    HostKeyVerificationFailure(String),

    #[error("circuit open for tunnel {0}")]
    CircuitOpen(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl TunnelError {
    /// Machine-readable code, stable across releases (spec.md §6).
    pub fn code(&self) -> &'static str {
        match self {
            TunnelError::NotFound(_) => "not_found",
            TunnelError::Conflict(_) => "conflict",
            TunnelError::Validation(_) => "validation",
            TunnelError::AuthenticationFailure(_) => "authentication_failure",
            TunnelError::HostKeyVerificationFailure(_) => "host_key_verification_failure",
            TunnelError::CircuitOpen(_) => "circuit_open",
            TunnelError::ConnectionFailed(_) => "connection_failed",
            TunnelError::Internal(_) => "internal",
            TunnelError::ServiceUnavailable(_) => "service_unavailable",
            TunnelError::Timeout(_) => "timeout",
        }
    }

    pub fn validation(issues: Vec<ValidationIssue>) -> Self {
        TunnelError::Validation(issues)
    }
}

/// Wire-format representation of a `TunnelError`, used by the control adapter.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<ValidationIssue>,
}

impl From<&TunnelError> for ErrorPayload {
    fn from(err: &TunnelError) -> Self {
        let issues = match err {
            TunnelError::Validation(issues) => issues.clone(),
            _ => Vec::new(),
        };
        ErrorPayload {
            code: err.code().to_string(),
            message: err.to_string(),
            issues,
        }
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_stable_per_variant() {
        assert_eq!(TunnelError::NotFound("x".into()).code(), "not_found");
        assert_eq!(TunnelError::Conflict("x".into()).code(), "conflict");
        assert_eq!(TunnelError::CircuitOpen("x".into()).code(), "circuit_open");
    }

    #[test]
    fn test_validation_payload_carries_issues() {
        let err = TunnelError::validation(vec![ValidationIssue {
            field: "remote_port".into(),
            issue: "out of range".into(),
        }]);
        let payload = ErrorPayload::from(&err);
        assert_eq!(payload.code, "validation");
        assert_eq!(payload.issues.len(), 1);
        assert_eq!(payload.issues[0].field, "remote_port");
    }

    #[test]
    fn test_non_validation_payload_has_no_issues() {
        let err = TunnelError::NotFound("abc".into());
        let payload = ErrorPayload::from(&err);
        assert!(payload.issues.is_empty());
    }
}
