//! Error types for the remediation executor.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{AuditRecord, AuditStatus};

/// Audit persistence errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Audit record '{id}' not found")]
    NotFound { id: Uuid },

    #[error("Invalid status transition for audit record '{id}': {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: AuditStatus,
        to: AuditStatus,
    },

    #[error("Audit backend error: {reason}")]
    Backend { reason: String },
}

/// Result type alias for audit store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Failures while mapping or performing a remediation against the cluster.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Action '{action_type}' does not support resource type '{resource_type}'")]
    UnsupportedResource {
        action_type: String,
        resource_type: String,
    },

    #[error("Invalid parameter '{field}': {reason}")]
    InvalidParams { field: String, reason: String },

    #[error("Cluster operation failed: {0}")]
    Orchestrator(String),

    #[error("Cluster operation timed out after {0:?}")]
    Timeout(Duration),
}

impl DispatchError {
    /// Whether the caller sent a request that can never succeed as-is.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            DispatchError::UnsupportedResource { .. } | DispatchError::InvalidParams { .. }
        )
    }

    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        DispatchError::InvalidParams {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Outcome of a rejected or failed execution.
///
/// Every variant except `Persistence` refers to an audit record that was
/// written for the attempt.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Authentication failed: {reason}")]
    Authentication { audit_id: Uuid, reason: String },

    #[error("Namespace '{namespace}' is not permitted")]
    Authorization { audit_id: Uuid, namespace: String },

    #[error("Action execution failed: {source}")]
    Dispatch {
        source: DispatchError,
        record: Box<AuditRecord>,
    },

    #[error("Audit trail unavailable: {0}")]
    Persistence(#[from] StoreError),
}

impl ExecutorError {
    /// Identity of the audit record written for this attempt, if any.
    #[must_use]
    pub fn audit_id(&self) -> Option<Uuid> {
        match self {
            ExecutorError::Authentication { audit_id, .. }
            | ExecutorError::Authorization { audit_id, .. } => Some(*audit_id),
            ExecutorError::Dispatch { record, .. } => Some(record.id),
            ExecutorError::Persistence(_) => None,
        }
    }

    /// Stable machine-readable error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutorError::Authentication { .. } => "authentication_failed",
            ExecutorError::Authorization { .. } => "namespace_not_allowed",
            ExecutorError::Dispatch { .. } => "execution_failed",
            ExecutorError::Persistence(_) => "audit_unavailable",
        }
    }
}

/// Result type alias for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Configuration errors raised at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let id = Uuid::nil();
        let err = StoreError::InvalidTransition {
            id,
            from: AuditStatus::Completed,
            to: AuditStatus::Pending,
        };
        assert_eq!(
            err.to_string(),
            format!("Invalid status transition for audit record '{id}': completed -> pending")
        );

        let timeout = DispatchError::Timeout(Duration::from_secs(30));
        assert_eq!(timeout.to_string(), "Cluster operation timed out after 30s");

        let short = DispatchError::Timeout(Duration::from_millis(250));
        assert_eq!(short.to_string(), "Cluster operation timed out after 250ms");
    }

    #[test]
    fn test_client_error_classification() {
        assert!(DispatchError::invalid("replicas", "must be an integer").is_client_error());
        assert!(!DispatchError::Orchestrator("boom".to_string()).is_client_error());
        assert!(!DispatchError::Timeout(Duration::from_secs(1)).is_client_error());
    }

    #[test]
    fn test_persistence_has_no_audit_id() {
        let err: ExecutorError = StoreError::Backend {
            reason: "connection refused".to_string(),
        }
        .into();
        assert!(err.audit_id().is_none());
        assert_eq!(err.kind(), "audit_unavailable");
    }
}
