//! Request and audit record types shared by every executor component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::StoreError;

/// Default number of records returned by an audit query.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Hard upper bound for a single audit query page.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Remediation action requested by an upstream caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    RestartPod,
    ScaleDeployment,
    RollbackDeployment,
    DeletePod,
    UpdateConfig,
}

impl ActionType {
    /// All supported actions, in declaration order.
    pub const ALL: [ActionType; 5] = [
        ActionType::RestartPod,
        ActionType::ScaleDeployment,
        ActionType::RollbackDeployment,
        ActionType::DeletePod,
        ActionType::UpdateConfig,
    ];

    /// Wire name of the action (`restart_pod`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::RestartPod => "restart_pod",
            ActionType::ScaleDeployment => "scale_deployment",
            ActionType::RollbackDeployment => "rollback_deployment",
            ActionType::DeletePod => "delete_pod",
            ActionType::UpdateConfig => "update_config",
        }
    }

    /// Self-healing bucket this action is reported under.
    #[must_use]
    pub fn category(self) -> RemediationCategory {
        match self {
            ActionType::RestartPod => RemediationCategory::Restart,
            ActionType::RollbackDeployment => RemediationCategory::Retry,
            ActionType::ScaleDeployment => RemediationCategory::Scale,
            ActionType::DeletePod => RemediationCategory::Delete,
            ActionType::UpdateConfig => RemediationCategory::Reconfigure,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionType::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| format!("unknown action type '{s}'"))
    }
}

/// Category used by the self-healing reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemediationCategory {
    Restart,
    Retry,
    Scale,
    Delete,
    Reconfigure,
}

/// Lifecycle state of an audit record.
///
/// Transitions only move forward:
/// `pending -> in_progress -> completed | failed` and `pending -> rejected | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Rejected,
}

impl AuditStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AuditStatus::Pending => "pending",
            AuditStatus::InProgress => "in_progress",
            AuditStatus::Completed => "completed",
            AuditStatus::Failed => "failed",
            AuditStatus::Rejected => "rejected",
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AuditStatus::Completed | AuditStatus::Failed | AuditStatus::Rejected
        )
    }

    /// Whether a record in this state may move to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: AuditStatus) -> bool {
        matches!(
            (self, next),
            (AuditStatus::Pending, AuditStatus::InProgress | AuditStatus::Rejected)
                | (AuditStatus::InProgress, AuditStatus::Completed | AuditStatus::Failed)
        )
    }

    /// States a record must currently be in to move to `next`.
    #[must_use]
    pub fn predecessors(next: AuditStatus) -> Vec<AuditStatus> {
        [AuditStatus::Pending, AuditStatus::InProgress]
            .into_iter()
            .filter(|from| from.can_transition_to(next))
            .collect()
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AuditStatus::Pending),
            "in_progress" => Ok(AuditStatus::InProgress),
            "completed" => Ok(AuditStatus::Completed),
            "failed" => Ok(AuditStatus::Failed),
            "rejected" => Ok(AuditStatus::Rejected),
            other => Err(format!("unknown audit status '{other}'")),
        }
    }
}

/// Authorization decision produced upstream by the policy engine.
///
/// Persisted verbatim, never evaluated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub applied_policies: Vec<String>,
    /// Any additional fields the policy engine attached.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Signed remediation request as received from a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub action_type: ActionType,
    pub namespace: String,
    pub resource_type: String,
    pub resource_name: String,
    /// Action-specific parameters (`replicas`, `revision`, `data`, ...).
    #[serde(default)]
    pub action_params: Map<String, Value>,
    #[serde(default)]
    pub requested_by: Option<String>,
    /// Freshness marker, also part of the signed payload.
    pub timestamp: String,
    /// Hex-encoded HMAC-SHA256 over the canonical payload.
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub policy_decision: Option<PolicyDecision>,
}

/// Fields supplied when an audit record is first written.
#[derive(Debug, Clone)]
pub struct NewAuditRecord {
    pub action_type: ActionType,
    pub namespace: String,
    pub resource_type: String,
    pub resource_name: String,
    pub action_params: Value,
    pub requested_by: Option<String>,
    pub ip_address: Option<String>,
    pub policy_decision: Option<PolicyDecision>,
    pub signature: String,
}

impl NewAuditRecord {
    /// Capture everything the caller presented, including the unverified signature.
    #[must_use]
    pub fn from_request(request: &ActionRequest, ip_address: Option<String>) -> Self {
        Self {
            action_type: request.action_type,
            namespace: request.namespace.clone(),
            resource_type: request.resource_type.clone(),
            resource_name: request.resource_name.clone(),
            action_params: Value::Object(request.action_params.clone()),
            requested_by: request.requested_by.clone(),
            ip_address,
            policy_decision: request.policy_decision.clone(),
            signature: request.signature.clone(),
        }
    }
}

/// Durable record of one authorization decision and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: Uuid,
    pub action_type: ActionType,
    pub status: AuditStatus,
    pub namespace: String,
    pub resource_type: String,
    pub resource_name: String,
    pub action_params: Value,
    pub requested_by: Option<String>,
    pub ip_address: Option<String>,
    pub policy_decision: Option<PolicyDecision>,
    /// Milliseconds spent in dispatch; only set on completion or failure.
    pub execution_duration: Option<u64>,
    pub error_message: Option<String>,
    pub result: Option<Value>,
    pub signature: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AuditRecord {
    /// Materialize a freshly created, pending record.
    #[must_use]
    pub fn pending(id: Uuid, new: NewAuditRecord, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            action_type: new.action_type,
            status: AuditStatus::Pending,
            namespace: new.namespace,
            resource_type: new.resource_type,
            resource_name: new.resource_name,
            action_params: new.action_params,
            requested_by: new.requested_by,
            ip_address: new.ip_address,
            policy_decision: new.policy_decision,
            execution_duration: None,
            error_message: None,
            result: None,
            signature: new.signature,
            created_at,
            completed_at: None,
        }
    }

    /// Apply a status transition in place.
    ///
    /// `completed_at` and `execution_duration` are written together, once,
    /// on the terminal transition.
    pub fn apply(&mut self, update: AuditUpdate, now: DateTime<Utc>) -> Result<(), StoreError> {
        if !self.status.can_transition_to(update.status) {
            return Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: update.status,
            });
        }

        self.status = update.status;
        if update.status.is_terminal() {
            self.completed_at = Some(now);
            self.execution_duration = update.execution_duration;
        }
        if update.error_message.is_some() {
            self.error_message = update.error_message;
        }
        if update.result.is_some() {
            self.result = update.result;
        }
        Ok(())
    }
}

/// A status transition plus the fields that accompany it.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditUpdate {
    pub status: AuditStatus,
    pub execution_duration: Option<u64>,
    pub error_message: Option<String>,
    pub result: Option<Value>,
}

impl AuditUpdate {
    #[must_use]
    pub fn in_progress() -> Self {
        Self {
            status: AuditStatus::InProgress,
            execution_duration: None,
            error_message: None,
            result: None,
        }
    }

    #[must_use]
    pub fn completed(result: Value, duration_ms: u64) -> Self {
        Self {
            status: AuditStatus::Completed,
            execution_duration: Some(duration_ms),
            error_message: None,
            result: Some(result),
        }
    }

    #[must_use]
    pub fn failed(error_message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: AuditStatus::Failed,
            execution_duration: Some(duration_ms),
            error_message: Some(error_message.into()),
            result: None,
        }
    }

    /// Rejections never reach dispatch, so they carry no duration.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            status: AuditStatus::Rejected,
            execution_duration: None,
            error_message: Some(reason.into()),
            result: None,
        }
    }
}

/// Filters accepted by audit queries.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFilter {
    #[serde(default)]
    pub action_type: Option<ActionType>,
    #[serde(default)]
    pub status: Option<AuditStatus>,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Inclusive lower bound on `createdAt`.
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `createdAt`.
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl AuditFilter {
    /// Page size after applying the default and the hard cap.
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    #[must_use]
    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.action_type.is_none_or(|t| record.action_type == t)
            && self.status.is_none_or(|s| record.status == s)
            && self
                .namespace
                .as_deref()
                .is_none_or(|ns| record.namespace == ns)
            && self.from.is_none_or(|from| record.created_at >= from)
            && self.to.is_none_or(|to| record.created_at <= to)
    }
}

/// Aggregate counts over the whole audit store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStatistics {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub by_action_type: BTreeMap<String, u64>,
}

impl AuditStatistics {
    /// Fold one record into the counters.
    pub fn record(&mut self, record: &AuditRecord) {
        self.total += 1;
        match record.status {
            AuditStatus::Completed => self.completed += 1,
            AuditStatus::Failed => self.failed += 1,
            AuditStatus::Rejected => self.rejected += 1,
            AuditStatus::Pending => self.pending += 1,
            AuditStatus::InProgress => self.in_progress += 1,
        }
        *self
            .by_action_type
            .entry(record.action_type.as_str().to_string())
            .or_default() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_record() -> AuditRecord {
        AuditRecord::pending(
            Uuid::new_v4(),
            NewAuditRecord {
                action_type: ActionType::ScaleDeployment,
                namespace: "default".to_string(),
                resource_type: "deployment".to_string(),
                resource_name: "api".to_string(),
                action_params: json!({"replicas": 3}),
                requested_by: Some("ai-engine".to_string()),
                ip_address: None,
                policy_decision: None,
                signature: "abc".to_string(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_action_type_wire_names() {
        let parsed: ActionType = serde_json::from_str("\"rollback_deployment\"").unwrap();
        assert_eq!(parsed, ActionType::RollbackDeployment);
        assert_eq!(
            serde_json::to_string(&ActionType::UpdateConfig).unwrap(),
            "\"update_config\""
        );
        assert_eq!("delete_pod".parse::<ActionType>(), Ok(ActionType::DeletePod));
        assert!("reboot_node".parse::<ActionType>().is_err());
    }

    #[test]
    fn test_status_transitions_are_forward_only() {
        use AuditStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Rejected));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Failed));

        assert!(!InProgress.can_transition_to(Pending));
        assert!(!InProgress.can_transition_to(Rejected));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        for terminal in [Completed, Failed, Rejected] {
            for next in [Pending, InProgress, Completed, Failed, Rejected] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_predecessors() {
        assert_eq!(
            AuditStatus::predecessors(AuditStatus::Failed),
            vec![AuditStatus::InProgress]
        );
        assert_eq!(
            AuditStatus::predecessors(AuditStatus::Rejected),
            vec![AuditStatus::Pending]
        );
        assert_eq!(
            AuditStatus::predecessors(AuditStatus::Completed),
            vec![AuditStatus::InProgress]
        );
        assert!(AuditStatus::predecessors(AuditStatus::Pending).is_empty());
    }

    #[test]
    fn test_apply_sets_completion_fields_once() {
        let mut record = sample_record();
        let now = Utc::now();

        record.apply(AuditUpdate::in_progress(), now).unwrap();
        assert_eq!(record.status, AuditStatus::InProgress);
        assert!(record.completed_at.is_none());
        assert!(record.execution_duration.is_none());

        record
            .apply(AuditUpdate::completed(json!({"newReplicas": 3}), 42), now)
            .unwrap();
        assert_eq!(record.status, AuditStatus::Completed);
        assert_eq!(record.completed_at, Some(now));
        assert_eq!(record.execution_duration, Some(42));

        let err = record
            .apply(AuditUpdate::completed(json!({}), 7), Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(record.execution_duration, Some(42));
        assert_eq!(record.completed_at, Some(now));
    }

    #[test]
    fn test_rejected_has_no_duration() {
        let mut record = sample_record();
        record
            .apply(AuditUpdate::rejected("Invalid signature"), Utc::now())
            .unwrap();
        assert_eq!(record.status, AuditStatus::Rejected);
        assert!(record.completed_at.is_some());
        assert!(record.execution_duration.is_none());
        assert_eq!(record.error_message.as_deref(), Some("Invalid signature"));
    }

    #[test]
    fn test_filter_matching_and_limit() {
        let record = sample_record();
        let filter = AuditFilter {
            namespace: Some("default".to_string()),
            action_type: Some(ActionType::ScaleDeployment),
            ..AuditFilter::default()
        };
        assert!(filter.matches(&record));

        let other_ns = AuditFilter {
            namespace: Some("kube-system".to_string()),
            ..AuditFilter::default()
        };
        assert!(!other_ns.matches(&record));

        let future = AuditFilter {
            from: Some(Utc::now() + chrono::Duration::hours(1)),
            ..AuditFilter::default()
        };
        assert!(!future.matches(&record));

        assert_eq!(AuditFilter::default().effective_limit(), DEFAULT_PAGE_SIZE);
        let huge = AuditFilter {
            limit: Some(1_000_000),
            ..AuditFilter::default()
        };
        assert_eq!(huge.effective_limit(), MAX_PAGE_SIZE);
    }

    #[test]
    fn test_request_deserializes_from_camel_case() {
        let request: ActionRequest = serde_json::from_value(json!({
            "actionType": "scale_deployment",
            "namespace": "production",
            "resourceType": "deployment",
            "resourceName": "api-deployment",
            "actionParams": {"replicas": 10},
            "requestedBy": "ai-engine",
            "timestamp": "2025-01-01T00:00:00Z",
            "signature": "deadbeef",
            "policyDecision": {
                "allowed": true,
                "reason": "High CPU usage detected",
                "appliedPolicies": ["Allow Auto-Scale"],
                "evaluationId": "eval-1"
            }
        }))
        .unwrap();

        assert_eq!(request.action_type, ActionType::ScaleDeployment);
        assert_eq!(request.action_params.get("replicas"), Some(&json!(10)));
        let decision = request.policy_decision.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.applied_policies, vec!["Allow Auto-Scale"]);
        assert_eq!(decision.extra.get("evaluationId"), Some(&json!("eval-1")));
    }
}
