//! Mapping of remediation actions onto cluster operations.
//!
//! [`RemediationAction`] is the closed set of supported operations. Parsing a
//! request into one validates its parameters; invoking it calls exactly one
//! [`ClusterOrchestrator`] method. Adding an action means adding one variant
//! plus its parse and invoke arms.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::models::ActionType;

pub mod kubernetes;

pub use kubernetes::KubeOrchestrator;

/// Largest replica count a scale action may request.
pub const MAX_REPLICAS: i64 = 100;

/// External collaborator that performs operations against the cluster.
#[async_trait]
pub trait ClusterOrchestrator: Send + Sync {
    /// Delete a pod so its controller recreates it.
    async fn restart_pod(&self, namespace: &str, name: &str) -> anyhow::Result<Value>;

    /// Trigger a rolling restart of a deployment.
    async fn restart_deployment(&self, namespace: &str, name: &str) -> anyhow::Result<Value>;

    async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> anyhow::Result<Value>;

    /// Roll back to `revision`, or to the previous revision when `None`.
    async fn rollback_deployment(
        &self,
        namespace: &str,
        name: &str,
        revision: Option<i64>,
    ) -> anyhow::Result<Value>;

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> anyhow::Result<Value>;

    /// Merge `data` into a ConfigMap.
    async fn update_config(
        &self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> anyhow::Result<Value>;
}

/// Kubernetes resource kinds accepted in `resourceType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Pod,
    Deployment,
    ConfigMap,
}

impl ResourceKind {
    /// Accepts singular, plural and short forms, case-insensitively.
    #[must_use]
    pub fn parse(resource_type: &str) -> Option<Self> {
        match resource_type.trim().to_ascii_lowercase().as_str() {
            "pod" | "pods" | "po" => Some(ResourceKind::Pod),
            "deployment" | "deployments" | "deploy" => Some(ResourceKind::Deployment),
            "configmap" | "configmaps" | "cm" => Some(ResourceKind::ConfigMap),
            _ => None,
        }
    }
}

/// A validated remediation ready to run.
#[derive(Debug, Clone, PartialEq)]
pub enum RemediationAction {
    RestartPod,
    RestartDeployment,
    ScaleDeployment { replicas: i32 },
    RollbackDeployment { revision: Option<i64> },
    DeletePod { grace_period_seconds: Option<u32> },
    UpdateConfig { data: BTreeMap<String, String> },
}

impl RemediationAction {
    /// Validate a request's action, resource type and parameters.
    pub fn parse(
        action_type: ActionType,
        namespace: &str,
        resource_type: &str,
        params: &Map<String, Value>,
    ) -> Result<Self, DispatchError> {
        let unsupported = || DispatchError::UnsupportedResource {
            action_type: action_type.to_string(),
            resource_type: resource_type.to_string(),
        };
        let kind = ResourceKind::parse(resource_type).ok_or_else(unsupported)?;

        // Parameters may repeat the namespace but never redirect the action
        if let Some(param_ns) = params.get("namespace") {
            if param_ns.as_str() != Some(namespace) {
                return Err(DispatchError::invalid(
                    "namespace",
                    format!("does not match request namespace '{namespace}'"),
                ));
            }
        }

        match (action_type, kind) {
            (ActionType::RestartPod, ResourceKind::Pod) => Ok(RemediationAction::RestartPod),
            (ActionType::RestartPod, ResourceKind::Deployment) => {
                Ok(RemediationAction::RestartDeployment)
            }
            (ActionType::ScaleDeployment, ResourceKind::Deployment) => {
                Ok(RemediationAction::ScaleDeployment {
                    replicas: parse_replicas(params)?,
                })
            }
            (ActionType::RollbackDeployment, ResourceKind::Deployment) => {
                Ok(RemediationAction::RollbackDeployment {
                    revision: parse_revision(params)?,
                })
            }
            (ActionType::DeletePod, ResourceKind::Pod) => Ok(RemediationAction::DeletePod {
                grace_period_seconds: parse_grace_period(params)?,
            }),
            (ActionType::UpdateConfig, ResourceKind::ConfigMap) => {
                Ok(RemediationAction::UpdateConfig {
                    data: parse_config_data(params)?,
                })
            }
            _ => Err(unsupported()),
        }
    }

    /// Operation name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            RemediationAction::RestartPod => "restart-pod",
            RemediationAction::RestartDeployment => "restart-deployment",
            RemediationAction::ScaleDeployment { .. } => "scale-deployment",
            RemediationAction::RollbackDeployment { .. } => "rollback-deployment",
            RemediationAction::DeletePod { .. } => "delete-pod",
            RemediationAction::UpdateConfig { .. } => "update-config",
        }
    }

    async fn invoke(
        &self,
        orchestrator: &dyn ClusterOrchestrator,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<Value> {
        match self {
            RemediationAction::RestartPod => orchestrator.restart_pod(namespace, name).await,
            RemediationAction::RestartDeployment => {
                orchestrator.restart_deployment(namespace, name).await
            }
            RemediationAction::ScaleDeployment { replicas } => {
                orchestrator
                    .scale_deployment(namespace, name, *replicas)
                    .await
            }
            RemediationAction::RollbackDeployment { revision } => {
                orchestrator
                    .rollback_deployment(namespace, name, *revision)
                    .await
            }
            RemediationAction::DeletePod {
                grace_period_seconds,
            } => {
                orchestrator
                    .delete_pod(namespace, name, *grace_period_seconds)
                    .await
            }
            RemediationAction::UpdateConfig { data } => {
                orchestrator.update_config(namespace, name, data).await
            }
        }
    }
}

fn parse_replicas(params: &Map<String, Value>) -> Result<i32, DispatchError> {
    let value = params
        .get("replicas")
        .ok_or_else(|| DispatchError::invalid("replicas", "is required"))?;
    let replicas = value
        .as_i64()
        .ok_or_else(|| DispatchError::invalid("replicas", "must be an integer"))?;
    if !(0..=MAX_REPLICAS).contains(&replicas) {
        return Err(DispatchError::invalid(
            "replicas",
            format!("must be between 0 and {MAX_REPLICAS}"),
        ));
    }
    Ok(replicas as i32)
}

fn parse_revision(params: &Map<String, Value>) -> Result<Option<i64>, DispatchError> {
    match params.get("revision") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match value.as_i64() {
            Some(revision) if revision > 0 => Ok(Some(revision)),
            _ => Err(DispatchError::invalid(
                "revision",
                "must be a positive integer",
            )),
        },
    }
}

fn parse_grace_period(params: &Map<String, Value>) -> Result<Option<u32>, DispatchError> {
    match params.get("gracePeriodSeconds") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|secs| u32::try_from(secs).ok())
            .map(Some)
            .ok_or_else(|| {
                DispatchError::invalid("gracePeriodSeconds", "must be a non-negative integer")
            }),
    }
}

fn parse_config_data(
    params: &Map<String, Value>,
) -> Result<BTreeMap<String, String>, DispatchError> {
    let object = params
        .get("data")
        .and_then(Value::as_object)
        .ok_or_else(|| DispatchError::invalid("data", "must be an object of string values"))?;
    if object.is_empty() {
        return Err(DispatchError::invalid("data", "must not be empty"));
    }

    object
        .iter()
        .map(|(key, value)| {
            value
                .as_str()
                .map(|v| (key.clone(), v.to_string()))
                .ok_or_else(|| {
                    DispatchError::invalid("data", format!("value for '{key}' must be a string"))
                })
        })
        .collect()
}

/// Successful dispatch.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub result: Value,
    pub duration_ms: u64,
}

/// Failed dispatch, with the time spent before failing.
#[derive(Debug, Clone)]
pub struct DispatchFailure {
    pub error: DispatchError,
    pub duration_ms: u64,
}

/// Runs validated remediation actions against the orchestrator.
///
/// Never retries; retry decisions belong to whoever reads the audit trail.
#[derive(Clone)]
pub struct ActionDispatcher {
    orchestrator: Arc<dyn ClusterOrchestrator>,
    timeout: Duration,
}

impl ActionDispatcher {
    #[must_use]
    pub fn new(orchestrator: Arc<dyn ClusterOrchestrator>, timeout: Duration) -> Self {
        Self {
            orchestrator,
            timeout,
        }
    }

    /// Validate and perform one action, measuring wall-clock duration.
    pub async fn dispatch(
        &self,
        action_type: ActionType,
        namespace: &str,
        resource_type: &str,
        resource_name: &str,
        params: &Map<String, Value>,
    ) -> Result<DispatchOutcome, DispatchFailure> {
        let started = Instant::now();
        let elapsed_ms = || started.elapsed().as_millis() as u64;

        let action = RemediationAction::parse(action_type, namespace, resource_type, params)
            .map_err(|error| DispatchFailure {
                error,
                duration_ms: elapsed_ms(),
            })?;

        debug!(
            operation = action.name(),
            namespace = %namespace,
            resource = %resource_name,
            "Dispatching remediation"
        );

        let call = action.invoke(self.orchestrator.as_ref(), namespace, resource_name);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(result)) => {
                let duration_ms = elapsed_ms();
                info!(
                    operation = action.name(),
                    namespace = %namespace,
                    resource = %resource_name,
                    duration_ms,
                    "Remediation completed"
                );
                Ok(DispatchOutcome {
                    result,
                    duration_ms,
                })
            }
            Ok(Err(e)) => {
                let duration_ms = elapsed_ms();
                warn!(
                    operation = action.name(),
                    namespace = %namespace,
                    resource = %resource_name,
                    duration_ms,
                    error = %format!("{e:#}"),
                    "Remediation failed"
                );
                Err(DispatchFailure {
                    error: DispatchError::Orchestrator(format!("{e:#}")),
                    duration_ms,
                })
            }
            Err(_) => {
                let duration_ms = elapsed_ms();
                warn!(
                    operation = action.name(),
                    namespace = %namespace,
                    resource = %resource_name,
                    duration_ms,
                    "Remediation timed out"
                );
                Err(DispatchFailure {
                    error: DispatchError::Timeout(self.timeout),
                    duration_ms,
                })
            }
        }
    }
}
