//! Kubernetes implementation of [`ClusterOrchestrator`].

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::ClusterOrchestrator;

const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";
const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";
const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

/// Performs remediations through the Kubernetes API.
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
}

impl KubeOrchestrator {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using in-cluster config or the local kubeconfig.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;
        Ok(Self::new(client))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn owned_replica_sets(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Vec<ReplicaSet>> {
        let selector = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.match_labels.as_ref())
            .map(label_selector)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("Deployment has no matchLabels selector"))?;
        let uid = deployment.metadata.uid.as_deref();

        let replica_sets: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let list = replica_sets
            .list(&ListParams::default().labels(&selector))
            .await
            .context("Failed to list ReplicaSets")?;

        Ok(list
            .items
            .into_iter()
            .filter(|rs| {
                rs.metadata
                    .owner_references
                    .as_ref()
                    .is_some_and(|owners| owners.iter().any(|o| Some(o.uid.as_str()) == uid))
            })
            .collect())
    }
}

/// Render `matchLabels` as a label selector string.
fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn revision_of(annotations: Option<&BTreeMap<String, String>>) -> Option<i64> {
    annotations?.get(REVISION_ANNOTATION)?.parse().ok()
}

/// Pick the revision to roll back to.
///
/// With an explicit `requested` revision it must exist and differ from the
/// current one; otherwise the newest revision older than `current` wins.
pub fn select_rollback_target(
    current: Option<i64>,
    available: &[i64],
    requested: Option<i64>,
) -> Result<i64> {
    match requested {
        Some(revision) if current == Some(revision) => {
            bail!("Deployment is already at revision {revision}")
        }
        Some(revision) if available.contains(&revision) => Ok(revision),
        Some(revision) => bail!("Revision {revision} not found"),
        None => available
            .iter()
            .copied()
            .filter(|r| current.is_none_or(|c| *r < c))
            .max()
            .ok_or_else(|| anyhow!("No previous revision to roll back to")),
    }
}

fn not_found(kind: &str, namespace: &str, name: &str) -> anyhow::Error {
    anyhow!("{kind} '{namespace}/{name}' not found")
}

#[async_trait]
impl ClusterOrchestrator for KubeOrchestrator {
    async fn restart_pod(&self, namespace: &str, name: &str) -> Result<Value> {
        let pods = self.pods(namespace);
        let pod = match pods.get(name).await {
            Ok(pod) => pod,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                return Err(not_found("Pod", namespace, name))
            }
            Err(e) => return Err(anyhow!("Failed to read pod: {e}")),
        };

        // A bare pod would simply disappear
        let owned = pod
            .metadata
            .owner_references
            .as_ref()
            .is_some_and(|owners| owners.iter().any(|o| o.controller == Some(true)));
        if !owned {
            bail!("Pod '{namespace}/{name}' has no controller to recreate it");
        }

        pods.delete(name, &DeleteParams::default())
            .await
            .context("Failed to delete pod")?;
        info!(namespace = %namespace, pod = %name, "Pod deleted for restart");

        Ok(json!({ "pod": name, "restarted": true }))
    }

    async fn restart_deployment(&self, namespace: &str, name: &str) -> Result<Value> {
        let restarted_at = Utc::now().to_rfc3339();
        let patch = json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": { RESTARTED_AT_ANNOTATION: restarted_at }
                    }
                }
            }
        });

        match self
            .deployments(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {
                return Err(not_found("Deployment", namespace, name))
            }
            Err(e) => return Err(anyhow!("Failed to patch deployment: {e}")),
        }
        info!(namespace = %namespace, deployment = %name, "Rollout restart triggered");

        Ok(json!({ "deployment": name, "restartedAt": restarted_at }))
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<Value> {
        let deployments = self.deployments(namespace);
        let scale = match deployments.get_scale(name).await {
            Ok(scale) => scale,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                return Err(not_found("Deployment", namespace, name))
            }
            Err(e) => return Err(anyhow!("Failed to read deployment scale: {e}")),
        };
        let previous = scale.spec.and_then(|s| s.replicas).unwrap_or(0);

        let patch = json!({ "spec": { "replicas": replicas } });
        deployments
            .patch_scale(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context("Failed to update deployment scale")?;
        info!(
            namespace = %namespace,
            deployment = %name,
            previous,
            replicas,
            "Deployment scaled"
        );

        Ok(json!({ "previousReplicas": previous, "newReplicas": replicas }))
    }

    async fn rollback_deployment(
        &self,
        namespace: &str,
        name: &str,
        revision: Option<i64>,
    ) -> Result<Value> {
        let deployments = self.deployments(namespace);
        let mut deployment = match deployments.get(name).await {
            Ok(deployment) => deployment,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                return Err(not_found("Deployment", namespace, name))
            }
            Err(e) => return Err(anyhow!("Failed to read deployment: {e}")),
        };
        let current = revision_of(deployment.metadata.annotations.as_ref());

        let replica_sets = self.owned_replica_sets(namespace, &deployment).await?;
        let available: Vec<i64> = replica_sets
            .iter()
            .filter_map(|rs| revision_of(rs.metadata.annotations.as_ref()))
            .collect();
        debug!(deployment = %name, ?current, ?available, "Rollback candidates");

        let target = select_rollback_target(current, &available, revision)?;
        let mut template = replica_sets
            .into_iter()
            .find(|rs| revision_of(rs.metadata.annotations.as_ref()) == Some(target))
            .and_then(|rs| rs.spec.and_then(|spec| spec.template))
            .ok_or_else(|| anyhow!("ReplicaSet for revision {target} has no pod template"))?;

        if let Some(labels) = template
            .metadata
            .as_mut()
            .and_then(|meta| meta.labels.as_mut())
        {
            labels.remove(POD_TEMPLATE_HASH_LABEL);
        }

        let spec = deployment
            .spec
            .as_mut()
            .ok_or_else(|| anyhow!("Deployment '{namespace}/{name}' has no spec"))?;
        spec.template = template;

        deployments
            .replace(name, &PostParams::default(), &deployment)
            .await
            .context("Failed to apply rollback template")?;
        info!(
            namespace = %namespace,
            deployment = %name,
            from = ?current,
            to = target,
            "Deployment rolled back"
        );

        Ok(json!({ "fromRevision": current, "toRevision": target }))
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<Value> {
        let params = DeleteParams {
            grace_period_seconds,
            ..DeleteParams::default()
        };

        match self.pods(namespace).delete(name, &params).await {
            Ok(_) => {
                info!(namespace = %namespace, pod = %name, ?grace_period_seconds, "Pod deleted");
                Ok(json!({
                    "pod": name,
                    "deleted": true,
                    "gracePeriodSeconds": grace_period_seconds,
                }))
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Err(not_found("Pod", namespace, name)),
            Err(e) => Err(anyhow!("Failed to delete pod: {e}")),
        }
    }

    async fn update_config(
        &self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<Value> {
        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "data": data });

        match configmaps
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {
                return Err(not_found("ConfigMap", namespace, name))
            }
            Err(e) => return Err(anyhow!("Failed to patch ConfigMap: {e}")),
        }

        let updated_keys: Vec<&String> = data.keys().collect();
        info!(
            namespace = %namespace,
            configmap = %name,
            keys = updated_keys.len(),
            "ConfigMap updated"
        );

        Ok(json!({ "configMap": name, "updatedKeys": updated_keys }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_selector_is_sorted_and_joined() {
        let labels: BTreeMap<String, String> = [
            ("tier".to_string(), "web".to_string()),
            ("app".to_string(), "api".to_string()),
        ]
        .into();
        assert_eq!(label_selector(&labels), "app=api,tier=web");
    }

    #[test]
    fn test_revision_annotation_parsing() {
        let annotations: BTreeMap<String, String> =
            [(REVISION_ANNOTATION.to_string(), "7".to_string())].into();
        assert_eq!(revision_of(Some(&annotations)), Some(7));
        assert_eq!(revision_of(None), None);

        let garbage: BTreeMap<String, String> =
            [(REVISION_ANNOTATION.to_string(), "seven".to_string())].into();
        assert_eq!(revision_of(Some(&garbage)), None);
    }

    #[test]
    fn test_rollback_defaults_to_previous_revision() {
        assert_eq!(select_rollback_target(Some(4), &[1, 3, 4], None).unwrap(), 3);
        assert_eq!(select_rollback_target(None, &[2, 5], None).unwrap(), 5);
        assert!(select_rollback_target(Some(1), &[1], None).is_err());
    }

    #[test]
    fn test_rollback_to_explicit_revision() {
        assert_eq!(select_rollback_target(Some(4), &[1, 2, 4], Some(1)).unwrap(), 1);
        assert!(select_rollback_target(Some(4), &[1, 2, 4], Some(3)).is_err());
        assert!(select_rollback_target(Some(4), &[1, 2, 4], Some(4)).is_err());
    }
}
