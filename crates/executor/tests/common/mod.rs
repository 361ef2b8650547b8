//! Shared fixtures for executor integration tests.

#![allow(dead_code)]

use anyhow::bail;
use async_trait::async_trait;
use chrono::Utc;
use executor::{
    ActionDispatcher, ActionRequest, ActionType, AuditFilter, AuditRecord, AuditStatistics,
    AuditStatus, AuditStore, AuditTrail, AuditUpdate, ClusterOrchestrator, Executor,
    MemoryAuditStore, NamespacePolicy, NewAuditRecord, SignatureVerifier, SignedFields,
    StoreError, StoreResult,
};
use uuid::Uuid;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const SECRET: &str = "integration-secret";

/// How the fake cluster answers.
#[derive(Debug, Clone, Copy, Default)]
pub enum Behavior {
    #[default]
    Succeed,
    Fail,
    Hang,
}

/// Orchestrator that counts calls and answers per [`Behavior`].
#[derive(Default)]
pub struct FakeOrchestrator {
    pub behavior: Behavior,
    pub calls: AtomicUsize,
}

impl FakeOrchestrator {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn answer(&self, result: Value) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Succeed => Ok(result),
            Behavior::Fail => bail!("the server could not find the requested resource"),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(result)
            }
        }
    }
}

#[async_trait]
impl ClusterOrchestrator for FakeOrchestrator {
    async fn restart_pod(&self, _namespace: &str, name: &str) -> anyhow::Result<Value> {
        self.answer(json!({ "pod": name, "restarted": true })).await
    }

    async fn restart_deployment(&self, _namespace: &str, name: &str) -> anyhow::Result<Value> {
        self.answer(json!({ "deployment": name })).await
    }

    async fn scale_deployment(
        &self,
        _namespace: &str,
        _name: &str,
        replicas: i32,
    ) -> anyhow::Result<Value> {
        self.answer(json!({ "previousReplicas": 2, "newReplicas": replicas }))
            .await
    }

    async fn rollback_deployment(
        &self,
        _namespace: &str,
        _name: &str,
        revision: Option<i64>,
    ) -> anyhow::Result<Value> {
        self.answer(json!({ "fromRevision": 3, "toRevision": revision.unwrap_or(2) }))
            .await
    }

    async fn delete_pod(
        &self,
        _namespace: &str,
        name: &str,
        _grace_period_seconds: Option<u32>,
    ) -> anyhow::Result<Value> {
        self.answer(json!({ "pod": name, "deleted": true })).await
    }

    async fn update_config(
        &self,
        _namespace: &str,
        _name: &str,
        data: &BTreeMap<String, String>,
    ) -> anyhow::Result<Value> {
        self.answer(json!({ "updatedKeys": data.keys().collect::<Vec<_>>() }))
            .await
    }
}

/// Failures to inject into [`FaultyStore`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreFaults {
    /// Every insert fails.
    pub fail_insert: bool,
    /// Transitions to this status fail without being written.
    pub fail_transition_to: Option<AuditStatus>,
    /// Writes commit, then take this long to acknowledge.
    pub ack_delay: Option<Duration>,
}

/// Memory store that fails or stalls writes on demand.
pub struct FaultyStore {
    inner: Arc<MemoryAuditStore>,
    faults: StoreFaults,
}

impl FaultyStore {
    fn unavailable() -> StoreError {
        StoreError::Backend {
            reason: "connection refused".to_string(),
        }
    }

    async fn acknowledge(&self) {
        if let Some(delay) = self.faults.ack_delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl AuditStore for FaultyStore {
    fn store_type(&self) -> &'static str {
        self.inner.store_type()
    }

    async fn insert(&self, record: NewAuditRecord) -> StoreResult<AuditRecord> {
        if self.faults.fail_insert {
            return Err(Self::unavailable());
        }
        let record = self.inner.insert(record).await?;
        self.acknowledge().await;
        Ok(record)
    }

    async fn update(&self, id: Uuid, update: AuditUpdate) -> StoreResult<AuditRecord> {
        if self.faults.fail_transition_to == Some(update.status) {
            return Err(Self::unavailable());
        }
        let record = self.inner.update(id, update).await?;
        self.acknowledge().await;
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<AuditRecord>> {
        self.inner.get(id).await
    }

    async fn query(&self, filter: &AuditFilter) -> StoreResult<Vec<AuditRecord>> {
        self.inner.query(filter).await
    }

    async fn statistics(&self) -> StoreResult<AuditStatistics> {
        self.inner.statistics().await
    }
}

/// Executor wired to an in-memory store and the given fake cluster.
pub struct Harness {
    pub executor: Executor,
    pub store: Arc<MemoryAuditStore>,
    pub audit: AuditTrail,
    pub orchestrator: Arc<FakeOrchestrator>,
}

impl Harness {
    pub fn new(behavior: Behavior) -> Self {
        Self::with_timeout(behavior, Duration::from_secs(5))
    }

    pub fn with_timeout(behavior: Behavior, timeout: Duration) -> Self {
        Self::build(behavior, timeout, StoreFaults::default())
    }

    pub fn with_store_faults(behavior: Behavior, faults: StoreFaults) -> Self {
        Self::build(behavior, Duration::from_secs(5), faults)
    }

    fn build(behavior: Behavior, timeout: Duration, faults: StoreFaults) -> Self {
        let store = Arc::new(MemoryAuditStore::new());
        let audit = AuditTrail::new(Arc::new(FaultyStore {
            inner: store.clone(),
            faults,
        }));
        let orchestrator = Arc::new(FakeOrchestrator::new(behavior));
        let executor = Executor::new(
            SignatureVerifier::new(SECRET),
            NamespacePolicy::from_list("default,aegis"),
            audit.clone(),
            ActionDispatcher::new(orchestrator.clone(), timeout),
        )
        .with_signature_max_age(Some(Duration::from_secs(300)));

        Self {
            executor,
            store,
            audit,
            orchestrator,
        }
    }
}

/// A correctly signed request with a current timestamp.
pub fn signed_request(
    action_type: ActionType,
    namespace: &str,
    resource_type: &str,
    resource_name: &str,
    params: Value,
) -> ActionRequest {
    let mut request = ActionRequest {
        action_type,
        namespace: namespace.to_string(),
        resource_type: resource_type.to_string(),
        resource_name: resource_name.to_string(),
        action_params: params.as_object().cloned().unwrap_or_else(Map::new),
        requested_by: Some("ai-engine".to_string()),
        timestamp: Utc::now().to_rfc3339(),
        signature: String::new(),
        policy_decision: None,
    };
    request.signature = SignatureVerifier::new(SECRET).sign(SignedFields::from(&request));
    request
}
