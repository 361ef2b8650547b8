//! Append-only audit trail.
//!
//! [`AuditStore`] is the persistence seam; [`AuditTrail`] wraps a store and
//! forwards every write to an optional external [`AuditSink`] without ever
//! letting the sink affect the write itself.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{AuditFilter, AuditRecord, AuditStatistics, AuditUpdate, NewAuditRecord};
use crate::sink::AuditSink;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryAuditStore;
#[cfg(feature = "postgres")]
pub use postgres::PgAuditStore;

/// Storage interface for audit records.
///
/// Implementations serialize writes per record id and must reject any
/// transition that [`AuditStatus::can_transition_to`] forbids.
///
/// [`AuditStatus::can_transition_to`]: crate::models::AuditStatus::can_transition_to
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Get storage type identifier
    fn store_type(&self) -> &'static str;

    /// Insert a new record in `pending` state.
    async fn insert(&self, record: NewAuditRecord) -> StoreResult<AuditRecord>;

    /// Move a record to a new status, updating the accompanying fields.
    async fn update(&self, id: Uuid, update: AuditUpdate) -> StoreResult<AuditRecord>;

    /// Load a single record.
    async fn get(&self, id: Uuid) -> StoreResult<Option<AuditRecord>>;

    /// Newest-first page of records matching `filter`.
    async fn query(&self, filter: &AuditFilter) -> StoreResult<Vec<AuditRecord>>;

    /// Counts over every stored record.
    async fn statistics(&self) -> StoreResult<AuditStatistics>;
}

/// Audit store plus best-effort log forwarding.
#[derive(Clone)]
pub struct AuditTrail {
    store: Arc<dyn AuditStore>,
    sink: Option<Arc<dyn AuditSink>>,
    sink_timeout: Duration,
}

impl AuditTrail {
    #[must_use]
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self {
            store,
            sink: None,
            sink_timeout: Duration::from_secs(2),
        }
    }

    /// Forward every write to `sink`, giving each push at most `timeout`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>, timeout: Duration) -> Self {
        self.sink = Some(sink);
        self.sink_timeout = timeout;
        self
    }

    #[must_use]
    pub fn store_type(&self) -> &'static str {
        self.store.store_type()
    }

    /// Persist a new pending record.
    pub async fn create(&self, record: NewAuditRecord) -> StoreResult<AuditRecord> {
        let record = self.store.insert(record).await?;
        debug!(audit_id = %record.id, action_type = %record.action_type, "Audit record created");
        self.forward(&record);
        Ok(record)
    }

    /// Apply a status transition.
    pub async fn transition(&self, id: Uuid, update: AuditUpdate) -> StoreResult<AuditRecord> {
        let record = self.store.update(id, update).await?;
        debug!(audit_id = %record.id, status = %record.status, "Audit record transitioned");
        self.forward(&record);
        Ok(record)
    }

    pub async fn get(&self, id: Uuid) -> StoreResult<Option<AuditRecord>> {
        self.store.get(id).await
    }

    pub async fn query(&self, filter: &AuditFilter) -> StoreResult<Vec<AuditRecord>> {
        self.store.query(filter).await
    }

    pub async fn statistics(&self) -> StoreResult<AuditStatistics> {
        self.store.statistics().await
    }

    /// Push a snapshot to the sink on a detached task.
    fn forward(&self, record: &AuditRecord) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        let record = record.clone();
        let timeout = self.sink_timeout;

        tokio::spawn(async move {
            match tokio::time::timeout(timeout, sink.forward(&record)).await {
                Ok(Ok(())) => {
                    debug!(audit_id = %record.id, sink = sink.name(), "Audit record forwarded");
                }
                Ok(Err(e)) => {
                    warn!(
                        audit_id = %record.id,
                        sink = sink.name(),
                        error = %e,
                        "Failed to forward audit record"
                    );
                }
                Err(_) => {
                    warn!(
                        audit_id = %record.id,
                        sink = sink.name(),
                        timeout_ms = timeout.as_millis() as u64,
                        "Timed out forwarding audit record"
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::models::{ActionType, AuditStatus};
    use anyhow::bail;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    fn new_record() -> NewAuditRecord {
        NewAuditRecord {
            action_type: ActionType::RestartPod,
            namespace: "default".to_string(),
            resource_type: "pod".to_string(),
            resource_name: "api-0".to_string(),
            action_params: json!({}),
            requested_by: None,
            ip_address: None,
            policy_decision: None,
            signature: "sig".to_string(),
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<AuditStatus>>,
    }

    #[async_trait]
    impl AuditSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn forward(&self, record: &AuditRecord) -> anyhow::Result<()> {
            self.seen.lock().await.push(record.status);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FailingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AuditSink for FailingSink {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn forward(&self, _record: &AuditRecord) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            bail!("connection refused")
        }
    }

    struct HangingSink;

    #[async_trait]
    impl AuditSink for HangingSink {
        fn name(&self) -> &'static str {
            "hanging"
        }

        async fn forward(&self, _record: &AuditRecord) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_every_write_is_forwarded() {
        let sink = Arc::new(RecordingSink::default());
        let trail = AuditTrail::new(Arc::new(MemoryAuditStore::new()))
            .with_sink(sink.clone(), Duration::from_secs(1));

        let record = trail.create(new_record()).await.unwrap();
        trail
            .transition(record.id, AuditUpdate::rejected("Invalid signature"))
            .await
            .unwrap();
        settle().await;

        let mut seen = sink.seen.lock().await.clone();
        seen.sort_by_key(|s| s.as_str());
        assert_eq!(seen, vec![AuditStatus::Pending, AuditStatus::Rejected]);
    }

    #[tokio::test]
    async fn test_sink_failure_never_fails_the_write() {
        let sink = Arc::new(FailingSink::default());
        let trail = AuditTrail::new(Arc::new(MemoryAuditStore::new()))
            .with_sink(sink.clone(), Duration::from_secs(1));

        let record = trail.create(new_record()).await.unwrap();
        settle().await;

        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        let stored = trail.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AuditStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_sink_does_not_block_writes() {
        let trail = AuditTrail::new(Arc::new(MemoryAuditStore::new()))
            .with_sink(Arc::new(HangingSink), Duration::from_millis(50));

        let record = trail.create(new_record()).await.unwrap();
        let updated = trail
            .transition(record.id, AuditUpdate::in_progress())
            .await
            .unwrap();
        assert_eq!(updated.status, AuditStatus::InProgress);
    }

    #[tokio::test]
    async fn test_transition_unknown_id_is_not_found() {
        let trail = AuditTrail::new(Arc::new(MemoryAuditStore::new()));
        let err = trail
            .transition(Uuid::new_v4(), AuditUpdate::in_progress())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
