//! In-process audit store.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::AuditStore;
use crate::error::{StoreError, StoreResult};
use crate::models::{AuditFilter, AuditRecord, AuditStatistics, AuditUpdate, NewAuditRecord};

#[derive(Default)]
struct Inner {
    /// Records in insertion order; never removed.
    records: Vec<AuditRecord>,
    index: HashMap<Uuid, usize>,
}

/// Append-only audit store held in memory.
///
/// Writes take the store-wide write lock, so at most one writer touches a
/// record at a time.
#[derive(Default)]
pub struct MemoryAuditStore {
    inner: RwLock<Inner>,
}

impl MemoryAuditStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    fn store_type(&self) -> &'static str {
        "memory"
    }

    async fn insert(&self, record: NewAuditRecord) -> StoreResult<AuditRecord> {
        let record = AuditRecord::pending(Uuid::new_v4(), record, Utc::now());
        let mut inner = self.inner.write().await;
        let position = inner.records.len();
        inner.index.insert(record.id, position);
        inner.records.push(record.clone());
        Ok(record)
    }

    async fn update(&self, id: Uuid, update: AuditUpdate) -> StoreResult<AuditRecord> {
        let mut inner = self.inner.write().await;
        let position = *inner.index.get(&id).ok_or(StoreError::NotFound { id })?;
        let record = &mut inner.records[position];
        record.apply(update, Utc::now())?;
        Ok(record.clone())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<AuditRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .index
            .get(&id)
            .map(|position| inner.records[*position].clone()))
    }

    async fn query(&self, filter: &AuditFilter) -> StoreResult<Vec<AuditRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .iter()
            .rev()
            .filter(|record| filter.matches(record))
            .take(filter.effective_limit())
            .cloned()
            .collect())
    }

    async fn statistics(&self) -> StoreResult<AuditStatistics> {
        let inner = self.inner.read().await;
        let mut stats = AuditStatistics::default();
        for record in &inner.records {
            stats.record(record);
        }
        Ok(stats)
    }
}
