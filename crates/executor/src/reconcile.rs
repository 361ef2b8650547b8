//! Self-healing reconciliation.
//!
//! Periodically summarizes recent remediation attempts by category so an
//! external controller can decide whether more remediation is warranted.
//! Read-only with respect to the audit trail: nothing here re-executes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audit::AuditTrail;
use crate::error::StoreResult;
use crate::models::{AuditFilter, AuditRecord, AuditStatus, RemediationCategory, MAX_PAGE_SIZE};

/// Configuration for the self-healing reconciler.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// How far back to look.
    pub window: Duration,
    /// Maximum records examined per run.
    pub max_records: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60 * 60),
            max_records: MAX_PAGE_SIZE,
        }
    }
}

/// Report from a reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfHealingReport {
    /// When the reconciliation ran.
    pub run_time: DateTime<Utc>,
    /// Records inside the window, rejected ones included.
    pub examined: usize,
    pub restarted: usize,
    /// Rollbacks, counted as retries of an earlier rollout.
    pub retried: usize,
    pub scaled: usize,
    pub deleted: usize,
    pub reconfigured: usize,
    /// Attempts that reached the cluster and failed.
    pub failed: usize,
}

impl SelfHealingReport {
    /// Fold records into a report. Rejected records never reached the
    /// cluster and are not counted in any category.
    #[must_use]
    pub fn classify<'a>(
        run_time: DateTime<Utc>,
        records: impl IntoIterator<Item = &'a AuditRecord>,
    ) -> Self {
        let mut report = Self {
            run_time,
            ..Self::default()
        };

        for record in records {
            report.examined += 1;
            if record.status == AuditStatus::Rejected {
                continue;
            }
            if record.status == AuditStatus::Failed {
                report.failed += 1;
            }
            match record.action_type.category() {
                RemediationCategory::Restart => report.restarted += 1,
                RemediationCategory::Retry => report.retried += 1,
                RemediationCategory::Scale => report.scaled += 1,
                RemediationCategory::Delete => report.deleted += 1,
                RemediationCategory::Reconfigure => report.reconfigured += 1,
            }
        }

        report
    }
}

/// Summarizes recent audit history.
#[derive(Clone)]
pub struct SelfHealingReconciler {
    audit: AuditTrail,
    config: ReconcileConfig,
}

impl SelfHealingReconciler {
    #[must_use]
    pub fn new(audit: AuditTrail, config: ReconcileConfig) -> Self {
        Self { audit, config }
    }

    /// Run one reconciliation pass over the configured window.
    pub async fn reconcile(&self) -> StoreResult<SelfHealingReport> {
        let now = Utc::now();
        let window = chrono::Duration::from_std(self.config.window)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let filter = AuditFilter {
            from: Some(now - window),
            limit: Some(self.config.max_records),
            ..AuditFilter::default()
        };

        let records = self.audit.query(&filter).await?;
        debug!(count = records.len(), "Loaded audit records for reconciliation");

        let report = SelfHealingReport::classify(now, &records);
        info!(
            examined = report.examined,
            restarted = report.restarted,
            retried = report.retried,
            scaled = report.scaled,
            deleted = report.deleted,
            reconfigured = report.reconfigured,
            failed = report.failed,
            "Self-healing reconciliation complete"
        );
        Ok(report)
    }

    /// Reconcile every `interval` until the task is dropped.
    pub async fn run(self, interval: Duration) {
        info!(
            interval_secs = interval.as_secs(),
            window_secs = self.config.window.as_secs(),
            "Starting self-healing loop"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick fires immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = self.reconcile().await {
                warn!(error = %e, "Self-healing reconciliation failed");
            }
        }
    }
}
