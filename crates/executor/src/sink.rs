//! External log sinks for audit records.
//!
//! Forwarding is best-effort: callers run [`AuditSink::forward`] on a
//! detached task with its own timeout and only log failures.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::models::AuditRecord;

/// Stream label identifying executor audit lines in Loki.
const DEFAULT_JOB: &str = "executor-audit";

/// Destination for audit record snapshots.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Short name used in log fields.
    fn name(&self) -> &'static str;

    /// Push one record snapshot.
    async fn forward(&self, record: &AuditRecord) -> Result<()>;
}

/// Pushes audit records to Grafana Loki.
#[derive(Debug, Clone)]
pub struct LokiSink {
    push_url: String,
    job: String,
    client: reqwest::Client,
}

impl LokiSink {
    /// Create a sink for the Loki instance at `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            push_url: format!("{}/loki/api/v1/push", base_url.trim_end_matches('/')),
            job: DEFAULT_JOB.to_string(),
            client,
        })
    }

    /// Override the `job` stream label.
    #[must_use]
    pub fn with_job(mut self, job: impl Into<String>) -> Self {
        self.job = job.into();
        self
    }

    #[must_use]
    pub fn push_url(&self) -> &str {
        &self.push_url
    }
}

/// Build a Loki push body carrying one audit record as a JSON log line.
pub fn push_payload(record: &AuditRecord, job: &str) -> Result<Value> {
    let line = serde_json::to_string(record).context("Failed to serialize audit record")?;
    let timestamp_ns = Utc::now()
        .timestamp_nanos_opt()
        .context("Current time out of range for nanosecond timestamps")?;

    Ok(json!({
        "streams": [{
            "stream": {
                "job": job,
                "action_type": record.action_type.as_str(),
                "status": record.status.as_str(),
                "namespace": record.namespace,
            },
            "values": [[timestamp_ns.to_string(), line]]
        }]
    }))
}

#[async_trait]
impl AuditSink for LokiSink {
    fn name(&self) -> &'static str {
        "loki"
    }

    async fn forward(&self, record: &AuditRecord) -> Result<()> {
        let payload = push_payload(record, &self.job)?;

        debug!(audit_id = %record.id, url = %self.push_url, "Pushing audit record to Loki");

        let response = self
            .client
            .post(&self.push_url)
            .json(&payload)
            .send()
            .await
            .context("Failed to send push request to Loki")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Loki push failed with status {status}: {body}");
        }

        Ok(())
    }
}
