//! Postgres-backed audit store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::info;
use uuid::Uuid;

use super::AuditStore;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    AuditFilter, AuditRecord, AuditStatistics, AuditStatus, AuditUpdate, NewAuditRecord,
    PolicyDecision,
};

const COLUMNS: &str = "id, action_type, status, namespace, resource_type, resource_name, \
    action_params, requested_by, ip_address, policy_decision, execution_duration, \
    error_message, result, signature, created_at, completed_at";

const SCHEMA: [&str; 3] = [
    r"
    CREATE TABLE IF NOT EXISTS audit_logs (
        id UUID PRIMARY KEY,
        action_type TEXT NOT NULL,
        status TEXT NOT NULL,
        namespace TEXT NOT NULL,
        resource_type TEXT NOT NULL,
        resource_name TEXT NOT NULL,
        action_params JSONB NOT NULL DEFAULT '{}'::jsonb,
        requested_by TEXT,
        ip_address TEXT,
        policy_decision JSONB,
        execution_duration BIGINT,
        error_message TEXT,
        result JSONB,
        signature TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        completed_at TIMESTAMPTZ
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_audit_logs_created_at ON audit_logs (created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_audit_logs_action_type ON audit_logs (action_type)",
];

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend {
        reason: e.to_string(),
    }
}

/// Audit store persisted in the `audit_logs` table.
#[derive(Clone)]
pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and make sure the schema exists.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(backend)?;
        let store = Self::new(pool);
        store.initialize().await?;
        Ok(store)
    }

    /// Create the table and indexes when missing.
    pub async fn initialize(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        info!("Audit schema ready");
        Ok(())
    }

    async fn current_status(&self, id: Uuid) -> StoreResult<Option<AuditStatus>> {
        let row = sqlx::query("SELECT status FROM audit_logs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        row.map(|row| {
            let status: String = row.try_get("status").map_err(backend)?;
            parse_column(&status)
        })
        .transpose()
    }
}

fn parse_column<T: std::str::FromStr<Err = String>>(value: &str) -> StoreResult<T> {
    value
        .parse()
        .map_err(|reason| StoreError::Backend { reason })
}

fn row_to_record(row: &PgRow) -> StoreResult<AuditRecord> {
    let action_type: String = row.try_get("action_type").map_err(backend)?;
    let status: String = row.try_get("status").map_err(backend)?;
    let action_params: Json<Value> = row.try_get("action_params").map_err(backend)?;
    let policy_decision: Option<Json<PolicyDecision>> =
        row.try_get("policy_decision").map_err(backend)?;
    let execution_duration: Option<i64> = row.try_get("execution_duration").map_err(backend)?;
    let result: Option<Json<Value>> = row.try_get("result").map_err(backend)?;

    Ok(AuditRecord {
        id: row.try_get("id").map_err(backend)?,
        action_type: parse_column(&action_type)?,
        status: parse_column(&status)?,
        namespace: row.try_get("namespace").map_err(backend)?,
        resource_type: row.try_get("resource_type").map_err(backend)?,
        resource_name: row.try_get("resource_name").map_err(backend)?,
        action_params: action_params.0,
        requested_by: row.try_get("requested_by").map_err(backend)?,
        ip_address: row.try_get("ip_address").map_err(backend)?,
        policy_decision: policy_decision.map(|d| d.0),
        execution_duration: execution_duration.map(|ms| ms as u64),
        error_message: row.try_get("error_message").map_err(backend)?,
        result: result.map(|r| r.0),
        signature: row.try_get("signature").map_err(backend)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(backend)?,
        completed_at: row.try_get("completed_at").map_err(backend)?,
    })
}

#[async_trait]
impl AuditStore for PgAuditStore {
    fn store_type(&self) -> &'static str {
        "postgres"
    }

    async fn insert(&self, record: NewAuditRecord) -> StoreResult<AuditRecord> {
        let record = AuditRecord::pending(Uuid::new_v4(), record, Utc::now());

        sqlx::query(
            r"
            INSERT INTO audit_logs (
                id, action_type, status, namespace, resource_type, resource_name,
                action_params, requested_by, ip_address, policy_decision, signature, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ",
        )
        .bind(record.id)
        .bind(record.action_type.as_str())
        .bind(record.status.as_str())
        .bind(&record.namespace)
        .bind(&record.resource_type)
        .bind(&record.resource_name)
        .bind(Json(&record.action_params))
        .bind(&record.requested_by)
        .bind(&record.ip_address)
        .bind(record.policy_decision.as_ref().map(Json))
        .bind(&record.signature)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(record)
    }

    async fn update(&self, id: Uuid, update: AuditUpdate) -> StoreResult<AuditRecord> {
        let allowed_from: Vec<String> = AuditStatus::predecessors(update.status)
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let terminal = update.status.is_terminal();

        // The status guard makes the check-and-set a single statement
        let sql = format!(
            r"
            UPDATE audit_logs SET
                status = $2,
                completed_at = CASE WHEN $3 THEN NOW() ELSE completed_at END,
                execution_duration = CASE WHEN $3 THEN $4 ELSE execution_duration END,
                error_message = COALESCE($5, error_message),
                result = COALESCE($6, result)
            WHERE id = $1 AND status = ANY($7)
            RETURNING {COLUMNS}
            "
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(update.status.as_str())
            .bind(terminal)
            .bind(update.execution_duration.map(|ms| ms as i64))
            .bind(&update.error_message)
            .bind(update.result.as_ref().map(Json))
            .bind(&allowed_from)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        match row {
            Some(row) => row_to_record(&row),
            None => match self.current_status(id).await? {
                None => Err(StoreError::NotFound { id }),
                Some(from) => Err(StoreError::InvalidTransition {
                    id,
                    from,
                    to: update.status,
                }),
            },
        }
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<AuditRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM audit_logs WHERE id = $1");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .as_ref()
            .map(row_to_record)
            .transpose()
    }

    async fn query(&self, filter: &AuditFilter) -> StoreResult<Vec<AuditRecord>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM audit_logs WHERE TRUE"));

        if let Some(action_type) = filter.action_type {
            builder
                .push(" AND action_type = ")
                .push_bind(action_type.as_str());
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(namespace) = &filter.namespace {
            builder.push(" AND namespace = ").push_bind(namespace.clone());
        }
        if let Some(from) = filter.from {
            builder.push(" AND created_at >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            builder.push(" AND created_at <= ").push_bind(to);
        }
        builder
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(filter.effective_limit() as i64);

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(row_to_record).collect()
    }

    async fn statistics(&self) -> StoreResult<AuditStatistics> {
        let totals = sqlx::query(
            r"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'rejected') AS rejected,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'in_progress') AS in_progress
            FROM audit_logs
            ",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        let count = |column: &str| -> StoreResult<u64> {
            totals
                .try_get::<i64, _>(column)
                .map(|n| n as u64)
                .map_err(backend)
        };
        let mut stats = AuditStatistics {
            total: count("total")?,
            completed: count("completed")?,
            failed: count("failed")?,
            rejected: count("rejected")?,
            pending: count("pending")?,
            in_progress: count("in_progress")?,
            ..AuditStatistics::default()
        };

        let by_type = sqlx::query(
            "SELECT action_type, COUNT(*) AS count FROM audit_logs GROUP BY action_type",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        for row in by_type {
            let action_type: String = row.try_get("action_type").map_err(backend)?;
            let count: i64 = row.try_get("count").map_err(backend)?;
            stats.by_action_type.insert(action_type, count as u64);
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActionType;
    use serde_json::json;

    fn new_record() -> NewAuditRecord {
        NewAuditRecord {
            action_type: ActionType::ScaleDeployment,
            namespace: "default".to_string(),
            resource_type: "deployment".to_string(),
            resource_name: "api".to_string(),
            action_params: json!({"replicas": 3}),
            requested_by: Some("ai-engine".to_string()),
            ip_address: None,
            policy_decision: None,
            signature: "sig".to_string(),
        }
    }

    #[test]
    fn test_parse_column_reports_unknown_values() {
        assert_eq!(
            parse_column::<AuditStatus>("in_progress").unwrap(),
            AuditStatus::InProgress
        );
        assert!(matches!(
            parse_column::<ActionType>("reboot_node"),
            Err(StoreError::Backend { .. })
        ));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointing at a disposable Postgres"]
    async fn test_postgres_lifecycle() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let store = PgAuditStore::connect(&url).await.unwrap();

        let record = store.insert(new_record()).await.unwrap();
        store
            .update(record.id, AuditUpdate::in_progress())
            .await
            .unwrap();
        let done = store
            .update(record.id, AuditUpdate::completed(json!({"newReplicas": 3}), 12))
            .await
            .unwrap();
        assert_eq!(done.status, AuditStatus::Completed);
        assert_eq!(done.execution_duration, Some(12));

        let err = store
            .update(record.id, AuditUpdate::failed("late", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let err = store
            .update(Uuid::new_v4(), AuditUpdate::in_progress())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));

        let fetched = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, record.id);
    }
}
