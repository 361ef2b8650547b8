//! HTTP surface for the executor.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{ExecutorError, StoreError};
use crate::executor::{Executor, RequestContext};
use crate::models::{ActionRequest, ActionType, AuditFilter, AuditRecord, AuditStatus};
use crate::reconcile::SelfHealingReconciler;
use crate::signature::{self, SignatureVerifier, SignedFields, CANONICAL_DELIMITER};

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub executor: Executor,
    pub reconciler: SelfHealingReconciler,
    /// Used by the signing endpoint.
    pub verifier: SignatureVerifier,
    pub signing_enabled: bool,
}

/// Build the HTTP router for the executor service.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/executor/execute", post(execute_handler))
        .route("/executor/signature", post(signature_handler))
        .route("/executor/audit", get(audit_query_handler))
        .route("/executor/audit/{id}", get(audit_get_handler))
        .route("/executor/statistics", get(statistics_handler))
        .route("/executor/self-healing", get(self_healing_handler))
        .route("/health", get(health_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
        .with_state(state)
}

/// Errors surfaced by the HTTP layer.
#[derive(Debug)]
pub enum ApiError {
    Executor(ExecutorError),
    Store(StoreError),
    BadRequest(String),
    NotFound(String),
}

impl ApiError {
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Executor(ExecutorError::Authentication { .. }) => StatusCode::UNAUTHORIZED,
            ApiError::Executor(ExecutorError::Authorization { .. }) => StatusCode::FORBIDDEN,
            ApiError::Executor(ExecutorError::Dispatch { source, .. }) => {
                if source.is_client_error() {
                    StatusCode::BAD_REQUEST
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
            ApiError::Executor(ExecutorError::Persistence(_)) | ApiError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl From<ExecutorError> for ApiError {
    fn from(e: ExecutorError) -> Self {
        ApiError::Executor(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = json!({ "success": false });

        match &self {
            ApiError::Executor(e) => {
                body["error"] = json!(e.kind());
                body["message"] = json!(e.to_string());
                if let Some(id) = e.audit_id() {
                    body["auditId"] = json!(id);
                }
                if let ExecutorError::Dispatch { record, .. } = e {
                    body["status"] = json!(record.status);
                    body["executionDuration"] = json!(record.execution_duration);
                }
            }
            ApiError::Store(e) => {
                error!(error = %e, "Audit store request failed");
                body["error"] = json!("audit_unavailable");
                body["message"] = json!("Audit store unavailable");
            }
            ApiError::BadRequest(message) => {
                body["error"] = json!("bad_request");
                body["message"] = json!(message);
            }
            ApiError::NotFound(message) => {
                body["error"] = json!("not_found");
                body["message"] = json!(message);
            }
        }

        (status, Json(body)).into_response()
    }
}

/// Successful execution summary.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResponse {
    success: bool,
    audit_id: Uuid,
    status: AuditStatus,
    result: Option<Value>,
    execution_duration: Option<u64>,
    completed_at: Option<chrono::DateTime<Utc>>,
}

impl From<AuditRecord> for ExecuteResponse {
    fn from(record: AuditRecord) -> Self {
        Self {
            success: true,
            audit_id: record.id,
            status: record.status,
            result: record.result,
            execution_duration: record.execution_duration,
            completed_at: record.completed_at,
        }
    }
}

/// First address in `X-Forwarded-For`, else `X-Real-IP`.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        })
        .map(str::to_string)
}

async fn execute_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ActionRequest>, JsonRejection>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let context = RequestContext {
        ip_address: client_ip(&headers),
    };

    let record = state.executor.execute(request, context).await?;
    Ok(Json(ExecuteResponse::from(record)))
}

/// Fields to sign via the signing endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignRequest {
    action_type: ActionType,
    namespace: String,
    resource_type: String,
    resource_name: String,
    /// Defaults to now.
    #[serde(default)]
    timestamp: Option<String>,
}

async fn signature_handler(
    State(state): State<AppState>,
    payload: Result<Json<SignRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    if !state.signing_enabled {
        return Err(ApiError::NotFound("Signature endpoint is disabled".to_string()));
    }
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let timestamp = request
        .timestamp
        .unwrap_or_else(|| Utc::now().to_rfc3339());

    let fields = SignedFields {
        action_type: request.action_type,
        namespace: &request.namespace,
        resource_type: &request.resource_type,
        resource_name: &request.resource_name,
        timestamp: &timestamp,
    };
    if signature::contains_delimiter(fields) {
        return Err(ApiError::BadRequest(format!(
            "Fields must not contain '{CANONICAL_DELIMITER}'"
        )));
    }

    let signature = state.verifier.sign(fields);
    debug!(
        action_type = %request.action_type,
        namespace = %request.namespace,
        "Signature generated"
    );

    Ok(Json(json!({
        "signature": signature,
        "timestamp": timestamp,
        "algorithm": "hmac-sha256",
    })))
}

async fn audit_query_handler(
    State(state): State<AppState>,
    filter: Result<Query<AuditFilter>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(filter) = filter.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let records = state.executor.audit().query(&filter).await?;

    Ok(Json(json!({
        "success": true,
        "count": records.len(),
        "records": records,
    })))
}

async fn audit_get_handler(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<AuditRecord>, ApiError> {
    let Path(id) = id.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    state
        .executor
        .audit()
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Audit record '{id}' not found")))
}

async fn statistics_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let audit = state.executor.audit();
    let statistics = audit.statistics().await?;

    Ok(Json(json!({
        "success": true,
        "storeType": audit.store_type(),
        "statistics": statistics,
    })))
}

async fn self_healing_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let report = state.reconciler.reconcile().await?;
    info!(
        restarted = report.restarted,
        retried = report.retried,
        "On-demand self-healing report"
    );

    Ok(Json(json!({
        "success": true,
        "report": report,
    })))
}

/// Liveness only; never checks dependencies.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}
