//! Executor core: verify, authorize, record and dispatch a single request.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::AuditTrail;
use crate::dispatch::ActionDispatcher;
use crate::error::{ExecutorError, ExecutorResult, StoreError};
use crate::models::{ActionRequest, AuditRecord, AuditUpdate, NewAuditRecord};
use crate::policy::NamespacePolicy;
use crate::signature::{self, SignatureVerifier};

/// Connection details captured by the transport layer.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub ip_address: Option<String>,
}

/// Runs remediation requests end to end.
///
/// Every call writes exactly one audit record, whatever the outcome.
#[derive(Clone)]
pub struct Executor {
    verifier: SignatureVerifier,
    policy: Arc<NamespacePolicy>,
    audit: AuditTrail,
    dispatcher: ActionDispatcher,
    signature_max_age: Option<Duration>,
}

impl Executor {
    #[must_use]
    pub fn new(
        verifier: SignatureVerifier,
        policy: NamespacePolicy,
        audit: AuditTrail,
        dispatcher: ActionDispatcher,
    ) -> Self {
        Self {
            verifier,
            policy: Arc::new(policy),
            audit,
            dispatcher,
            signature_max_age: None,
        }
    }

    /// Reject requests whose timestamp is further than `max_age` from now.
    #[must_use]
    pub fn with_signature_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.signature_max_age = max_age;
        self
    }

    #[must_use]
    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Execute one signed remediation request.
    ///
    /// The pending record is written before any check so that rejected
    /// attempts are still attributable. The whole flow runs on its own task,
    /// so every record it creates reaches a terminal state even if the
    /// caller goes away.
    pub async fn execute(
        &self,
        request: ActionRequest,
        context: RequestContext,
    ) -> ExecutorResult<AuditRecord> {
        let executor = self.clone();
        let task = tokio::spawn(async move { executor.run(request, context).await });
        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Remediation task aborted");
                Err(ExecutorError::Persistence(StoreError::Backend {
                    reason: format!("remediation task aborted: {e}"),
                }))
            }
        }
    }

    async fn run(
        &self,
        request: ActionRequest,
        context: RequestContext,
    ) -> ExecutorResult<AuditRecord> {
        let record = self
            .audit
            .create(NewAuditRecord::from_request(&request, context.ip_address))
            .await
            .inspect_err(|e| error!(error = %e, "Failed to create audit record"))?;
        let audit_id = record.id;

        info!(
            audit_id = %audit_id,
            action_type = %request.action_type,
            namespace = %request.namespace,
            resource = %request.resource_name,
            signature = %signature_prefix(&request.signature),
            "Remediation request received"
        );

        if let Some(reason) = self.authentication_failure(&request) {
            warn!(audit_id = %audit_id, reason, "Rejected remediation: authentication failed");
            self.record_transition(audit_id, AuditUpdate::rejected(reason)).await?;
            return Err(ExecutorError::Authentication {
                audit_id,
                reason: reason.to_string(),
            });
        }

        if !self.policy.is_allowed(&request.namespace) {
            warn!(
                audit_id = %audit_id,
                namespace = %request.namespace,
                "Rejected remediation: namespace not allowed"
            );
            let reason = format!("Namespace '{}' is not allowed", request.namespace);
            self.record_transition(audit_id, AuditUpdate::rejected(reason)).await?;
            return Err(ExecutorError::Authorization {
                audit_id,
                namespace: request.namespace,
            });
        }

        self.record_transition(audit_id, AuditUpdate::in_progress()).await?;

        let result = self.dispatch_and_record(audit_id, &request).await;
        match &result {
            Ok(record) => info!(
                audit_id = %audit_id,
                duration_ms = record.execution_duration,
                "Remediation completed"
            ),
            Err(ExecutorError::Persistence(_)) => {}
            Err(e) => warn!(audit_id = %audit_id, error = %e, "Remediation failed"),
        }
        result
    }

    /// Perform the dispatch and write the terminal transition.
    async fn dispatch_and_record(
        &self,
        audit_id: Uuid,
        request: &ActionRequest,
    ) -> ExecutorResult<AuditRecord> {
        let outcome = self
            .dispatcher
            .dispatch(
                request.action_type,
                &request.namespace,
                &request.resource_type,
                &request.resource_name,
                &request.action_params,
            )
            .await;

        match outcome {
            Ok(done) => {
                let update = AuditUpdate::completed(done.result, done.duration_ms);
                self.record_transition(audit_id, update).await
            }
            Err(failure) => {
                let update = AuditUpdate::failed(failure.error.to_string(), failure.duration_ms);
                let record = self.record_transition(audit_id, update).await?;
                Err(ExecutorError::Dispatch {
                    source: failure.error,
                    record: Box::new(record),
                })
            }
        }
    }

    async fn record_transition(
        &self,
        audit_id: Uuid,
        update: AuditUpdate,
    ) -> ExecutorResult<AuditRecord> {
        let status = update.status;
        let record = self
            .audit
            .transition(audit_id, update)
            .await
            .inspect_err(|e| {
                error!(audit_id = %audit_id, %status, error = %e, "Failed to record transition");
            })?;
        Ok(record)
    }

    /// Reason the request fails authentication, if it does.
    fn authentication_failure(&self, request: &ActionRequest) -> Option<&'static str> {
        if !self.verifier.verify(request) {
            return Some("Invalid signature");
        }
        if let Some(max_age) = self.signature_max_age {
            if !signature::is_fresh(&request.timestamp, max_age, Utc::now()) {
                return Some("Request timestamp is stale or malformed");
            }
        }
        None
    }
}

/// First characters of a signature, safe to log.
fn signature_prefix(signature: &str) -> &str {
    signature.get(..8).unwrap_or(signature)
}
