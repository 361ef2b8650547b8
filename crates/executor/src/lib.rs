//! Privileged remediation executor.
//!
//! This crate provides:
//! - Signature verification for remediation requests
//! - Namespace allow-list enforcement
//! - Append-only audit trail with in-memory and Postgres stores
//! - Best-effort audit forwarding to Loki
//! - Dispatch of remediation actions against Kubernetes
//! - Self-healing reconciliation over recent audit history
//! - HTTP server exposing the executor

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod models;
pub mod policy;
pub mod reconcile;
pub mod server;
pub mod signature;
pub mod sink;

pub use audit::{AuditStore, AuditTrail, MemoryAuditStore};
pub use config::Config;
pub use dispatch::{ActionDispatcher, ClusterOrchestrator, KubeOrchestrator, RemediationAction};
pub use error::{DispatchError, ExecutorError, ExecutorResult, StoreError, StoreResult};
pub use executor::{Executor, RequestContext};
pub use models::*;
pub use policy::NamespacePolicy;
pub use reconcile::{ReconcileConfig, SelfHealingReconciler, SelfHealingReport};
pub use signature::{canonical_payload, SignatureVerifier, SignedFields};
pub use sink::{AuditSink, LokiSink};
