//! Remediation executor binary.
//!
//! `serve` runs the HTTP service; `sign` produces a request signature offline
//! with the same canonicalization the service verifies.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use executor::{
    server::{self, AppState},
    ActionDispatcher, ActionType, AuditStore, AuditTrail, Config, Executor, KubeOrchestrator,
    LokiSink, MemoryAuditStore, ReconcileConfig, SelfHealingReconciler, SignedFields,
};

/// Privileged remediation executor
#[derive(Parser)]
#[command(name = "executor")]
#[command(about = "Verifies, authorizes, audits and executes signed cluster remediations")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service (default)
    Serve {
        /// Port to listen on
        #[arg(long, env = "EXECUTOR_PORT")]
        port: Option<u16>,
    },
    /// Print a signature for the given request fields
    Sign {
        /// Action type, e.g. restart_pod
        #[arg(long)]
        action_type: ActionType,
        #[arg(long)]
        namespace: String,
        #[arg(long)]
        resource_type: String,
        #[arg(long)]
        resource_name: String,
        /// Request timestamp (defaults to now, RFC 3339)
        #[arg(long)]
        timestamp: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            init_tracing()?;
            serve(config, port).await
        }
        Commands::Sign {
            action_type,
            namespace,
            resource_type,
            resource_name,
            timestamp,
        } => {
            let verifier = config.verifier()?;
            let timestamp = timestamp.unwrap_or_else(|| Utc::now().to_rfc3339());
            let signature = verifier.sign(SignedFields {
                action_type,
                namespace: &namespace,
                resource_type: &resource_type,
                resource_name: &resource_name,
                timestamp: &timestamp,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "signature": signature,
                    "timestamp": timestamp,
                }))?
            );
            Ok(())
        }
    }
}

/// Text output by default, JSON lines with `LOG_FORMAT=json`.
fn init_tracing() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("executor=info".parse()?);
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
    Ok(())
}

async fn serve(mut config: Config, port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        config.port = port;
    }
    config.validate().context("Invalid configuration")?;
    info!(?config, "Starting remediation executor...");

    let verifier = config.verifier()?;
    let policy = config.namespace_policy();
    info!(
        namespaces = ?policy.namespaces().collect::<Vec<_>>(),
        "Namespace allow-list loaded"
    );

    let mut audit = AuditTrail::new(build_store(&config).await?);
    if let Some(url) = &config.loki_url {
        let sink = LokiSink::new(url, config.sink_timeout)?;
        info!(url = %sink.push_url(), "Forwarding audit records to Loki");
        audit = audit.with_sink(Arc::new(sink), config.sink_timeout);
    }

    let orchestrator = KubeOrchestrator::try_default().await?;
    info!("Connected to Kubernetes");
    let dispatcher = ActionDispatcher::new(Arc::new(orchestrator), config.dispatch_timeout);

    let executor = Executor::new(verifier.clone(), policy, audit.clone(), dispatcher)
        .with_signature_max_age(config.signature_max_age);
    let reconciler = SelfHealingReconciler::new(
        audit,
        ReconcileConfig {
            window: config.self_healing_window,
            ..ReconcileConfig::default()
        },
    );

    if let Some(interval) = config.self_healing_interval {
        tokio::spawn(reconciler.clone().run(interval));
    } else {
        info!("Self-healing loop disabled");
    }

    let app = server::build_router(AppState {
        executor,
        reconciler,
        verifier,
        signing_enabled: config.signing_endpoint_enabled,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!(%addr, "Executor listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Executor stopped");
    Ok(())
}

async fn build_store(config: &Config) -> Result<Arc<dyn AuditStore>> {
    #[cfg(feature = "postgres")]
    if let Some(url) = &config.database_url {
        let store = executor::audit::PgAuditStore::connect(url)
            .await
            .context("Failed to connect to audit database")?;
        info!("Using Postgres audit store");
        return Ok(Arc::new(store));
    }

    if config.database_url.is_some() {
        warn!(
            "DATABASE_URL is set but the postgres feature is disabled - using in-memory audit store"
        );
    } else {
        warn!("Using in-memory audit store - records are lost on restart");
    }
    Ok(Arc::new(MemoryAuditStore::new()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}
