use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clusterback_core::{
    load_config, validate_config, AuditEvent, AuditRecord, AuditStore, Collaborators, Config,
    EnvSecretStore, FanoutNotificationSink, HttpControlPlane, LogNotificationSink, MapProvider,
    NotificationSink, OperationStore, RestoreOrchestrator, SqliteAuditStore, SqliteOperationStore,
    WebhookNotificationSink,
};

use clusterback_server::api::create_router;
use clusterback_server::state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Determine config path
    let config_path = std::env::var("CLUSTERBACK_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    // Load configuration
    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    validate_config(&config).context("Configuration validation failed")?;

    info!("Configuration loaded successfully");
    info!("Database path: {:?}", config.database.path);

    // Compute config hash for audit
    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    let config_hash_short = &config_hash[..16];

    let operation_store: Arc<dyn OperationStore> = Arc::new(
        SqliteOperationStore::new(&config.database.path)
            .context("Failed to create operation store")?,
    );
    info!("Operation store initialized");

    let audit_store: Arc<dyn AuditStore> = Arc::new(
        SqliteAuditStore::new(&config.database.path).context("Failed to create audit store")?,
    );
    info!("Audit store initialized");

    record(
        audit_store.as_ref(),
        AuditEvent::ServiceStarted {
            version: VERSION.to_string(),
            config_hash: config_hash_short.to_string(),
        },
    );

    let collaborators = build_collaborators(&config)?;

    let orchestrator = Arc::new(
        RestoreOrchestrator::new(
            config.orchestrator.clone(),
            Arc::clone(&operation_store),
            Arc::clone(&audit_store),
            collaborators,
        )
        .with_remote_settings(Arc::new(MapProvider::new(
            "settings",
            config.settings.clone(),
        ))),
    );

    if config.orchestrator.enabled {
        orchestrator.start().await;
    } else {
        info!("Orchestrator worker loop disabled in config; operations run on resume only");
    }

    let state = Arc::new(AppState::new(
        config.clone(),
        Arc::clone(&orchestrator),
        operation_store,
        Arc::clone(&audit_store),
    ));

    let app = create_router(state);

    // Start server
    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if config.orchestrator.enabled {
        info!("Stopping orchestrator...");
        orchestrator.stop().await;
    }

    info!("Server shutting down...");
    record(
        audit_store.as_ref(),
        AuditEvent::ServiceStopped {
            reason: "graceful_shutdown".to_string(),
        },
    );

    Ok(())
}

/// Wire the control-plane gateway, secret store and notification sinks.
fn build_collaborators(config: &Config) -> Result<Collaborators> {
    let control_plane_config = config
        .control_plane
        .as_ref()
        .context("A [control_plane] section is required to run restores")?;

    info!("Using control-plane gateway at {}", control_plane_config.url);
    let control_plane = Arc::new(
        HttpControlPlane::new(control_plane_config)
            .context("Failed to create control-plane client")?,
    );

    info!(
        "Reading credentials from environment ({}*)",
        config.secrets.env_prefix
    );
    let secrets = Arc::new(EnvSecretStore::new(config.secrets.env_prefix.clone()));

    let mut sinks: Vec<Arc<dyn NotificationSink>> = Vec::new();
    if config.notifications.log {
        sinks.push(Arc::new(LogNotificationSink));
    }
    if let Some(ref webhook) = config.notifications.webhook {
        info!("Publishing notifications to webhook {}", webhook.url);
        sinks.push(Arc::new(
            WebhookNotificationSink::new(webhook).context("Failed to create webhook sink")?,
        ));
    }
    if sinks.is_empty() {
        warn!("All notification sinks disabled; falling back to the log sink");
        sinks.push(Arc::new(LogNotificationSink));
    }

    Ok(Collaborators {
        resources: control_plane.clone(),
        secrets,
        provisioner: control_plane,
        notifier: Arc::new(FanoutNotificationSink::new(sinks)),
    })
}

fn record(audit: &dyn AuditStore, event: AuditEvent) {
    let event_type = event.event_type().to_string();
    match audit.append(&AuditRecord::new(event)) {
        Ok(_) => info!("Recorded {} audit event", event_type),
        Err(e) => warn!(error = %e, "Failed to record {} audit event", event_type),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
