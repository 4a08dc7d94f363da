//! Token Lifecycle Service
//!
//! # Startup Flow
//!
//! 1. Initialize tracing (`LOG_LEVEL`, `LOG_FORMAT`, `RUST_LOG`)
//! 2. Load configuration from environment
//! 3. Install the Prometheus metrics recorder
//! 4. Build the lifecycle: signer backend, stores, key cache
//! 5. Warm the key cache and spawn the refresh and maintenance tasks
//! 6. Serve JWKS, health and metrics until a shutdown signal

use anyhow::Context;
use common::config::ObservabilityConfig;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use token_service::config::Config;
use token_service::routes::{self, AppState};
use token_service::services::{SecurityEvent, TokenLifecycle};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How often expired in-memory records and retired keys are dropped.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Time allowed for background tasks to observe cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let observability = ObservabilityConfig::from_vars(&std::env::vars().collect());
    init_tracing(&observability);

    info!("Starting Token Lifecycle Service");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        issuer = %config.issuer,
        audience = %config.audience,
        access_ttl_secs = config.access_token_ttl.as_secs(),
        refresh_ttl_secs = config.refresh_token_ttl.as_secs(),
        remote_key_set = config.key_set_url.is_some(),
        redis = config.redis_url.is_some(),
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus metrics recorder")?;

    let lifecycle = Arc::new(
        TokenLifecycle::from_config(&config)
            .await
            .context("failed to initialize token lifecycle")?,
    );

    // A cold cache is not fatal: validation retries the fetch on first use
    if let Err(e) = lifecycle.key_cache().refresh().await {
        warn!(error = %e, "Initial key set fetch failed");
    }

    let shutdown_token = CancellationToken::new();

    let refresh_task = lifecycle
        .key_cache()
        .spawn_refresh_task(config.key_refresh_interval, shutdown_token.child_token());
    let maintenance_task =
        lifecycle.spawn_maintenance_task(MAINTENANCE_INTERVAL, shutdown_token.child_token());
    let audit_task = spawn_security_event_logger(&lifecycle, shutdown_token.child_token());

    let addr: SocketAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.bind_address))?;

    let app = routes::build_routes(
        Arc::new(AppState {
            lifecycle: Arc::clone(&lifecycle),
        }),
        prometheus_handle,
    );

    // Bind before serving to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "Token Lifecycle Service listening");

    let server_token = shutdown_token.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, initiating graceful shutdown...");
            server_token.cancel();
        })
        .await
        .context("HTTP server failed")?;

    shutdown_token.cancel();
    for task in [refresh_task, maintenance_task, audit_task] {
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            warn!("Background task did not stop within the shutdown grace period");
        }
    }

    info!("Token Lifecycle Service shutdown complete");
    Ok(())
}

fn init_tracing(observability: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "token_service={level},common={level},tower_http=info",
            level = observability.log_level
        )
        .into()
    });

    let json_layer = observability.json_logs.then(|| fmt::layer().json());
    let text_layer = (!observability.json_logs).then(fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

/// Forward security events to the `token.audit` target, one line per event.
fn spawn_security_event_logger(
    lifecycle: &Arc<TokenLifecycle>,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut events = lifecycle.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                event = events.recv() => match event {
                    Ok(SecurityEvent::ReplayDetected { family_id, presented_generation, .. }) => {
                        info!(target: "token.audit", family_id = %family_id, presented_generation, "replay_detected");
                    }
                    Ok(SecurityEvent::FamilyRevoked { family_id, reason, .. }) => {
                        info!(target: "token.audit", family_id = %family_id, reason = reason.as_str(), "family_revoked");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(target: "token.audit", missed, "Security event subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
