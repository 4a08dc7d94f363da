//! HTTP routes for the token service.
//!
//! Only the operational surface is served here. Token operations are
//! called in-process through [`TokenLifecycle`].

use crate::handlers;
use crate::services::TokenLifecycle;
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Request timeout for every route.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state shared across all handlers.
pub struct AppState {
    pub lifecycle: Arc<TokenLifecycle>,
}

/// Build the application routes.
///
/// - `/.well-known/jwks.json` - published key set
/// - `/health` - liveness probe
/// - `/ready` - readiness probe (key set available)
/// - `/metrics` - Prometheus exposition
pub fn build_routes(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let app_routes = Router::new()
        .route("/.well-known/jwks.json", get(handlers::handle_get_jwks))
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .with_state(state);

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    app_routes
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
}
