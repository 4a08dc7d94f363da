//! Prometheus metrics endpoint.
//!
//! Unauthenticated so Prometheus can scrape it. Labels are bounded and carry
//! no subjects, tokens or key material.

use axum::{extract::State, response::IntoResponse};
use metrics_exporter_prometheus::PrometheusHandle;

/// GET /metrics
#[tracing::instrument(skip_all, name = "token.metrics.scrape")]
pub async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    handle.render()
}
