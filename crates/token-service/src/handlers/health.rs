//! Liveness and readiness probes.
//!
//! - `/health`: the process is running
//! - `/ready`: a key set can be published, so tokens can be verified

use crate::routes::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_set: Option<&'static str>,
}

/// Liveness probe. Checks no dependencies.
pub async fn health_check() -> &'static str {
    "OK"
}

/// Readiness probe. 503 until a non-empty key set is available.
///
/// The reason is logged server-side; the body stays generic.
#[tracing::instrument(skip_all, name = "token.health.readiness")]
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.lifecycle.published_jwks().await {
        Ok(jwks) if !jwks.keys.is_empty() => (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready",
                key_set: Some("healthy"),
            }),
        ),
        Ok(_) => {
            tracing::warn!(target: "token.keys", "Readiness check failed: empty key set");
            not_ready()
        }
        Err(e) => {
            tracing::warn!(target: "token.keys", error = %e, "Readiness check failed: key set unavailable");
            not_ready()
        }
    }
}

fn not_ready() -> (StatusCode, Json<ReadinessResponse>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ReadinessResponse {
            status: "not_ready",
            key_set: Some("unhealthy"),
        }),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_check_returns_ok() {
        assert_eq!(health_check().await, "OK");
    }

    #[test]
    fn test_readiness_response_serialization() {
        let body = serde_json::to_value(ReadinessResponse {
            status: "not_ready",
            key_set: Some("unhealthy"),
        })
        .unwrap();
        assert_eq!(body["status"], "not_ready");
        assert_eq!(body["key_set"], "unhealthy");
    }
}
