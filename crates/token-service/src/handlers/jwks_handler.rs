use crate::errors::TokenError;
use crate::models::Jwks;
use crate::observability::metrics::record_jwks_request;
use crate::routes::AppState;
use axum::{
    extract::State,
    http::header::{HeaderMap, HeaderValue, CACHE_CONTROL},
    Json,
};
use std::sync::Arc;
use tracing::instrument;

/// Verifiers re-fetch within the key cache TTL, so the two stay aligned.
const JWKS_CACHE_CONTROL: &str = "public, max-age=300";

/// Handle JWKS request
///
/// GET /.well-known/jwks.json
///
/// Returns the published key set (active key first, then keys still within
/// their rotation grace window) in JWKS format (RFC 7517).
#[instrument(name = "token.jwks.get", skip_all, fields(status))]
pub async fn handle_get_jwks(
    State(state): State<Arc<AppState>>,
) -> Result<(HeaderMap, Json<Jwks>), TokenError> {
    let result = state.lifecycle.published_jwks().await;

    let status = if result.is_ok() { "success" } else { "error" };
    tracing::Span::current().record("status", status);
    record_jwks_request();

    let jwks = result?;

    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(JWKS_CACHE_CONTROL));

    Ok((headers, Json(jwks)))
}
