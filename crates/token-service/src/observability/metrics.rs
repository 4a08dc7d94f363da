//! Metrics definitions for the token service
//!
//! All metrics follow Prometheus naming conventions:
//! - `token_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `operation`: issue, rotate
//! - `status`: success, error
//! - `outcome`: bounded by `TokenError::code()` plus `success` / `accepted`
//! - `error_category`: authentication, unavailable, request, internal
//! - `reason`: replay, administrative, subject (revocations);
//!   primary_unavailable, degraded (signing fallback)

use metrics::{counter, histogram};
use std::time::Duration;

// ============================================================================
// Issuance and Rotation
// ============================================================================

/// Record token issuance duration and outcome
///
/// Metric: `token_issuance_duration_seconds`, `token_issuance_total`
/// Labels: `operation`, `status`
pub fn record_token_issuance(operation: &str, status: &str, duration: Duration) {
    histogram!("token_issuance_duration_seconds", "operation" => operation.to_string(), "status" => status.to_string())
        .record(duration.as_secs_f64());

    counter!("token_issuance_total", "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record the outcome of a refresh-token exchange
///
/// Metric: `token_rotations_total`
/// Labels: `outcome`
pub fn record_token_rotation(outcome: &str) {
    counter!("token_rotations_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a detected refresh-token replay
///
/// Metric: `token_replays_detected_total`
///
/// ALERT: sustained non-zero rate suggests token theft
pub fn record_replay_detected() {
    counter!("token_replays_detected_total").increment(1);
}

/// Record a family revocation
///
/// Metric: `token_family_revocations_total`
/// Labels: `reason`
pub fn record_family_revocation(reason: &str) {
    counter!("token_family_revocations_total", "reason" => reason.to_string()).increment(1);
}

// ============================================================================
// Validation and Revocation Store
// ============================================================================

/// Record token validation result
///
/// Metric: `token_validations_total`
/// Labels: `status`, `error_category`
pub fn record_token_validation(status: &str, error_category: Option<&str>) {
    let category = error_category.unwrap_or("none");
    counter!("token_validations_total", "status" => status.to_string(), "error_category" => category.to_string())
        .increment(1);
}

/// Record revocation entries written
///
/// Metric: `token_revocations_written_total`
/// Labels: `status`
pub fn record_revocation_write(status: &str, count: u64) {
    counter!("token_revocations_written_total", "status" => status.to_string()).increment(count);
}

/// Record the outcome of a proof-of-possession check
///
/// Metric: `token_dpop_proofs_total`
/// Labels: `outcome`
pub fn record_dpop_proof(outcome: &str) {
    counter!("token_dpop_proofs_total", "outcome" => outcome.to_string()).increment(1);
}

// ============================================================================
// Key Management
// ============================================================================

/// Record key rotation event
///
/// Metric: `token_key_rotation_total`
/// Labels: `status`
pub fn record_key_rotation(status: &str) {
    counter!("token_key_rotation_total", "status" => status.to_string()).increment(1);
}

/// Record a key set fetch by the cache
///
/// Metric: `token_key_cache_refresh_total`, `token_key_cache_refresh_duration_seconds`
/// Labels: `status`
pub fn record_key_cache_refresh(status: &str, duration: Duration) {
    histogram!("token_key_cache_refresh_duration_seconds", "status" => status.to_string())
        .record(duration.as_secs_f64());

    counter!("token_key_cache_refresh_total", "status" => status.to_string()).increment(1);
}

/// Record a lookup answered from an expired key set after a failed refresh
///
/// Metric: `token_key_cache_stale_serves_total`
pub fn record_key_cache_stale_serve() {
    counter!("token_key_cache_stale_serves_total").increment(1);
}

/// Record a signing call routed to the local fallback key
///
/// Metric: `token_signing_fallback_total`
/// Labels: `reason`
///
/// ALERT: any sustained rate means the primary signer is down
pub fn record_signing_fallback(reason: &str) {
    counter!("token_signing_fallback_total", "reason" => reason.to_string()).increment(1);
}

/// Record JWKS document request
///
/// Metric: `token_jwks_requests_total`
pub fn record_jwks_request() {
    counter!("token_jwks_requests_total").increment(1);
}
