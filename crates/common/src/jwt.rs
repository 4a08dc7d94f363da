//! JWT structural helpers shared by the issuer, the validator and test tooling.
//!
//! This module knows the compact JWS layout (`header.payload.signature`) but
//! nothing about keys or claim semantics:
//! - Size limits applied before any parsing
//! - Clock skew constants for `iat` validation
//! - Key ID extraction from the untrusted header
//! - Building the signing input and attaching a detached signature
//! - Ed25519 public key encoding for JWK `x` values
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing
//! - Nothing read by [`extract_kid`] is trusted; it only selects a key
//! - Error messages are generic; details go to debug logs

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum allowed JWT size in bytes (8KB).
///
/// Tokens above this size are rejected before base64 decoding or any
/// signature work. Issued tokens are well under 1KB even with custom claims.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Default JWT clock skew tolerance (5 minutes).
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Maximum allowed JWT clock skew tolerance (10 minutes).
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

/// The only signature algorithm issued or accepted.
pub const EDDSA_ALG: &str = "EdDSA";

/// Raw Ed25519 public key length.
pub const ED25519_PUBLIC_KEY_LEN: usize = 32;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while handling the JWT envelope.
///
/// Messages are intentionally identical so callers can't learn which check failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    /// Token size exceeds maximum allowed.
    #[error("The access token is invalid or expired")]
    TokenTooLarge,

    /// Token format is invalid (not a valid JWT structure).
    #[error("The access token is invalid or expired")]
    MalformedToken,

    /// Token is missing required `kid` header.
    #[error("The access token is invalid or expired")]
    MissingKid,

    /// Token `iat` claim is too far in the future.
    #[error("The access token is invalid or expired")]
    IatTooFarInFuture,
}

// =============================================================================
// Header
// =============================================================================

/// JOSE header written on every issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoseHeader {
    pub alg: String,
    pub typ: String,
    pub kid: String,
}

impl JoseHeader {
    /// `EdDSA` header for the given key id.
    #[must_use]
    pub fn eddsa(kid: impl Into<String>) -> Self {
        Self {
            alg: EDDSA_ALG.to_string(),
            typ: "JWT".to_string(),
            kid: kid.into(),
        }
    }
}

// =============================================================================
// Functions
// =============================================================================

/// Build the JWS signing input `base64url(header).base64url(payload)`.
///
/// # Errors
///
/// Returns the serializer error if either part fails to serialize.
pub fn encode_signing_input<C: Serialize>(
    header: &JoseHeader,
    claims: &C,
) -> Result<String, serde_json::Error> {
    let header_json = serde_json::to_vec(header)?;
    let payload_json = serde_json::to_vec(claims)?;
    Ok(format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header_json),
        URL_SAFE_NO_PAD.encode(payload_json)
    ))
}

/// Append a detached signature to a signing input, producing a compact JWS.
#[must_use]
pub fn attach_signature(signing_input: &str, signature: &[u8]) -> String {
    format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature))
}

/// Reject tokens larger than [`MAX_JWT_SIZE_BYTES`].
///
/// # Errors
///
/// Returns `TokenTooLarge` when the limit is exceeded.
pub fn check_size(token: &str) -> Result<(), JwtValidationError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtValidationError::TokenTooLarge);
    }
    Ok(())
}

/// Extract the `kid` (key ID) from a JWT header without verifying the signature.
///
/// The returned value is attacker-controlled. It may only be used to look up a
/// key in a trusted key set; the token must still be verified with that key.
///
/// # Errors
///
/// - `TokenTooLarge` - Token exceeds size limit
/// - `MalformedToken` - Wrong structure, bad base64, or invalid JSON
/// - `MissingKid` - Header has no non-empty string `kid`
pub fn extract_kid(token: &str) -> Result<String, JwtValidationError> {
    check_size(token)?;

    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        tracing::debug!(
            target: "common.jwt",
            parts = parts.len(),
            "Token rejected: invalid JWT format"
        );
        return Err(JwtValidationError::MalformedToken);
    }

    let header_part = parts.first().ok_or(JwtValidationError::MalformedToken)?;
    let header_bytes = URL_SAFE_NO_PAD.decode(header_part).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to decode JWT header base64");
        JwtValidationError::MalformedToken
    })?;

    let header: serde_json::Value = serde_json::from_slice(&header_bytes).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to parse JWT header JSON");
        JwtValidationError::MalformedToken
    })?;

    header
        .get("kid")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or(JwtValidationError::MissingKid)
}

/// Check the `iat` (issued-at) claim against `now` with clock skew tolerance.
///
/// # Errors
///
/// Returns `IatTooFarInFuture` if `iat` is more than `clock_skew` ahead of `now`.
pub fn validate_iat_at(
    iat: i64,
    clock_skew: Duration,
    now: i64,
) -> Result<(), JwtValidationError> {
    // Clamped to MAX_CLOCK_SKEW so the cast can't wrap
    #[allow(clippy::cast_possible_wrap)]
    let clock_skew_secs = clock_skew.min(MAX_CLOCK_SKEW).as_secs() as i64;
    let max_iat = now + clock_skew_secs;

    if iat > max_iat {
        tracing::debug!(
            target: "common.jwt",
            iat = iat,
            now = now,
            max_allowed = max_iat,
            "Token rejected: iat too far in the future"
        );
        return Err(JwtValidationError::IatTooFarInFuture);
    }

    Ok(())
}

/// Encode a raw Ed25519 public key as a JWK `x` value (base64url, no padding).
#[must_use]
pub fn encode_ed25519_public_key_jwk(public_key: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(public_key)
}

/// Decode an Ed25519 public key from a JWK `x` value.
///
/// # Errors
///
/// Returns `MalformedToken` when `x` is not base64url or not 32 bytes long.
pub fn decode_ed25519_public_key_jwk(x_b64url: &str) -> Result<Vec<u8>, JwtValidationError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(x_b64url)
        .map_err(|_| JwtValidationError::MalformedToken)?;
    if bytes.len() != ED25519_PUBLIC_KEY_LEN {
        return Err(JwtValidationError::MalformedToken);
    }
    Ok(bytes)
}

// =============================================================================
// Tests
// =============================================================================
