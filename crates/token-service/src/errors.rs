//! Error taxonomy for the token lifecycle.
//!
//! Every public operation returns [`TokenError`]. Collaborator failures
//! ([`SignerError`], [`StoreError`], [`FetchError`], [`ProofError`]) are
//! converted into it at the component boundary, after their detail has been
//! logged.
//!
//! Client-facing messages never carry key material, store addresses, or
//! which validation step failed.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Generic message for every authentication failure.
pub const UNAUTHENTICATED_MESSAGE: &str = "The access token is invalid or expired";

#[derive(Debug, Error)]
pub enum TokenError {
    /// Malformed caller input. Not retried.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Signing key source unreachable or timed out.
    #[error("Signing service unavailable")]
    SigningUnavailable,

    /// No usable verification key set (fresh or within stale grace).
    #[error("Key set unavailable")]
    KeySetUnavailable,

    /// Family or revocation store unreachable.
    #[error("Token store unavailable")]
    StoreUnavailable,

    /// No matching record, bad signature, or unknown key.
    #[error("The access token is invalid or expired")]
    TokenInvalid,

    #[error("The access token is invalid or expired")]
    TokenExpired,

    #[error("The access token is invalid or expired")]
    ClaimsInvalid,

    #[error("The access token is invalid or expired")]
    TokenRevoked,

    /// A superseded refresh token was presented; the family has been revoked.
    #[error("The access token is invalid or expired")]
    TokenReplayed,

    /// Missing, malformed or mismatched proof of possession for a
    /// sender-constrained token.
    #[error("The access token is invalid or expired")]
    ProofInvalid,

    /// A proof of possession was presented twice.
    #[error("The access token is invalid or expired")]
    ProofReplayed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TokenError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            TokenError::InvalidRequest(_) => "INVALID_REQUEST",
            TokenError::SigningUnavailable => "SIGNING_UNAVAILABLE",
            TokenError::KeySetUnavailable => "KEY_SET_UNAVAILABLE",
            TokenError::StoreUnavailable => "STORE_UNAVAILABLE",
            TokenError::TokenInvalid => "TOKEN_INVALID",
            TokenError::TokenExpired => "TOKEN_EXPIRED",
            TokenError::ClaimsInvalid => "CLAIMS_INVALID",
            TokenError::TokenRevoked => "TOKEN_REVOKED",
            TokenError::TokenReplayed => "TOKEN_REPLAYED",
            TokenError::ProofInvalid => "DPOP_PROOF_INVALID",
            TokenError::ProofReplayed => "DPOP_PROOF_REPLAYED",
            TokenError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Transient failures where retry-with-backoff by the caller is reasonable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TokenError::SigningUnavailable
                | TokenError::KeySetUnavailable
                | TokenError::StoreUnavailable
        )
    }

    /// Failures that are surfaced to clients as a generic "unauthenticated".
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            TokenError::TokenInvalid
                | TokenError::TokenExpired
                | TokenError::ClaimsInvalid
                | TokenError::TokenRevoked
                | TokenError::TokenReplayed
                | TokenError::ProofInvalid
                | TokenError::ProofReplayed
        )
    }

    /// Bounded label for metrics.
    pub fn category(&self) -> &'static str {
        if self.is_authentication_failure() {
            "authentication"
        } else if self.is_retryable() {
            "unavailable"
        } else if matches!(self, TokenError::InvalidRequest(_)) {
            "request"
        } else {
            "internal"
        }
    }
}

// =============================================================================
// Collaborator errors
// =============================================================================

/// Failures reported by a signing key source.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("signer unavailable: {0}")]
    Unavailable(String),

    #[error("signer has no usable key for the requested id")]
    UnknownKey,

    #[error("signer rejected the request: {0}")]
    Rejected(String),
}

/// Failures reported by the family or revocation store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store returned corrupt record: {0}")]
    Corrupt(String),
}

/// Failures fetching a key set from the publishing endpoint.
#[derive(Debug, Error, Clone)]
pub enum FetchError {
    #[error("key set endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("key set document malformed: {0}")]
    Malformed(String),

    #[error("key set contains no usable key")]
    EmptyKeySet,
}

/// Reasons a proof-of-possession JWT fails structural or signature checks.
#[derive(Debug, Error)]
pub enum ProofError {
    #[error("proof malformed: {0}")]
    Malformed(&'static str),

    #[error("proof algorithm not accepted: {0}")]
    UnsupportedAlgorithm(String),

    #[error("proof key does not match its algorithm")]
    KeyMismatch,

    #[error("proof signature invalid")]
    BadSignature,
}

impl From<SignerError> for TokenError {
    fn from(err: SignerError) -> Self {
        tracing::warn!(target: "token.issuer", error = %err, "Signing key source failed");
        TokenError::SigningUnavailable
    }
}

impl From<StoreError> for TokenError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(detail) => {
                tracing::warn!(target: "token.store", error = %detail, "Store unavailable");
                TokenError::StoreUnavailable
            }
            StoreError::Corrupt(detail) => {
                tracing::error!(target: "token.store", error = %detail, "Corrupt store record");
                TokenError::Internal("corrupt store record".to_string())
            }
        }
    }
}

impl From<ProofError> for TokenError {
    fn from(err: ProofError) -> Self {
        tracing::debug!(target: "token.dpop", error = %err, "Proof rejected");
        TokenError::ProofInvalid
    }
}

impl From<FetchError> for TokenError {
    fn from(err: FetchError) -> Self {
        tracing::warn!(target: "token.keys", error = %err, "Key set fetch failed");
        TokenError::KeySetUnavailable
    }
}

// =============================================================================
// HTTP mapping
// =============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for TokenError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            TokenError::InvalidRequest(reason) => {
                (StatusCode::BAD_REQUEST, self.code(), reason.clone())
            }
            TokenError::SigningUnavailable
            | TokenError::KeySetUnavailable
            | TokenError::StoreUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                self.code(),
                "Service temporarily unavailable".to_string(),
            ),
            TokenError::TokenInvalid
            | TokenError::TokenExpired
            | TokenError::ClaimsInvalid
            | TokenError::TokenRevoked
            | TokenError::TokenReplayed
            | TokenError::ProofInvalid
            | TokenError::ProofReplayed => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHENTICATED",
                UNAUTHENTICATED_MESSAGE.to_string(),
            ),
            TokenError::Internal(detail) => {
                tracing::error!(target: "token.errors", error = %detail, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    self.code(),
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        };

        (status, Json(body)).into_response()
    }
}
