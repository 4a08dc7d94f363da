//! Proof-of-possession checks for sender-constrained tokens (RFC 9449).
//!
//! [`ProofVerifier`] accepts a proof only if, in order:
//!
//! 1. its envelope and signature verify ([`verify_proof`])
//! 2. `htm` and `htu` name the request it arrived with
//! 3. `iat` lies within `max_age` (plus clock skew) of now
//! 4. on resource requests, `ath` is the hash of the presented access token
//! 5. its `jti` has not been seen for the same key inside the window
//!
//! Step 5 runs last so a proof rejected for any other reason does not use up
//! its `jti`. Server-issued nonces are not supported; a `nonce` claim is
//! ignored.

use crate::crypto::dpop::{access_token_hash, verify_proof};
use crate::errors::TokenError;
use crate::observability::metrics;
use crate::repositories::{InMemoryProofReplayStore, ProofReplayStore};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// How old a proof may be when it arrives.
pub const DEFAULT_PROOF_MAX_AGE: Duration = Duration::from_secs(300);

/// Tolerance for client clocks running ahead or behind.
pub const DEFAULT_PROOF_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// A proof as presented with one HTTP request.
#[derive(Clone, Copy)]
pub struct DpopRequest<'a> {
    /// Compact proof JWT from the `DPoP` header.
    pub proof: &'a str,
    pub method: &'a str,
    /// Request URI as the client addressed it.
    pub uri: &'a str,
}

impl<'a> DpopRequest<'a> {
    pub fn new(proof: &'a str, method: &'a str, uri: &'a str) -> Self {
        Self { proof, method, uri }
    }
}

impl fmt::Debug for DpopRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DpopRequest")
            .field("proof", &"[REDACTED]")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .finish()
    }
}

/// The key a verified proof demonstrated possession of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpopBinding {
    /// RFC 7638 thumbprint, as carried in `cnf.jkt`.
    pub jkt: String,
}

#[derive(Debug, Clone)]
pub struct DpopSettings {
    pub max_age: Duration,
    pub clock_skew: Duration,
}

impl Default for DpopSettings {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_PROOF_MAX_AGE,
            clock_skew: DEFAULT_PROOF_CLOCK_SKEW,
        }
    }
}

pub struct ProofVerifier {
    replay: Arc<dyn ProofReplayStore>,
    settings: DpopSettings,
}

impl ProofVerifier {
    pub fn new(replay: Arc<dyn ProofReplayStore>, settings: DpopSettings) -> Self {
        Self { replay, settings }
    }

    /// Default settings over a process-local replay ledger.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryProofReplayStore::new()),
            DpopSettings::default(),
        )
    }

    /// Verify `request` and return the key it proves.
    ///
    /// Pass the access token on resource requests so `ath` is enforced; pass
    /// `None` at the token endpoint.
    ///
    /// # Errors
    ///
    /// - `ProofInvalid` for any structural, signature or binding failure
    /// - `ProofReplayed` when the proof was already accepted once
    /// - `StoreUnavailable` when the replay ledger cannot be reached
    #[instrument(skip_all, fields(method = %request.method))]
    pub async fn verify(
        &self,
        request: &DpopRequest<'_>,
        access_token: Option<&str>,
    ) -> Result<DpopBinding, TokenError> {
        let result = self
            .verify_at(request, access_token, Utc::now().timestamp())
            .await;
        metrics::record_dpop_proof(match &result {
            Ok(_) => "accepted",
            Err(e) => e.code(),
        });
        result
    }

    async fn verify_at(
        &self,
        request: &DpopRequest<'_>,
        access_token: Option<&str>,
        now: i64,
    ) -> Result<DpopBinding, TokenError> {
        let proof = verify_proof(request.proof)?;
        let claims = &proof.claims;

        if !claims.htm.eq_ignore_ascii_case(request.method) {
            tracing::debug!(target: "token.dpop", "Proof made for another method");
            return Err(TokenError::ProofInvalid);
        }
        if normalize_uri(&claims.htu) != normalize_uri(request.uri) {
            tracing::debug!(target: "token.dpop", "Proof made for another URI");
            return Err(TokenError::ProofInvalid);
        }

        let skew = secs(self.settings.clock_skew);
        let oldest = now.saturating_sub(skew).saturating_sub(secs(self.settings.max_age));
        if claims.iat > now.saturating_add(skew) || claims.iat < oldest {
            tracing::debug!(target: "token.dpop", iat = claims.iat, "Proof outside its time window");
            return Err(TokenError::ProofInvalid);
        }

        if let Some(token) = access_token {
            if claims.ath.as_deref() != Some(access_token_hash(token).as_str()) {
                tracing::debug!(target: "token.dpop", "Proof not made for this access token");
                return Err(TokenError::ProofInvalid);
            }
        }

        let key = replay_key(&proof.jkt, &claims.jti);
        if !self.replay.claim(&key, self.replay_window()).await? {
            tracing::warn!(target: "token.security", "Proof replay detected");
            return Err(TokenError::ProofReplayed);
        }

        Ok(DpopBinding { jkt: proof.jkt })
    }

    /// Span during which a given `iat` is accepted; a `jti` must stay
    /// claimed at least this long.
    fn replay_window(&self) -> Duration {
        self.settings
            .max_age
            .saturating_add(self.settings.clock_skew.saturating_mul(2))
    }
}

/// Scheme and authority compare case-insensitively; query, fragment and a
/// trailing slash are not part of `htu`.
fn normalize_uri(uri: &str) -> String {
    let end = uri.find(|c| c == '?' || c == '#').unwrap_or(uri.len());
    uri.get(..end)
        .unwrap_or(uri)
        .trim_end_matches('/')
        .to_ascii_lowercase()
}

/// `jti`s are unique per key, and hashing bounds the ledger key length.
fn replay_key(jkt: &str, jti: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(jkt.as_bytes());
    hasher.update(b":");
    hasher.update(jti.as_bytes());
    hex::encode(hasher.finalize())
}

fn secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}
