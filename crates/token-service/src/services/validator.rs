//! Access-token validation.
//!
//! Nothing in the token is trusted before its signature verifies: the `kid`
//! is read from the unvalidated header only to pick a key. Checks run in a
//! fixed order and the first failure wins:
//!
//! 1. size and header structure
//! 2. key lookup (`TokenInvalid`, or `KeySetUnavailable`)
//! 3. signature (`TokenInvalid`)
//! 4. `exp` (`TokenExpired`)
//! 5. `nbf` / `iat` against the clock skew (`ClaimsInvalid`)
//! 6. caller requirements (`ClaimsInvalid`)
//! 7. revocation (`TokenRevoked`, or `StoreUnavailable` when the store fails)
//! 8. for a token carrying `cnf.jkt`, a proof of possession of that key made
//!    for this token (`ProofInvalid` / `ProofReplayed`)
//!
//! A proof presented with an unbound token is ignored.

use crate::crypto::verify_signature;
use crate::errors::TokenError;
use crate::models::{Claims, RequiredClaims, TokenUse};
use crate::observability::metrics;
use crate::repositories::RevocationStore;
use crate::services::dpop::{DpopRequest, ProofVerifier};
use crate::services::key_cache::KeyMaterialCache;
use chrono::Utc;
use common::jwt::{check_size, extract_kid, validate_iat_at, MAX_CLOCK_SKEW};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

pub struct TokenValidator {
    keys: Arc<KeyMaterialCache>,
    revocations: Arc<dyn RevocationStore>,
    proofs: Arc<ProofVerifier>,
    clock_skew: Duration,
}

impl TokenValidator {
    pub fn new(
        keys: Arc<KeyMaterialCache>,
        revocations: Arc<dyn RevocationStore>,
        clock_skew: Duration,
    ) -> Self {
        Self {
            keys,
            revocations,
            proofs: Arc::new(ProofVerifier::in_memory()),
            clock_skew: clock_skew.min(MAX_CLOCK_SKEW),
        }
    }

    /// Share a proof verifier (and its replay ledger) with other components.
    pub fn with_proof_verifier(mut self, proofs: Arc<ProofVerifier>) -> Self {
        self.proofs = proofs;
        self
    }

    /// Validate a token and return its claims.
    ///
    /// A sender-constrained token fails with `ProofInvalid` here; use
    /// [`validate_with_proof`](Self::validate_with_proof).
    pub async fn validate(
        &self,
        token: &str,
        required: &RequiredClaims,
    ) -> Result<Claims, TokenError> {
        self.validate_observed(token, required, None).await
    }

    /// Validate a token presented together with a proof of possession.
    pub async fn validate_with_proof(
        &self,
        token: &str,
        required: &RequiredClaims,
        proof: &DpopRequest<'_>,
    ) -> Result<Claims, TokenError> {
        self.validate_observed(token, required, Some(proof)).await
    }

    #[instrument(skip_all)]
    async fn validate_observed(
        &self,
        token: &str,
        required: &RequiredClaims,
        proof: Option<&DpopRequest<'_>>,
    ) -> Result<Claims, TokenError> {
        let result = match self.validate_at(token, required, Utc::now().timestamp()).await {
            Ok(claims) => self
                .check_binding(token, &claims, proof)
                .await
                .map(|()| claims),
            Err(e) => Err(e),
        };
        match &result {
            Ok(_) => metrics::record_token_validation("success", None),
            Err(e) => {
                tracing::debug!(target: "token.validator", code = e.code(), "Token rejected");
                metrics::record_token_validation("error", Some(e.category()));
            }
        }
        result
    }

    async fn validate_at(
        &self,
        token: &str,
        required: &RequiredClaims,
        now: i64,
    ) -> Result<Claims, TokenError> {
        check_size(token).map_err(|_| TokenError::TokenInvalid)?;
        let kid = extract_kid(token).map_err(|_| TokenError::TokenInvalid)?;

        let key = self.keys.get_key(&kid).await?;
        let claims = verify_signature(token, &key)?;

        if now >= claims.exp {
            return Err(TokenError::TokenExpired);
        }
        if let Some(nbf) = claims.nbf {
            if nbf > now.saturating_add(skew_secs(self.clock_skew)) {
                tracing::debug!(target: "token.validator", "Token not yet valid");
                return Err(TokenError::ClaimsInvalid);
            }
        }
        validate_iat_at(claims.iat, self.clock_skew, now).map_err(|_| TokenError::ClaimsInvalid)?;

        if let Err(requirement) = required.check(&claims) {
            tracing::debug!(target: "token.validator", requirement, "Token missing required claim");
            return Err(TokenError::ClaimsInvalid);
        }

        if self.revocations.exists(&claims.jti).await? {
            return Err(TokenError::TokenRevoked);
        }

        Ok(claims)
    }

    async fn check_binding(
        &self,
        token: &str,
        claims: &Claims,
        proof: Option<&DpopRequest<'_>>,
    ) -> Result<(), TokenError> {
        let Some(expected) = claims.bound_key() else {
            return Ok(());
        };
        let Some(request) = proof else {
            tracing::debug!(target: "token.validator", "Sender-constrained token without proof");
            return Err(TokenError::ProofInvalid);
        };
        let binding = self.proofs.verify(request, Some(token)).await?;
        if binding.jkt != expected {
            tracing::debug!(target: "token.validator", "Proof made with another key");
            return Err(TokenError::ProofInvalid);
        }
        Ok(())
    }

    /// Revoke a single access token until its own expiry (single-session
    /// logout). Revoking an already-revoked token succeeds.
    #[instrument(skip_all)]
    pub async fn revoke_token(&self, token: &str) -> Result<(), TokenError> {
        let required = RequiredClaims::new().token_use(TokenUse::Access);
        let now = Utc::now().timestamp();
        let claims = match self.validate_at(token, &required, now).await {
            Ok(claims) => claims,
            Err(TokenError::TokenRevoked) => return Ok(()),
            Err(e) => return Err(e),
        };

        let ttl = Duration::from_secs(claims.exp.saturating_sub(now).unsigned_abs());
        self.revocations.put(&claims.jti, ttl).await?;
        metrics::record_revocation_write("success", 1);
        tracing::info!(target: "token.revocation", "Access token revoked");
        Ok(())
    }
}

fn skew_secs(skew: Duration) -> i64 {
    i64::try_from(skew.as_secs()).unwrap_or(i64::MAX)
}
