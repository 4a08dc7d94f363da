//! Refresh-token rotation and family revocation.
//!
//! A refresh token is single use. Presenting the current generation's
//! token yields the next generation; presenting any older one (or any token
//! of a revoked family) is a replay, and the whole family is revoked with
//! every still-live token id pushed to the revocation store.
//!
//! A family bound to a client key only rotates for a caller that proves
//! possession of that key. The proof is checked before replay
//! classification, so a stolen refresh token without the key cannot force
//! the family's revocation.
//!
//! The only exclusion is the store's conditional `advance`, scoped to one
//! family. Tokens for the next generation are signed before that call, so
//! a caller that is cancelled or loses the race leaves no partial state.

use crate::crypto::hash_refresh_token;
use crate::errors::TokenError;
use crate::models::{Generation, GenerationStatus, TokenFamily, TokenPair};
use crate::observability::{hash_for_correlation, metrics};
use crate::repositories::{AdvanceOutcome, FamilyStore, RevocationStore, RevokedFamily};
use crate::services::dpop::{DpopRequest, ProofVerifier};
use crate::services::issuer::TokenIssuer;
use chrono::Utc;
use common::jwt::MAX_JWT_SIZE_BYTES;
use common::types::FamilyId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::instrument;

/// Buffered security events per subscriber before the oldest are dropped.
pub const SECURITY_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationReason {
    Replay,
    Administrative,
    Subject,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::Replay => "replay",
            RevocationReason::Administrative => "administrative",
            RevocationReason::Subject => "subject",
        }
    }
}

/// Audit-relevant outcomes, broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityEvent {
    /// A superseded refresh token, or one from a revoked family, was presented.
    ReplayDetected {
        family_id: FamilyId,
        presented_generation: u32,
        current_generation: u32,
        subject_hash: String,
    },
    /// A family was revoked outside of replay handling.
    FamilyRevoked {
        family_id: FamilyId,
        reason: RevocationReason,
        subject_hash: String,
    },
}

pub struct FamilyTracker {
    issuer: Arc<TokenIssuer>,
    families: Arc<dyn FamilyStore>,
    revocations: Arc<dyn RevocationStore>,
    proofs: Arc<ProofVerifier>,
    events: broadcast::Sender<SecurityEvent>,
}

impl FamilyTracker {
    pub fn new(
        issuer: Arc<TokenIssuer>,
        families: Arc<dyn FamilyStore>,
        revocations: Arc<dyn RevocationStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(SECURITY_EVENT_CAPACITY);
        Self {
            issuer,
            families,
            revocations,
            proofs: Arc::new(ProofVerifier::in_memory()),
            events,
        }
    }

    /// Share a proof verifier (and its replay ledger) with other components.
    pub fn with_proof_verifier(mut self, proofs: Arc<ProofVerifier>) -> Self {
        self.proofs = proofs;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.events.subscribe()
    }

    /// Exchange a refresh token for the next generation's tokens.
    ///
    /// Fails with `ProofInvalid` for a sender-constrained family; use
    /// [`rotate_with_proof`](Self::rotate_with_proof) there.
    pub async fn rotate(&self, refresh_token: &str) -> Result<TokenPair, TokenError> {
        self.rotate_with_proof(refresh_token, None).await
    }

    /// Exchange a refresh token, presenting a proof of possession.
    ///
    /// A proof sent for an unbound family must still verify, but the family
    /// stays unbound.
    ///
    /// # Errors
    ///
    /// - `TokenInvalid` if no generation matches the token
    /// - `ProofInvalid` / `ProofReplayed` if the family is bound and the
    ///   proof is missing, invalid, reused, or made with another key; nothing
    ///   is revoked in that case
    /// - `TokenReplayed` if the token was already used or its family is
    ///   revoked; the family is revoked as a side effect
    /// - `TokenExpired` if the current generation's refresh token expired
    /// - `SigningUnavailable` / `StoreUnavailable` on collaborator failure,
    ///   with no state change
    #[instrument(skip_all, fields(family_id, generation))]
    pub async fn rotate_with_proof(
        &self,
        refresh_token: &str,
        proof: Option<&DpopRequest<'_>>,
    ) -> Result<TokenPair, TokenError> {
        let start = Instant::now();
        let result = self.rotate_inner(refresh_token, proof).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.code(),
        };
        metrics::record_token_rotation(outcome);
        metrics::record_token_issuance(
            "rotate",
            if result.is_ok() { "success" } else { "error" },
            start.elapsed(),
        );
        result
    }

    async fn rotate_inner(
        &self,
        refresh_token: &str,
        proof: Option<&DpopRequest<'_>>,
    ) -> Result<TokenPair, TokenError> {
        if refresh_token.is_empty() || refresh_token.len() > MAX_JWT_SIZE_BYTES {
            return Err(TokenError::TokenInvalid);
        }
        let hash = hash_refresh_token(refresh_token);

        let Some((family, generation)) = self.families.find_by_refresh_hash(&hash).await? else {
            tracing::debug!(target: "token.family", "Refresh token not recognized");
            return Err(TokenError::TokenInvalid);
        };
        let span = tracing::Span::current();
        span.record("family_id", tracing::field::display(family.family_id));
        span.record("generation", generation.number);

        self.check_possession(&family, proof).await?;

        if is_replay(&family, &generation) {
            return Err(self.handle_replay(&family, &generation).await);
        }

        let now = Utc::now().timestamp();
        if generation.refresh_expired(now) {
            tracing::debug!(target: "token.family", "Refresh token expired");
            return Err(TokenError::TokenExpired);
        }

        let next_number = generation
            .number
            .checked_add(1)
            .ok_or_else(|| TokenError::Internal("generation counter exhausted".to_string()))?;
        let minted = self
            .issuer
            .mint_generation(&family, next_number, None, now)
            .await?;

        match self
            .families
            .advance(&family, generation.number, &minted.generation)
            .await?
        {
            AdvanceOutcome::Advanced => {
                tracing::info!(
                    target: "token.family",
                    family_id = %family.family_id,
                    generation = next_number,
                    "Rotated refresh token"
                );
                Ok(minted.into_pair(&family))
            }
            AdvanceOutcome::Stale => {
                // Lost to a concurrent rotation or revocation; classify against fresh state
                match self.families.find_by_refresh_hash(&hash).await? {
                    Some((fresh_family, fresh_generation)) => {
                        Err(self.handle_replay(&fresh_family, &fresh_generation).await)
                    }
                    None => Err(TokenError::TokenInvalid),
                }
            }
            AdvanceOutcome::Missing => Err(TokenError::TokenInvalid),
        }
    }

    async fn check_possession(
        &self,
        family: &TokenFamily,
        proof: Option<&DpopRequest<'_>>,
    ) -> Result<(), TokenError> {
        let presented = match proof {
            Some(request) => Some(self.proofs.verify(request, None).await?),
            None => None,
        };
        let Some(expected) = &family.dpop_jkt else {
            return Ok(());
        };
        match presented {
            Some(binding) if binding.jkt == *expected => Ok(()),
            presented => {
                tracing::warn!(
                    target: "token.security",
                    family_id = %family.family_id,
                    proof_presented = presented.is_some(),
                    "Refresh of a sender-constrained family without proof of its key"
                );
                Err(TokenError::ProofInvalid)
            }
        }
    }

    async fn handle_replay(&self, family: &TokenFamily, generation: &Generation) -> TokenError {
        let subject_hash = hash_for_correlation(&family.subject);
        tracing::warn!(
            target: "token.security",
            family_id = %family.family_id,
            presented_generation = generation.number,
            current_generation = family.current_generation,
            family_revoked = family.is_revoked(),
            subject_hash = %subject_hash,
            "Refresh token replay detected, revoking family"
        );
        metrics::record_replay_detected();
        self.emit(SecurityEvent::ReplayDetected {
            family_id: family.family_id,
            presented_generation: generation.number,
            current_generation: family.current_generation,
            subject_hash,
        });

        match self
            .revoke_and_cascade(family.family_id, RevocationReason::Replay)
            .await
        {
            Ok(_) => TokenError::TokenReplayed,
            Err(e) => e,
        }
    }

    /// Revoke one family (logout). Idempotent.
    ///
    /// # Errors
    ///
    /// `TokenInvalid` for an unknown family id.
    #[instrument(skip_all, fields(family_id = %family_id))]
    pub async fn revoke_family(&self, family_id: FamilyId) -> Result<(), TokenError> {
        self.revoke_and_cascade(family_id, RevocationReason::Administrative)
            .await?
            .ok_or(TokenError::TokenInvalid)?;
        Ok(())
    }

    /// Revoke every active family of `subject` (logout everywhere).
    ///
    /// Returns how many families this call revoked.
    #[instrument(skip_all, fields(subject_hash = %hash_for_correlation(subject)))]
    pub async fn revoke_subject(&self, subject: &str) -> Result<usize, TokenError> {
        let mut revoked_count = 0;
        for family_id in self.families.families_for_subject(subject).await? {
            match self.families.get(family_id).await? {
                Some(family) if !family.is_revoked() => {}
                _ => continue,
            }
            let Some(revoked) = self
                .revoke_and_cascade(family_id, RevocationReason::Subject)
                .await?
            else {
                continue;
            };
            if revoked.newly_revoked {
                revoked_count += 1;
            }
        }

        tracing::info!(target: "token.family", revoked = revoked_count, "Revoked subject families");
        Ok(revoked_count)
    }

    /// Revoke the family in the store, then push every live token id.
    ///
    /// `FamilyRevoked` goes out as soon as the store reports the family newly
    /// revoked, before any push, because a retry after a failed cascade finds
    /// the family already revoked. Every live id is attempted even if some
    /// writes fail; any failure is reported as `StoreUnavailable` so the
    /// caller can retry (puts are idempotent).
    async fn revoke_and_cascade(
        &self,
        family_id: FamilyId,
        reason: RevocationReason,
    ) -> Result<Option<RevokedFamily>, TokenError> {
        let now = Utc::now().timestamp();
        let Some(revoked) = self.families.revoke(family_id, now).await? else {
            return Ok(None);
        };

        if revoked.newly_revoked && reason != RevocationReason::Replay {
            self.emit(SecurityEvent::FamilyRevoked {
                family_id,
                reason,
                subject_hash: hash_for_correlation(&revoked.family.subject),
            });
        }

        let mut written = 0u64;
        let mut failed = 0u64;
        for generation in &revoked.generations {
            for token in generation.live_tokens(now) {
                let ttl = Duration::from_secs(token.expires_at.saturating_sub(now).unsigned_abs());
                match self.revocations.put(&token.jti, ttl).await {
                    Ok(()) => written += 1,
                    Err(e) => {
                        tracing::warn!(target: "token.revocation", error = %e, "Failed to push revoked token id");
                        failed += 1;
                    }
                }
            }
        }
        metrics::record_revocation_write("success", written);
        if failed > 0 {
            metrics::record_revocation_write("error", failed);
        }

        if revoked.newly_revoked {
            metrics::record_family_revocation(reason.as_str());
            tracing::info!(
                target: "token.family",
                family_id = %family_id,
                reason = reason.as_str(),
                generations = revoked.generations.len(),
                revoked_token_ids = written,
                "Family revoked"
            );
        }

        if failed > 0 {
            return Err(TokenError::StoreUnavailable);
        }
        Ok(Some(revoked))
    }

    fn emit(&self, event: SecurityEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!(target: "token.security", "No security event subscribers");
        }
    }
}

fn is_replay(family: &TokenFamily, generation: &Generation) -> bool {
    family.is_revoked()
        || generation.status != GenerationStatus::Current
        || generation.number != family.current_generation
}
