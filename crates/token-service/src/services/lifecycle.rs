//! Wiring of the token lifecycle components.
//!
//! [`TokenLifecycle`] owns one issuer, family tracker, validator and key
//! cache sharing the same signer and stores, and exposes the operations
//! callers use. `from_config` picks the backends at startup.

use crate::config::Config;
use crate::crypto::signer::{build_signer, BuiltSigner, LocalSigner, SigningKeySource};
use crate::errors::TokenError;
use crate::models::{Claims, Jwks, RequiredClaims, SigningKey, TokenPair};
use crate::repositories::{
    connect_redis, FamilyStore, InMemoryFamilyStore, InMemoryProofReplayStore,
    InMemoryRevocationStore, ProofReplayStore, RedisFamilyStore, RedisProofReplayStore,
    RedisRevocationStore, RevocationStore,
};
use crate::services::dpop::{DpopBinding, DpopRequest, DpopSettings, ProofVerifier};
use crate::services::family_tracker::{FamilyTracker, SecurityEvent};
use crate::services::issuer::{IssueRequest, IssuerSettings, TokenIssuer};
use crate::services::key_cache::{
    HttpKeySetFetcher, KeyCacheConfig, KeyMaterialCache, KeySetFetcher, MergedKeySetFetcher,
    DEFAULT_FETCH_TIMEOUT, DEFAULT_MISS_REFRESH_COOLDOWN,
};
use crate::services::validator::TokenValidator;
use chrono::Utc;
use common::types::FamilyId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Everything needed to assemble a [`TokenLifecycle`].
pub struct LifecycleParts {
    pub signer: Arc<dyn SigningKeySource>,
    /// Set when this process signs with its own keys.
    pub local_signer: Option<Arc<LocalSigner>>,
    pub fetcher: Arc<dyn KeySetFetcher>,
    pub families: Arc<dyn FamilyStore>,
    pub revocations: Arc<dyn RevocationStore>,
    pub proof_replay: Arc<dyn ProofReplayStore>,
    pub settings: IssuerSettings,
    pub key_cache: KeyCacheConfig,
    pub clock_skew: Duration,
    pub dpop: DpopSettings,
}

/// In-memory stores that need periodic purging.
#[derive(Clone)]
pub struct MemoryStores {
    pub families: Arc<InMemoryFamilyStore>,
    pub revocations: Arc<InMemoryRevocationStore>,
    pub proofs: Arc<InMemoryProofReplayStore>,
}

pub struct TokenLifecycle {
    issuer: Arc<TokenIssuer>,
    tracker: Arc<FamilyTracker>,
    validator: TokenValidator,
    proofs: Arc<ProofVerifier>,
    keys: Arc<KeyMaterialCache>,
    local_signer: Option<Arc<LocalSigner>>,
    memory: Option<MemoryStores>,
    access_requirements: RequiredClaims,
}

impl TokenLifecycle {
    pub fn assemble(parts: LifecycleParts) -> Self {
        let access_requirements =
            RequiredClaims::access(&parts.settings.issuer, &parts.settings.audience);
        let issuer = Arc::new(TokenIssuer::new(
            parts.signer,
            Arc::clone(&parts.families),
            parts.settings,
        ));
        // One replay ledger: a proof spent at the token endpoint is spent everywhere
        let proofs = Arc::new(ProofVerifier::new(parts.proof_replay, parts.dpop));
        let tracker = Arc::new(
            FamilyTracker::new(
                Arc::clone(&issuer),
                parts.families,
                Arc::clone(&parts.revocations),
            )
            .with_proof_verifier(Arc::clone(&proofs)),
        );
        let keys = Arc::new(KeyMaterialCache::new(parts.fetcher, parts.key_cache));
        let validator = TokenValidator::new(Arc::clone(&keys), parts.revocations, parts.clock_skew)
            .with_proof_verifier(Arc::clone(&proofs));

        Self {
            issuer,
            tracker,
            validator,
            proofs,
            keys,
            local_signer: parts.local_signer,
            memory: None,
            access_requirements,
        }
    }

    /// Attach in-memory stores so the maintenance task purges them.
    pub fn with_memory_stores(mut self, stores: MemoryStores) -> Self {
        self.memory = Some(stores);
        self
    }

    /// Build from configuration: signer backend, Redis or in-memory stores,
    /// and a key cache fed by `KEY_SET_URL` or the local publisher. With a
    /// signing fallback, the fallback key is merged into the fetched set.
    pub async fn from_config(config: &Config) -> Result<Self, TokenError> {
        let BuiltSigner {
            source,
            local,
            fallback,
        } = build_signer(config)?;

        let fetcher: Arc<dyn KeySetFetcher> = match (&config.key_set_url, &local) {
            (Some(url), _) => Arc::new(HttpKeySetFetcher::new(url.clone(), DEFAULT_FETCH_TIMEOUT)?),
            (None, Some(local)) => local.publisher() as Arc<dyn KeySetFetcher>,
            (None, None) => {
                return Err(TokenError::Internal(
                    "no key set source configured".to_string(),
                ))
            }
        };
        let fetcher = match &fallback {
            Some(fallback) => Arc::new(MergedKeySetFetcher::new(
                fetcher,
                fallback.publisher() as Arc<dyn KeySetFetcher>,
            )) as Arc<dyn KeySetFetcher>,
            None => fetcher,
        };

        let key_cache = KeyCacheConfig {
            ttl: config.key_cache_ttl,
            stale_grace: config.key_cache_stale_grace,
            miss_refresh_cooldown: DEFAULT_MISS_REFRESH_COOLDOWN,
        };

        let (families, revocations, proof_replay, memory) = match &config.redis_url {
            Some(url) => {
                let connection = connect_redis(url).await?;
                tracing::info!(target: "token.store", backend = "redis", "Token stores ready");
                (
                    Arc::new(RedisFamilyStore::new(connection.clone())) as Arc<dyn FamilyStore>,
                    Arc::new(RedisRevocationStore::new(connection.clone()))
                        as Arc<dyn RevocationStore>,
                    Arc::new(RedisProofReplayStore::new(connection)) as Arc<dyn ProofReplayStore>,
                    None,
                )
            }
            None => {
                tracing::info!(target: "token.store", backend = "memory", "Token stores ready");
                let stores = MemoryStores {
                    families: Arc::new(InMemoryFamilyStore::new()),
                    revocations: Arc::new(InMemoryRevocationStore::new()),
                    proofs: Arc::new(InMemoryProofReplayStore::new()),
                };
                (
                    Arc::clone(&stores.families) as Arc<dyn FamilyStore>,
                    Arc::clone(&stores.revocations) as Arc<dyn RevocationStore>,
                    Arc::clone(&stores.proofs) as Arc<dyn ProofReplayStore>,
                    Some(stores),
                )
            }
        };

        let lifecycle = Self::assemble(LifecycleParts {
            signer: source,
            local_signer: local,
            fetcher,
            families,
            revocations,
            proof_replay,
            settings: IssuerSettings::from_config(config),
            key_cache,
            clock_skew: config.clock_skew,
            dpop: DpopSettings {
                max_age: config.dpop_proof_max_age,
                clock_skew: config.dpop_clock_skew,
            },
        });
        Ok(match memory {
            Some(stores) => lifecycle.with_memory_stores(stores),
            None => lifecycle,
        })
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub async fn issue(&self, request: IssueRequest) -> Result<TokenPair, TokenError> {
        self.issuer.issue(request).await
    }

    pub async fn rotate(&self, refresh_token: &str) -> Result<TokenPair, TokenError> {
        self.tracker.rotate(refresh_token).await
    }

    /// Rotate a refresh token presented with a proof of possession. Required
    /// for sender-constrained families.
    pub async fn rotate_with_proof(
        &self,
        refresh_token: &str,
        proof: &DpopRequest<'_>,
    ) -> Result<TokenPair, TokenError> {
        self.tracker.rotate_with_proof(refresh_token, Some(proof)).await
    }

    /// Verify a token-endpoint proof and return the key to bind a new family
    /// to with [`IssueRequest::bound_to`].
    pub async fn verify_dpop_proof(
        &self,
        proof: &DpopRequest<'_>,
    ) -> Result<DpopBinding, TokenError> {
        self.proofs.verify(proof, None).await
    }

    pub async fn revoke_family(&self, family_id: FamilyId) -> Result<(), TokenError> {
        self.tracker.revoke_family(family_id).await
    }

    pub async fn revoke_subject(&self, subject: &str) -> Result<usize, TokenError> {
        self.tracker.revoke_subject(subject).await
    }

    pub async fn validate(
        &self,
        token: &str,
        required: &RequiredClaims,
    ) -> Result<Claims, TokenError> {
        self.validator.validate(token, required).await
    }

    pub async fn validate_with_proof(
        &self,
        token: &str,
        required: &RequiredClaims,
        proof: &DpopRequest<'_>,
    ) -> Result<Claims, TokenError> {
        self.validator.validate_with_proof(token, required, proof).await
    }

    /// Validate a bearer access token from this issuer for this audience.
    pub async fn validate_access(&self, token: &str) -> Result<Claims, TokenError> {
        self.validator.validate(token, &self.access_requirements).await
    }

    /// Validate an access token from this issuer presented with a proof.
    pub async fn validate_access_with_proof(
        &self,
        token: &str,
        proof: &DpopRequest<'_>,
    ) -> Result<Claims, TokenError> {
        self.validator
            .validate_with_proof(token, &self.access_requirements, proof)
            .await
    }

    pub async fn revoke_token(&self, token: &str) -> Result<(), TokenError> {
        self.validator.revoke_token(token).await
    }

    pub async fn get_key(&self, kid: &str) -> Result<SigningKey, TokenError> {
        self.keys.get_key(kid).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.tracker.subscribe()
    }

    /// The key set to publish at the JWKS endpoint.
    ///
    /// With a local signer this is the authoritative published set.
    /// Otherwise the cached set fetched from `KEY_SET_URL` is relayed.
    pub async fn published_jwks(&self) -> Result<Jwks, TokenError> {
        if let Some(local) = &self.local_signer {
            return Ok(local.publisher().jwks());
        }
        let set = match self.keys.current_set() {
            Some(set) => set,
            None => self.keys.refresh().await?,
        };
        Ok(set.to_jwks())
    }

    pub fn key_cache(&self) -> &Arc<KeyMaterialCache> {
        &self.keys
    }

    pub fn local_signer(&self) -> Option<&Arc<LocalSigner>> {
        self.local_signer.as_ref()
    }

    /// Generate a new local signing key and publish it. The previous key
    /// stays published for the grace window.
    pub async fn rotate_signing_key(&self) -> Result<String, TokenError> {
        let Some(local) = &self.local_signer else {
            return Err(TokenError::InvalidRequest(
                "signing keys are managed by the remote signer".to_string(),
            ));
        };
        let kid = local.rotate().await?;
        // Make the new key visible to validation without waiting for the next tick
        self.keys.refresh().await?;
        Ok(kid)
    }

    // =========================================================================
    // Background work
    // =========================================================================

    /// Periodically prune keys past their grace window and purge expired
    /// in-memory records until `cancel_token` fires.
    pub fn spawn_maintenance_task(
        self: &Arc<Self>,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        let lifecycle = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => lifecycle.run_maintenance().await,
                    () = cancel_token.cancelled() => {
                        tracing::info!(target: "token.store", "Maintenance task received shutdown signal, exiting");
                        break;
                    }
                }
            }
        })
    }

    async fn run_maintenance(&self) {
        if let Some(local) = &self.local_signer {
            local.prune_expired().await;
        }
        if let Some(stores) = &self.memory {
            let families = stores.families.purge_expired(Utc::now().timestamp());
            let revocations = stores.revocations.purge_expired();
            let proofs = stores.proofs.purge_expired();
            if families > 0 || revocations > 0 || proofs > 0 {
                tracing::debug!(
                    target: "token.store",
                    families,
                    revocations,
                    proofs,
                    "Purged expired records"
                );
            }
        }
    }
}
