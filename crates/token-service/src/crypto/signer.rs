//! Signing key sources.
//!
//! The issuer only ever sees [`SigningKeySource`]: it asks for the active
//! key id, then hands over the JWS signing input. Private key material
//! stays behind this boundary. Which implementation is used is decided
//! once at startup by [`build_signer`].

use crate::config::{Config, SigningBackend};
use crate::crypto::{generate_key_id, generate_signing_keypair};
use crate::errors::SignerError;
use crate::models::SigningKey;
use crate::observability::metrics;
use crate::services::key_publisher::KeyPublisher;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use common::secret::ExposeSecret;
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;

#[async_trait]
pub trait SigningKeySource: Send + Sync {
    /// Key id the source will sign with next.
    async fn active_key_id(&self) -> Result<String, SignerError>;

    /// Sign `payload` with the key named by `key_id_hint`.
    ///
    /// Returns `UnknownKey` if the source no longer holds that key.
    async fn sign(&self, key_id_hint: &str, payload: &[u8]) -> Result<Vec<u8>, SignerError>;
}

// =============================================================================
// Local signer
// =============================================================================

struct Keyring {
    active: String,
    keys: HashMap<String, Arc<Ed25519KeyPair>>,
}

/// In-process Ed25519 signer for single-node deployments and tests.
///
/// Holds private keys for every kid still published by its [`KeyPublisher`],
/// so a signature requested with a just-demoted kid still verifies.
pub struct LocalSigner {
    keyring: ArcSwap<Keyring>,
    publisher: Arc<KeyPublisher>,
    rotation: tokio::sync::Mutex<()>,
}

impl LocalSigner {
    /// Start with a freshly generated key.
    pub fn generate(grace_window: Duration) -> Result<Self, SignerError> {
        let generated = generate_signing_keypair()?;
        let kid = generate_key_id(Utc::now())?;
        Self::from_pkcs8(&kid, generated.pkcs8.expose_secret(), grace_window)
    }

    /// Start from existing PKCS#8 material.
    pub fn from_pkcs8(kid: &str, pkcs8: &[u8], grace_window: Duration) -> Result<Self, SignerError> {
        let pair = parse_pkcs8(pkcs8)?;
        let publisher = Arc::new(KeyPublisher::new(
            SigningKey::new_active(kid, pair.public_key().as_ref().to_vec()),
            grace_window,
        ));

        let mut keys = HashMap::new();
        keys.insert(kid.to_string(), Arc::new(pair));

        Ok(Self {
            keyring: ArcSwap::from_pointee(Keyring {
                active: kid.to_string(),
                keys,
            }),
            publisher,
            rotation: tokio::sync::Mutex::new(()),
        })
    }

    pub fn publisher(&self) -> Arc<KeyPublisher> {
        Arc::clone(&self.publisher)
    }

    /// Whether `kid` names a private key this signer holds.
    pub fn holds(&self, kid: &str) -> bool {
        self.keyring.load().keys.contains_key(kid)
    }

    /// Generate a new key, publish it as active and return its kid.
    #[instrument(skip_all)]
    pub async fn rotate(&self) -> Result<String, SignerError> {
        let generated = generate_signing_keypair()?;
        let kid = generate_key_id(Utc::now())?;
        self.rotate_to(&kid, generated.pkcs8.expose_secret()).await?;
        Ok(kid)
    }

    /// Make the given key active.
    pub async fn rotate_to(&self, kid: &str, pkcs8: &[u8]) -> Result<(), SignerError> {
        let pair = Arc::new(parse_pkcs8(pkcs8)?);
        let _guard = self.rotation.lock().await;

        let published = self
            .publisher
            .rotate(SigningKey::new_active(kid, pair.public_key().as_ref().to_vec()));

        let current = self.keyring.load();
        let mut keys: HashMap<String, Arc<Ed25519KeyPair>> = current
            .keys
            .iter()
            .filter(|(held, _)| published.find(held).is_some())
            .map(|(held, pair)| (held.clone(), Arc::clone(pair)))
            .collect();
        keys.insert(kid.to_string(), pair);

        self.keyring.store(Arc::new(Keyring {
            active: kid.to_string(),
            keys,
        }));
        Ok(())
    }

    /// Drop keys whose grace window has elapsed from both the published set
    /// and the keyring.
    pub async fn prune_expired(&self) {
        let _guard = self.rotation.lock().await;
        let Some(published) = self.publisher.prune_expired(Utc::now()) else {
            return;
        };

        let current = self.keyring.load();
        let keys = current
            .keys
            .iter()
            .filter(|(held, _)| published.find(held).is_some())
            .map(|(held, pair)| (held.clone(), Arc::clone(pair)))
            .collect();
        self.keyring.store(Arc::new(Keyring {
            active: current.active.clone(),
            keys,
        }));
    }
}

#[async_trait]
impl SigningKeySource for LocalSigner {
    async fn active_key_id(&self) -> Result<String, SignerError> {
        Ok(self.keyring.load().active.clone())
    }

    async fn sign(&self, key_id_hint: &str, payload: &[u8]) -> Result<Vec<u8>, SignerError> {
        let keyring = self.keyring.load();
        let pair = keyring.keys.get(key_id_hint).ok_or(SignerError::UnknownKey)?;
        Ok(pair.sign(payload).as_ref().to_vec())
    }
}

/// Accepts PKCS#8 v1 and v2; a v2 document's embedded public key must match.
fn parse_pkcs8(pkcs8: &[u8]) -> Result<Ed25519KeyPair, SignerError> {
    Ed25519KeyPair::from_pkcs8_maybe_unchecked(pkcs8)
        .map_err(|e| SignerError::Rejected(format!("Invalid signing key: {e}")))
}

// =============================================================================
// Remote signer
// =============================================================================

#[derive(Deserialize)]
struct ActiveKeyResponse {
    key_id: String,
}

#[derive(Serialize)]
struct SignRequest<'a> {
    key_id: &'a str,
    /// base64url, no padding
    payload: String,
}

#[derive(Deserialize)]
struct SignResponse {
    key_id: String,
    signature: String,
}

/// Client for an external signing service that never releases keys.
///
/// - `GET {endpoint}/v1/keys/active` returns `{"key_id"}`
/// - `POST {endpoint}/v1/sign` with `{"key_id","payload"}` returns
///   `{"key_id","signature"}`, both byte fields base64url
pub struct RemoteSigner {
    endpoint: String,
    http: reqwest::Client,
}

impl RemoteSigner {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, SignerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SignerError::Unavailable(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl SigningKeySource for RemoteSigner {
    async fn active_key_id(&self) -> Result<String, SignerError> {
        let url = format!("{}/v1/keys/active", self.endpoint);
        let response = self.http.get(&url).send().await.map_err(|e| {
            tracing::debug!(target: "token.crypto", error = %e, "Active key request failed");
            SignerError::Unavailable(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }
        let body: ActiveKeyResponse = response
            .json()
            .await
            .map_err(|e| SignerError::Rejected(format!("Invalid active key response: {e}")))?;
        Ok(body.key_id)
    }

    async fn sign(&self, key_id_hint: &str, payload: &[u8]) -> Result<Vec<u8>, SignerError> {
        let url = format!("{}/v1/sign", self.endpoint);
        let request = SignRequest {
            key_id: key_id_hint,
            payload: URL_SAFE_NO_PAD.encode(payload),
        };

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                tracing::debug!(target: "token.crypto", error = %e, "Sign request failed");
                SignerError::Unavailable(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        let body: SignResponse = response
            .json()
            .await
            .map_err(|e| SignerError::Rejected(format!("Invalid sign response: {e}")))?;
        if body.key_id != key_id_hint {
            tracing::warn!(
                target: "token.crypto",
                requested = %key_id_hint,
                returned = %body.key_id,
                "Signer used a different key than requested"
            );
            return Err(SignerError::Rejected("key id mismatch".to_string()));
        }

        URL_SAFE_NO_PAD
            .decode(body.signature)
            .map_err(|e| SignerError::Rejected(format!("Invalid signature encoding: {e}")))
    }
}

fn classify_status(status: reqwest::StatusCode) -> SignerError {
    if status == reqwest::StatusCode::NOT_FOUND {
        SignerError::UnknownKey
    } else if status.is_client_error() {
        tracing::warn!(target: "token.crypto", status = %status, "Signer rejected request");
        SignerError::Rejected(format!("Status {status}"))
    } else {
        tracing::warn!(target: "token.crypto", status = %status, "Signer returned server error");
        SignerError::Unavailable(format!("Status {status}"))
    }
}

// =============================================================================
// Fallback signer
// =============================================================================

/// Routes signing to a local key while the primary source is unreachable.
///
/// Only `Unavailable` switches over; a primary that answers with `Rejected`
/// or `UnknownKey` is still authoritative. After switching, the primary is
/// left alone for `cooldown`. The fallback key must be published next to
/// the primary's keys or its tokens will not validate.
pub struct FallbackSigner {
    primary: Arc<dyn SigningKeySource>,
    fallback: Arc<LocalSigner>,
    cooldown: Duration,
    epoch: Instant,
    /// Milliseconds since `epoch`; zero means healthy.
    degraded_until_ms: AtomicU64,
}

impl FallbackSigner {
    pub fn new(
        primary: Arc<dyn SigningKeySource>,
        fallback: Arc<LocalSigner>,
        cooldown: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            cooldown,
            epoch: Instant::now(),
            degraded_until_ms: AtomicU64::new(0),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.elapsed_ms() < self.degraded_until_ms.load(Ordering::SeqCst)
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn mark_degraded(&self, reason: &str) {
        let now = self.elapsed_ms();
        let cooldown = u64::try_from(self.cooldown.as_millis()).unwrap_or(u64::MAX);
        let previous = self
            .degraded_until_ms
            .swap(now.saturating_add(cooldown), Ordering::SeqCst);
        if previous <= now {
            tracing::warn!(
                target: "token.crypto",
                reason = %reason,
                cooldown_secs = self.cooldown.as_secs(),
                "Primary signer unavailable, signing with fallback key"
            );
        }
        metrics::record_signing_fallback("primary_unavailable");
    }
}

#[async_trait]
impl SigningKeySource for FallbackSigner {
    async fn active_key_id(&self) -> Result<String, SignerError> {
        if self.is_degraded() {
            metrics::record_signing_fallback("degraded");
            return self.fallback.active_key_id().await;
        }
        match self.primary.active_key_id().await {
            Err(SignerError::Unavailable(reason)) => {
                self.mark_degraded(&reason);
                self.fallback.active_key_id().await
            }
            other => other,
        }
    }

    async fn sign(&self, key_id_hint: &str, payload: &[u8]) -> Result<Vec<u8>, SignerError> {
        if self.fallback.holds(key_id_hint) {
            return self.fallback.sign(key_id_hint, payload).await;
        }
        match self.primary.sign(key_id_hint, payload).await {
            // The issuer re-reads the active kid on UnknownKey and lands on the fallback
            Err(SignerError::Unavailable(reason)) => {
                self.mark_degraded(&reason);
                Err(SignerError::UnknownKey)
            }
            other => other,
        }
    }
}

// =============================================================================
// Startup selection
// =============================================================================

/// The configured signing source, plus the local signer when there is one
/// (it owns the in-process key publisher and supports rotation).
pub struct BuiltSigner {
    pub source: Arc<dyn SigningKeySource>,
    pub local: Option<Arc<LocalSigner>>,
    /// In-process key standing in for a remote signer during outages.
    pub fallback: Option<Arc<LocalSigner>>,
}

pub fn build_signer(config: &Config) -> Result<BuiltSigner, SignerError> {
    match &config.signing_backend {
        SigningBackend::Local => {
            let local = Arc::new(LocalSigner::generate(config.key_grace_window)?);
            tracing::info!(target: "token.crypto", backend = "local", "Signing backend ready");
            Ok(BuiltSigner {
                source: Arc::clone(&local) as Arc<dyn SigningKeySource>,
                local: Some(local),
                fallback: None,
            })
        }
        SigningBackend::Remote { endpoint } if config.signing_fallback => {
            // The remote must give up inside the issuer's per-call budget or
            // the switch never happens
            let remote = RemoteSigner::new(endpoint, config.signing_timeout / 2)?;
            let fallback = Arc::new(LocalSigner::generate(config.key_grace_window)?);
            tracing::info!(
                target: "token.crypto",
                backend = "remote",
                fallback = true,
                "Signing backend ready"
            );
            Ok(BuiltSigner {
                source: Arc::new(FallbackSigner::new(
                    Arc::new(remote),
                    Arc::clone(&fallback),
                    config.signing_fallback_cooldown,
                )),
                local: None,
                fallback: Some(fallback),
            })
        }
        SigningBackend::Remote { endpoint } => {
            let remote = RemoteSigner::new(endpoint, config.signing_timeout)?;
            tracing::info!(target: "token.crypto", backend = "remote", "Signing backend ready");
            Ok(BuiltSigner {
                source: Arc::new(remote),
                local: None,
                fallback: None,
            })
        }
    }
}

// =============================================================================
// Mock
// =============================================================================

pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Signer double that can fail or stall on demand.
    ///
    /// Wraps a real [`LocalSigner`] so successful signatures still verify.
    pub struct MockSigner {
        inner: Option<Arc<LocalSigner>>,
        failing: AtomicBool,
        delay: Option<Duration>,
        sign_calls: AtomicUsize,
    }

    impl MockSigner {
        pub fn wrapping(inner: Arc<LocalSigner>) -> Self {
            Self {
                inner: Some(inner),
                failing: AtomicBool::new(false),
                delay: None,
                sign_calls: AtomicUsize::new(0),
            }
        }

        /// Every call fails with `Unavailable`.
        pub fn unavailable() -> Self {
            Self {
                inner: None,
                failing: AtomicBool::new(true),
                delay: None,
                sign_calls: AtomicUsize::new(0),
            }
        }

        /// Delay each `sign` call, for exercising timeouts.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn sign_count(&self) -> usize {
            self.sign_calls.load(Ordering::SeqCst)
        }

        fn inner(&self) -> Result<&LocalSigner, SignerError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(SignerError::Unavailable("mock outage".to_string()));
            }
            self.inner
                .as_deref()
                .ok_or_else(|| SignerError::Unavailable("no signer configured".to_string()))
        }
    }

    #[async_trait]
    impl SigningKeySource for MockSigner {
        async fn active_key_id(&self) -> Result<String, SignerError> {
            match self.inner() {
                Ok(inner) => inner.active_key_id().await,
                // Let the failure surface on `sign` so call counts reflect it
                Err(_) => Ok("mock-key".to_string()),
            }
        }

        async fn sign(&self, key_id_hint: &str, payload: &[u8]) -> Result<Vec<u8>, SignerError> {
            self.sign_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.inner()?.sign(key_id_hint, payload).await
        }
    }
}
