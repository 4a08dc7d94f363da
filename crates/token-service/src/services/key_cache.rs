//! Key-material cache for token verification.
//!
//! Holds the current [`KeySet`] as one immutable snapshot behind an
//! [`ArcSwapOption`]. Readers load the pointer and work on that snapshot, so
//! a lookup always sees one complete key set version.
//!
//! # Refresh
//!
//! `refresh` is single-flight: the first caller installs a shared future in
//! the in-flight slot and later callers clone it. The future clears the slot
//! when it resolves (success or failure), so the next refresh starts fresh.
//!
//! # Degradation
//!
//! When the cached set is older than `ttl` a refresh is attempted. If it fails
//! and the cached set is younger than `ttl + stale_grace`, the stale set is
//! served. Only with no usable set does a lookup fail with
//! `KeySetUnavailable`.

use crate::errors::{FetchError, TokenError};
use crate::models::{Jwks, KeySet, SigningKey};
use crate::observability::metrics;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Default timeout for fetching the key set over HTTP.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum spacing between refreshes triggered by unknown `kid`s or by a
/// failing endpoint. Keeps garbage `kid` headers from hammering the publisher.
pub const DEFAULT_MISS_REFRESH_COOLDOWN: Duration = Duration::from_secs(10);

/// Source of the published key set.
#[async_trait]
pub trait KeySetFetcher: Send + Sync {
    async fn fetch_key_set(&self) -> Result<Jwks, FetchError>;
}

/// Fetches a JWKS document over HTTP.
pub struct HttpKeySetFetcher {
    url: String,
    client: reqwest::Client,
}

impl HttpKeySetFetcher {
    pub fn new(url: String, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl KeySetFetcher for HttpKeySetFetcher {
    async fn fetch_key_set(&self) -> Result<Jwks, FetchError> {
        let response = self.client.get(&self.url).send().await.map_err(|e| {
            tracing::debug!(target: "token.keys", error = %e, "Key set request failed");
            FetchError::Unavailable("request failed".to_string())
        })?;

        if !response.status().is_success() {
            return Err(FetchError::Unavailable(format!(
                "publisher returned {}",
                response.status()
            )));
        }

        response.json::<Jwks>().await.map_err(|e| {
            tracing::debug!(target: "token.keys", error = %e, "Key set response not a JWKS document");
            FetchError::Malformed("response is not a JWKS document".to_string())
        })
    }
}

/// Serves the primary publisher's keys followed by a secondary set's.
///
/// Used while a fallback signer may be minting tokens: validators must
/// accept both key sets. The last good primary document is kept, so a
/// primary outage still yields its keys alongside the secondary's. A
/// secondary key whose kid collides with a primary key is dropped.
pub struct MergedKeySetFetcher {
    primary: Arc<dyn KeySetFetcher>,
    secondary: Arc<dyn KeySetFetcher>,
    last_primary: ArcSwapOption<Jwks>,
}

impl MergedKeySetFetcher {
    pub fn new(primary: Arc<dyn KeySetFetcher>, secondary: Arc<dyn KeySetFetcher>) -> Self {
        Self {
            primary,
            secondary,
            last_primary: ArcSwapOption::empty(),
        }
    }
}

#[async_trait]
impl KeySetFetcher for MergedKeySetFetcher {
    async fn fetch_key_set(&self) -> Result<Jwks, FetchError> {
        let primary = match self.primary.fetch_key_set().await {
            Ok(jwks) => {
                let jwks = Arc::new(jwks);
                self.last_primary.store(Some(Arc::clone(&jwks)));
                jwks
            }
            Err(e) => {
                let Some(cached) = self.last_primary.load_full() else {
                    return Err(e);
                };
                tracing::warn!(
                    target: "token.keys",
                    error = %e,
                    "Primary key set unavailable, merging last known copy"
                );
                cached
            }
        };
        let secondary = self.secondary.fetch_key_set().await?;

        let mut keys = primary.keys.clone();
        for key in secondary.keys {
            if keys.iter().all(|held| held.kid != key.kid) {
                keys.push(key);
            }
        }
        Ok(Jwks { keys })
    }
}

#[derive(Debug, Clone)]
pub struct KeyCacheConfig {
    /// Age after which the cached set is refreshed before use.
    pub ttl: Duration,
    /// How long past `ttl` a stale set may still be served when refresh fails.
    pub stale_grace: Duration,
    pub miss_refresh_cooldown: Duration,
}

impl Default for KeyCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            stale_grace: Duration::from_secs(3600),
            miss_refresh_cooldown: DEFAULT_MISS_REFRESH_COOLDOWN,
        }
    }
}

struct CachedKeySet {
    set: Arc<KeySet>,
    fetched_at: Instant,
}

type InflightRefresh = Shared<BoxFuture<'static, Result<Arc<KeySet>, FetchError>>>;

pub struct KeyMaterialCache {
    fetcher: Arc<dyn KeySetFetcher>,
    current: Arc<ArcSwapOption<CachedKeySet>>,
    inflight: Arc<Mutex<Option<InflightRefresh>>>,
    next_version: Arc<AtomicU64>,
    last_attempt: Mutex<Option<Instant>>,
    config: KeyCacheConfig,
}

impl KeyMaterialCache {
    pub fn new(fetcher: Arc<dyn KeySetFetcher>, config: KeyCacheConfig) -> Self {
        Self {
            fetcher,
            current: Arc::new(ArcSwapOption::empty()),
            inflight: Arc::new(Mutex::new(None)),
            next_version: Arc::new(AtomicU64::new(1)),
            last_attempt: Mutex::new(None),
            config,
        }
    }

    /// The currently cached set, regardless of age.
    pub fn current_set(&self) -> Option<Arc<KeySet>> {
        self.current.load_full().map(|c| Arc::clone(&c.set))
    }

    /// Resolve a verification key by `kid`.
    ///
    /// Unknown `kid`s trigger one rate-limited refresh in case a new key was
    /// published since the last fetch. Still unknown afterwards is `TokenInvalid`.
    #[instrument(skip_all, fields(kid = %kid))]
    pub async fn get_key(&self, kid: &str) -> Result<SigningKey, TokenError> {
        let set = self.usable_set().await?;
        if let Some(key) = set.find(kid) {
            return Ok(key.clone());
        }

        if !self.take_refresh_slot() {
            tracing::debug!(target: "token.keys", "Unknown kid, refresh on cooldown");
            return Err(TokenError::TokenInvalid);
        }

        tracing::debug!(target: "token.keys", "Unknown kid, refreshing key set");
        match self.refresh_shared().await {
            Ok(set) => set.find(kid).cloned().ok_or(TokenError::TokenInvalid),
            Err(e) => {
                tracing::warn!(target: "token.keys", error = %e, "Refresh after kid miss failed");
                Err(TokenError::TokenInvalid)
            }
        }
    }

    /// Fetch the full key set and atomically swap it in.
    ///
    /// Concurrent callers share a single in-flight fetch.
    pub async fn refresh(&self) -> Result<Arc<KeySet>, TokenError> {
        self.note_attempt();
        self.refresh_shared().await.map_err(TokenError::from)
    }

    /// Periodically refresh until `cancel_token` fires. Failures are logged
    /// and counted; the loop keeps running.
    pub fn spawn_refresh_task(
        self: &Arc<Self>,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = cache.refresh().await {
                            tracing::warn!(target: "token.keys", error = %e, "Scheduled key set refresh failed");
                        }
                    }
                    _ = cancel_token.cancelled() => {
                        tracing::info!(target: "token.keys", "Key refresh task received shutdown signal, exiting");
                        break;
                    }
                }
            }
        })
    }

    async fn usable_set(&self) -> Result<Arc<KeySet>, TokenError> {
        let cached = self.current.load_full();
        if let Some(entry) = cached.as_ref() {
            if entry.fetched_at.elapsed() < self.config.ttl {
                return Ok(Arc::clone(&entry.set));
            }
        }

        let refreshed = if cached.is_none() || self.take_refresh_slot() {
            self.refresh_shared().await
        } else {
            Err(FetchError::Unavailable("refresh on cooldown".to_string()))
        };

        match refreshed {
            Ok(set) => Ok(set),
            Err(e) => {
                // Another caller may have swapped in a newer set meanwhile
                let cached = self.current.load_full();
                match cached.as_ref() {
                    Some(entry)
                        if entry.fetched_at.elapsed()
                            < self.config.ttl + self.config.stale_grace =>
                    {
                        tracing::warn!(
                            target: "token.keys",
                            error = %e,
                            version = entry.set.version(),
                            age_secs = entry.fetched_at.elapsed().as_secs(),
                            "Serving stale key set"
                        );
                        metrics::record_key_cache_stale_serve();
                        Ok(Arc::clone(&entry.set))
                    }
                    _ => {
                        tracing::error!(target: "token.keys", error = %e, "No usable key set");
                        Err(TokenError::KeySetUnavailable)
                    }
                }
            }
        }
    }

    /// Join the in-flight refresh or start one.
    fn refresh_shared(&self) -> InflightRefresh {
        let mut slot = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(inflight) = slot.as_ref() {
            return inflight.clone();
        }

        let fetcher = Arc::clone(&self.fetcher);
        let current = Arc::clone(&self.current);
        let inflight = Arc::clone(&self.inflight);
        let next_version = Arc::clone(&self.next_version);

        let fut = async move {
            let start = Instant::now();
            let result = fetcher
                .fetch_key_set()
                .await
                .and_then(|jwks| {
                    let version = next_version.fetch_add(1, Ordering::Relaxed);
                    KeySet::from_jwks(&jwks, version)
                })
                .map(Arc::new);

            match &result {
                Ok(set) => {
                    current.store(Some(Arc::new(CachedKeySet {
                        set: Arc::clone(set),
                        fetched_at: Instant::now(),
                    })));
                    tracing::info!(
                        target: "token.keys",
                        version = set.version(),
                        keys = set.keys().len(),
                        "Key set refreshed"
                    );
                    metrics::record_key_cache_refresh("success", start.elapsed());
                }
                Err(e) => {
                    tracing::warn!(target: "token.keys", error = %e, "Key set refresh failed");
                    metrics::record_key_cache_refresh("error", start.elapsed());
                }
            }

            inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();

            result
        }
        .boxed()
        .shared();

        *slot = Some(fut.clone());
        fut
    }

    fn note_attempt(&self) {
        *self.last_attempt.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    /// Claim the right to trigger an opportunistic refresh.
    fn take_refresh_slot(&self) -> bool {
        let mut last = self.last_attempt.lock().unwrap_or_else(PoisonError::into_inner);
        let allowed = last.map_or(true, |at| at.elapsed() >= self.config.miss_refresh_cooldown);
        if allowed {
            *last = Some(Instant::now());
        }
        allowed
    }
}

/// Mock fetchers for testing.
pub mod mock {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Serves a configurable JWKS document, counting fetches.
    pub struct CountingFetcher {
        response: Mutex<Result<Jwks, FetchError>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl CountingFetcher {
        pub fn serving(jwks: Jwks) -> Self {
            Self {
                response: Mutex::new(Ok(jwks)),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing() -> Self {
            Self {
                response: Mutex::new(Err(FetchError::Unavailable("mock outage".to_string()))),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        /// Hold every fetch open for `delay` so concurrent callers overlap.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn set_jwks(&self, jwks: Jwks) {
            *self.response.lock().unwrap_or_else(PoisonError::into_inner) = Ok(jwks);
        }

        pub fn set_failing(&self) {
            *self.response.lock().unwrap_or_else(PoisonError::into_inner) =
                Err(FetchError::Unavailable("mock outage".to_string()));
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KeySetFetcher for CountingFetcher {
        async fn fetch_key_set(&self) -> Result<Jwks, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.response
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }
}
