//! Authoritative published key set.
//!
//! Rotation keeps the outgoing active key as `Previous` for `grace_window`
//! so tokens it signed stay verifiable, then drops it. Every change builds
//! a new [`KeySet`] with a bumped version and swaps it in whole.

use crate::errors::FetchError;
use crate::models::{Jwks, KeySet, KeyStatus, SigningKey};
use crate::observability::metrics;
use crate::services::key_cache::KeySetFetcher;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub struct KeyPublisher {
    published: ArcSwap<KeySet>,
    grace_window: Duration,
    // Serializes writers; readers go through `published` lock-free
    write_lock: Mutex<()>,
}

impl KeyPublisher {
    pub fn new(initial: SigningKey, grace_window: Duration) -> Self {
        Self {
            published: ArcSwap::from_pointee(KeySet::with_active(1, initial, Vec::new())),
            grace_window,
            write_lock: Mutex::new(()),
        }
    }

    pub fn current(&self) -> Arc<KeySet> {
        self.published.load_full()
    }

    pub fn jwks(&self) -> Jwks {
        self.published.load().to_jwks()
    }

    /// Make `new_key` active and demote the current active key.
    pub fn rotate(&self, new_key: SigningKey) -> Arc<KeySet> {
        self.rotate_at(new_key, Utc::now())
    }

    pub fn rotate_at(&self, new_key: SigningKey, now: DateTime<Utc>) -> Arc<KeySet> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let old = self.published.load_full();

        let mut previous: Vec<SigningKey> = Vec::with_capacity(old.keys().len());
        for key in old.keys() {
            let mut key = key.clone();
            if key.status == KeyStatus::Active {
                key.rotated_at = Some(now);
            }
            if self.within_grace(&key, now) {
                previous.push(key);
            }
        }

        let new_kid = new_key.kid.clone();
        let next = Arc::new(KeySet::with_active(old.version() + 1, new_key, previous));
        self.published.store(Arc::clone(&next));

        tracing::info!(
            target: "token.keys",
            kid = %new_kid,
            version = next.version(),
            published_keys = next.keys().len(),
            "Signing key rotated"
        );
        metrics::record_key_rotation("success");
        next
    }

    /// Drop previous keys whose grace window has elapsed.
    ///
    /// Returns the new set when something was dropped.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> Option<Arc<KeySet>> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let old = self.published.load_full();

        let active = old.active()?.clone();
        let previous: Vec<SigningKey> = old
            .keys()
            .iter()
            .skip(1)
            .filter(|k| self.within_grace(k, now))
            .cloned()
            .collect();

        if previous.len() + 1 == old.keys().len() {
            return None;
        }

        let next = Arc::new(KeySet::with_active(old.version() + 1, active, previous));
        self.published.store(Arc::clone(&next));
        tracing::info!(
            target: "token.keys",
            version = next.version(),
            dropped = old.keys().len() - next.keys().len(),
            "Dropped keys past grace window"
        );
        Some(next)
    }

    fn within_grace(&self, key: &SigningKey, now: DateTime<Utc>) -> bool {
        match key.rotated_at {
            None => true,
            Some(rotated_at) => (now - rotated_at)
                .to_std()
                .map_or(true, |elapsed| elapsed < self.grace_window),
        }
    }
}

#[async_trait]
impl KeySetFetcher for KeyPublisher {
    async fn fetch_key_set(&self) -> Result<Jwks, FetchError> {
        Ok(self.jwks())
    }
}
