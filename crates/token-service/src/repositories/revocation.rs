//! Revoked token ids with per-entry expiry.
//!
//! Entries never outlive the token they revoke, so the store stays bounded
//! by the number of live tokens.

use crate::errors::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::{Duration, Instant};

#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Record `jti` as revoked for `ttl`. Repeating a put never shortens
    /// an existing entry.
    async fn put(&self, jti: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn exists(&self, jti: &str) -> Result<bool, StoreError>;
}

// =============================================================================
// In-memory store
// =============================================================================

/// Longest entry lifetime used when `now + ttl` overflows; far beyond any
/// token lifetime.
const MAX_ENTRY_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

#[derive(Default)]
pub struct InMemoryRevocationStore {
    entries: DashMap<String, Instant>,
}

impl InMemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Expired entries are already invisible to
    /// `exists`; this only reclaims memory.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `now + ttl`, clamped for TTLs the platform clock cannot represent.
fn expiry_after(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(MAX_ENTRY_TTL))
        .unwrap_or(now)
}

#[async_trait]
impl RevocationStore for InMemoryRevocationStore {
    async fn put(&self, jti: &str, ttl: Duration) -> Result<(), StoreError> {
        if ttl.is_zero() {
            return Ok(());
        }
        let expires_at = expiry_after(Instant::now(), ttl);
        self.entries
            .entry(jti.to_string())
            .and_modify(|existing| {
                if *existing < expires_at {
                    *existing = expires_at;
                }
            })
            .or_insert(expires_at);
        Ok(())
    }

    async fn exists(&self, jti: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let live = match self.entries.get(jti) {
            Some(expires_at) => *expires_at > now,
            None => return Ok(false),
        };
        if !live {
            self.entries.remove_if(jti, |_, expires_at| *expires_at <= now);
        }
        Ok(live)
    }
}

// =============================================================================
// Redis store
// =============================================================================

fn revoked_key(jti: &str) -> String {
    format!("tl:revoked:{jti}")
}

#[derive(Clone)]
pub struct RedisRevocationStore {
    connection: MultiplexedConnection,
}

impl RedisRevocationStore {
    pub fn new(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl RevocationStore for RedisRevocationStore {
    async fn put(&self, jti: &str, ttl: Duration) -> Result<(), StoreError> {
        let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        if millis == 0 {
            return Ok(());
        }
        let mut conn = self.connection.clone();

        // GT keeps the longer expiry when the jti is already present
        let _: () = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(revoked_key(jti))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(millis)
            .ignore()
            .cmd("PEXPIRE")
            .arg(revoked_key(jti))
            .arg(millis)
            .arg("GT")
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                tracing::warn!(target: "token.revocation", error = %e, "Failed to record revocation");
                StoreError::Unavailable(format!("record revocation: {e}"))
            })?;
        Ok(())
    }

    async fn exists(&self, jti: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        conn.exists(revoked_key(jti)).await.map_err(|e| {
            tracing::warn!(target: "token.revocation", error = %e, "Failed to check revocation");
            StoreError::Unavailable(format!("check revocation: {e}"))
        })
    }
}

// =============================================================================
// Mock
// =============================================================================

pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory store whose availability can be switched off.
    #[derive(Default)]
    pub struct FlakyRevocationStore {
        inner: InMemoryRevocationStore,
        down: AtomicBool,
        puts: AtomicUsize,
    }

    impl FlakyRevocationStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        pub fn put_count(&self) -> usize {
            self.puts.load(Ordering::SeqCst)
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("mock outage".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RevocationStore for FlakyRevocationStore {
        async fn put(&self, jti: &str, ttl: Duration) -> Result<(), StoreError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            self.inner.put(jti, ttl).await
        }

        async fn exists(&self, jti: &str) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.exists(jti).await
        }
    }
}
