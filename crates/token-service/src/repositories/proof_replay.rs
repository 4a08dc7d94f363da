//! One-time-use ledger for proof-of-possession `jti`s.
//!
//! A proof is accepted only if its key has never been claimed before within
//! the proof acceptance window. The claim is a single atomic
//! check-and-insert, so two concurrent presentations of the same proof
//! cannot both succeed.

use crate::errors::StoreError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use std::time::{Duration, Instant};

#[async_trait]
pub trait ProofReplayStore: Send + Sync {
    /// Claim `key` for `ttl`. Returns `false` if it is already claimed.
    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
}

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Default)]
pub struct InMemoryProofReplayStore {
    seen: DashMap<String, Instant>,
}

impl InMemoryProofReplayStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop claims whose window has passed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.seen.len();
        self.seen.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.seen.len())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[async_trait]
impl ProofReplayStore for InMemoryProofReplayStore {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let expires_at = now.checked_add(ttl).unwrap_or(now);
        match self.seen.entry(key.to_string()) {
            Entry::Occupied(mut existing) => {
                if *existing.get() > now {
                    return Ok(false);
                }
                existing.insert(expires_at);
                Ok(true)
            }
            Entry::Vacant(slot) => {
                slot.insert(expires_at);
                Ok(true)
            }
        }
    }
}

// =============================================================================
// Redis store
// =============================================================================

fn proof_key(key: &str) -> String {
    format!("tl:dpop:{key}")
}

#[derive(Clone)]
pub struct RedisProofReplayStore {
    connection: MultiplexedConnection,
}

impl RedisProofReplayStore {
    pub fn new(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl ProofReplayStore for RedisProofReplayStore {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
        let mut conn = self.connection.clone();

        // SET NX replies OK on first claim and nil when the key exists
        let reply: Option<String> = redis::cmd("SET")
            .arg(proof_key(key))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(millis)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                tracing::warn!(target: "token.dpop", error = %e, "Failed to record proof");
                StoreError::Unavailable(format!("record proof: {e}"))
            })?;
        Ok(reply.is_some())
    }
}
