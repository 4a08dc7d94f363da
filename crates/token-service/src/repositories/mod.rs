//! Persistence for family records and revocation entries.
//!
//! Each store is a trait with an in-memory and a Redis implementation,
//! chosen at startup from `REDIS_URL`. The proof replay ledger follows the
//! same split.

pub mod families;
pub mod lua_scripts;
pub mod proof_replay;
pub mod redis_families;
pub mod revocation;

pub use families::{AdvanceOutcome, FamilyStore, InMemoryFamilyStore, RevokedFamily};
pub use proof_replay::{InMemoryProofReplayStore, ProofReplayStore, RedisProofReplayStore};
pub use redis_families::RedisFamilyStore;
pub use revocation::{InMemoryRevocationStore, RedisRevocationStore, RevocationStore};

use crate::errors::StoreError;
use redis::aio::MultiplexedConnection;
use redis::Client;
use std::time::Duration;

/// Bound on connection setup.
pub const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on each command round trip.
pub const REDIS_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Open the multiplexed connection shared by the Redis stores.
///
/// The connection is cheap to clone and safe for concurrent use.
pub async fn connect_redis(redis_url: &str) -> Result<MultiplexedConnection, StoreError> {
    // Never log redis_url: it may carry credentials
    let client = Client::open(redis_url).map_err(|e| {
        tracing::error!(target: "token.redis", error = %e, "Failed to open Redis client");
        StoreError::Unavailable(format!("Failed to open Redis client: {e}"))
    })?;

    client
        .get_multiplexed_async_connection_with_timeouts(
            REDIS_RESPONSE_TIMEOUT,
            REDIS_CONNECT_TIMEOUT,
        )
        .await
        .map_err(|e| {
            tracing::error!(target: "token.redis", error = %e, "Failed to connect to Redis");
            StoreError::Unavailable(format!("Failed to connect to Redis: {e}"))
        })
}
