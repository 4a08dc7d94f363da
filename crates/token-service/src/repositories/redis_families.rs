//! Redis-backed family store.
//!
//! # Key Patterns
//!
//! - `tl:family:{id}` - family hash (`record` JSON plus mutable scalar fields)
//! - `tl:family:{id}:gen:{n}` - generation hash (`record` JSON plus `status`)
//! - `tl:refresh:{hash}` - refresh-token hash index, value `{id}:{n}`
//! - `tl:subject:{sub}` - set of family ids issued to a subject; its TTL
//!   follows the longest-lived member, revoked members are removed by the
//!   revoke script and expired ones on the next listing
//!
//! Transitions run as Lua scripts (see [`lua_scripts`]) so each one is a
//! single atomic step on the server.

use crate::errors::StoreError;
use crate::models::{FamilyStatus, Generation, GenerationStatus, TokenFamily};
use crate::repositories::families::{AdvanceOutcome, FamilyStore, RevokedFamily};
use crate::repositories::lua_scripts;
use async_trait::async_trait;
use chrono::Utc;
use common::types::FamilyId;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError, Script};
use std::collections::HashMap;
use tracing::instrument;

/// A revoke retries when the family advances between read and script.
const MAX_REVOKE_ATTEMPTS: usize = 3;

pub(crate) fn family_key(family_id: impl std::fmt::Display) -> String {
    format!("tl:family:{family_id}")
}

pub(crate) fn generation_key(family_id: FamilyId, number: u32) -> String {
    format!("tl:family:{family_id}:gen:{number}")
}

pub(crate) fn refresh_index_key(hash: &str) -> String {
    format!("tl:refresh:{hash}")
}

pub(crate) fn subject_key(subject: &str) -> String {
    format!("tl:subject:{subject}")
}

fn index_value(family_id: FamilyId, number: u32) -> String {
    format!("{family_id}:{number}")
}

fn parse_index_value(value: &str) -> Result<(FamilyId, u32), StoreError> {
    let corrupt = || StoreError::Corrupt("malformed refresh index entry".to_string());
    let (id, number) = value.rsplit_once(':').ok_or_else(corrupt)?;
    Ok((
        id.parse().map_err(|_| corrupt())?,
        number.parse().map_err(|_| corrupt())?,
    ))
}

/// Milliseconds until `expires_at`, at least 1 so keys always get a TTL.
fn ttl_millis(expires_at: i64, now: i64) -> i64 {
    expires_at.saturating_sub(now).saturating_mul(1000).max(1)
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str, StoreError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| StoreError::Corrupt(format!("missing field {name}")))
}

fn parse_field<T: std::str::FromStr>(
    fields: &HashMap<String, String>,
    name: &str,
) -> Result<T, StoreError> {
    field(fields, name)?
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("invalid field {name}")))
}

fn family_from_fields(fields: &HashMap<String, String>) -> Result<TokenFamily, StoreError> {
    let mut family: TokenFamily = serde_json::from_str(field(fields, "record")?)
        .map_err(|e| StoreError::Corrupt(format!("family record: {e}")))?;

    family.status = FamilyStatus::parse(field(fields, "status")?)
        .ok_or_else(|| StoreError::Corrupt("invalid family status".to_string()))?;
    family.current_generation = parse_field(fields, "current_generation")?;
    family.expires_at = parse_field(fields, "expires_at")?;
    family.revoked_at = match fields.get("revoked_at") {
        Some(value) => Some(
            value
                .parse()
                .map_err(|_| StoreError::Corrupt("invalid field revoked_at".to_string()))?,
        ),
        None => None,
    };
    Ok(family)
}

fn generation_from_fields(fields: &HashMap<String, String>) -> Result<Generation, StoreError> {
    let mut generation: Generation = serde_json::from_str(field(fields, "record")?)
        .map_err(|e| StoreError::Corrupt(format!("generation record: {e}")))?;
    generation.status = GenerationStatus::parse(field(fields, "status")?)
        .ok_or_else(|| StoreError::Corrupt("invalid generation status".to_string()))?;
    Ok(generation)
}

/// Split subject-set members into live family ids and members to remove:
/// families that no longer exist, and entries that are not family ids.
fn partition_members(members: &[String], present: &[bool]) -> (Vec<FamilyId>, Vec<String>) {
    let mut live = Vec::new();
    let mut dead = Vec::new();
    for (member, exists) in members.iter().zip(present) {
        match member.parse::<FamilyId>() {
            Ok(id) if *exists => live.push(id),
            Ok(_) => dead.push(member.clone()),
            Err(_) => {
                tracing::warn!(target: "token.redis", "Dropping malformed family id from subject set");
                dead.push(member.clone());
            }
        }
    }
    (live, dead)
}

fn unavailable(operation: &'static str) -> impl FnOnce(RedisError) -> StoreError {
    move |e| {
        tracing::warn!(target: "token.redis", error = %e, operation, "Redis command failed");
        StoreError::Unavailable(format!("{operation}: {e}"))
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(format!("encode: {e}")))
}

/// Family store over a shared multiplexed connection.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct RedisFamilyStore {
    connection: MultiplexedConnection,
    advance_script: Script,
    revoke_script: Script,
}

impl RedisFamilyStore {
    pub fn new(connection: MultiplexedConnection) -> Self {
        Self {
            connection,
            advance_script: Script::new(lua_scripts::ADVANCE_GENERATION),
            revoke_script: Script::new(lua_scripts::REVOKE_FAMILY),
        }
    }

    async fn load_family(
        &self,
        conn: &mut MultiplexedConnection,
        family_id: FamilyId,
    ) -> Result<Option<TokenFamily>, StoreError> {
        let fields: HashMap<String, String> = conn
            .hgetall(family_key(family_id))
            .await
            .map_err(unavailable("load family"))?;
        if fields.is_empty() {
            return Ok(None);
        }
        family_from_fields(&fields).map(Some)
    }

    async fn load_generation(
        &self,
        conn: &mut MultiplexedConnection,
        family_id: FamilyId,
        number: u32,
    ) -> Result<Option<Generation>, StoreError> {
        let fields: HashMap<String, String> = conn
            .hgetall(generation_key(family_id, number))
            .await
            .map_err(unavailable("load generation"))?;
        if fields.is_empty() {
            return Ok(None);
        }
        generation_from_fields(&fields).map(Some)
    }
}

#[async_trait]
impl FamilyStore for RedisFamilyStore {
    #[instrument(skip_all, fields(family_id = %family.family_id))]
    async fn create(&self, family: &TokenFamily, first: &Generation) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let ttl = ttl_millis(family.expires_at, Utc::now().timestamp());

        let family_hash = family_key(family.family_id);
        let generation_hash = generation_key(family.family_id, first.number);
        let family_record = encode(family)?;
        let generation_record = encode(first)?;
        let current_generation = family.current_generation.to_string();
        let expires_at = family.expires_at.to_string();

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(
                &family_hash,
                &[
                    ("record", family_record.as_str()),
                    ("status", family.status.as_str()),
                    ("current_generation", current_generation.as_str()),
                    ("expires_at", expires_at.as_str()),
                ],
            )
            .ignore()
            .pexpire(&family_hash, ttl)
            .ignore()
            .hset_multiple(
                &generation_hash,
                &[
                    ("record", generation_record.as_str()),
                    ("status", first.status.as_str()),
                ],
            )
            .ignore()
            .pexpire(&generation_hash, ttl)
            .ignore()
            .cmd("SET")
            .arg(refresh_index_key(&first.refresh_token_hash))
            .arg(index_value(family.family_id, first.number))
            .arg("PX")
            .arg(ttl)
            .ignore()
            .sadd(subject_key(&family.subject), family.family_id.to_string())
            .ignore()
            .cmd("PEXPIRE")
            .arg(subject_key(&family.subject))
            .arg(ttl)
            .arg("NX")
            .ignore()
            .cmd("PEXPIRE")
            .arg(subject_key(&family.subject))
            .arg(ttl)
            .arg("GT")
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(unavailable("create family"))?;

        tracing::debug!(target: "token.redis", "Stored new family");
        Ok(())
    }

    async fn find_by_refresh_hash(
        &self,
        hash: &str,
    ) -> Result<Option<(TokenFamily, Generation)>, StoreError> {
        let mut conn = self.connection.clone();
        let index: Option<String> = conn
            .get(refresh_index_key(hash))
            .await
            .map_err(unavailable("lookup refresh hash"))?;
        let Some(index) = index else {
            return Ok(None);
        };

        let (family_id, number) = parse_index_value(&index)?;
        let Some(family) = self.load_family(&mut conn, family_id).await? else {
            return Ok(None);
        };
        let Some(generation) = self.load_generation(&mut conn, family_id, number).await? else {
            return Ok(None);
        };
        Ok(Some((family, generation)))
    }

    #[instrument(skip_all, fields(family_id = %family.family_id, expected = expected))]
    async fn advance(
        &self,
        family: &TokenFamily,
        expected: u32,
        next: &Generation,
    ) -> Result<AdvanceOutcome, StoreError> {
        let family_id = family.family_id;
        let mut conn = self.connection.clone();
        let ttl = ttl_millis(next.refresh_expires_at, Utc::now().timestamp());

        let result: i64 = self
            .advance_script
            .key(family_key(family_id))
            .key(generation_key(family_id, expected))
            .key(generation_key(family_id, next.number))
            .key(refresh_index_key(&next.refresh_token_hash))
            .key(subject_key(&family.subject))
            .arg(expected)
            .arg(next.number)
            .arg(encode(next)?)
            .arg(index_value(family_id, next.number))
            .arg(next.refresh_expires_at)
            .arg(ttl)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable("advance generation"))?;

        match result {
            1 => Ok(AdvanceOutcome::Advanced),
            0 => Ok(AdvanceOutcome::Stale),
            -2 => Ok(AdvanceOutcome::Missing),
            other => {
                tracing::error!(target: "token.redis", result = other, "Unexpected advance result");
                Err(StoreError::Corrupt(format!("advance returned {other}")))
            }
        }
    }

    #[instrument(skip_all, fields(family_id = %family_id))]
    async fn revoke(
        &self,
        family_id: FamilyId,
        now: i64,
    ) -> Result<Option<RevokedFamily>, StoreError> {
        let mut conn = self.connection.clone();

        for _ in 0..MAX_REVOKE_ATTEMPTS {
            let Some(observed) = self.load_family(&mut conn, family_id).await? else {
                return Ok(None);
            };
            let current = observed.current_generation;

            let mut invocation = self.revoke_script.prepare_invoke();
            invocation
                .key(family_key(family_id))
                .key(subject_key(&observed.subject));
            for number in 0..=current {
                invocation.key(generation_key(family_id, number));
            }
            invocation
                .arg(current)
                .arg(now)
                .arg(family_id.to_string());

            let result: i64 = invocation
                .invoke_async(&mut conn)
                .await
                .map_err(unavailable("revoke family"))?;

            match result {
                1 | 2 => {
                    let Some(family) = self.load_family(&mut conn, family_id).await? else {
                        return Ok(None);
                    };
                    let mut generations = Vec::with_capacity(current as usize + 1);
                    for number in 0..=current {
                        // Older generations may already have expired
                        if let Some(generation) =
                            self.load_generation(&mut conn, family_id, number).await?
                        {
                            generations.push(generation);
                        }
                    }
                    return Ok(Some(RevokedFamily {
                        family,
                        generations,
                        newly_revoked: result == 1,
                    }));
                }
                0 => {
                    tracing::debug!(target: "token.redis", "Family advanced during revoke, retrying");
                }
                -2 => return Ok(None),
                other => {
                    tracing::error!(target: "token.redis", result = other, "Unexpected revoke result");
                    return Err(StoreError::Corrupt(format!("revoke returned {other}")));
                }
            }
        }

        Err(StoreError::Unavailable(
            "family kept advancing during revocation".to_string(),
        ))
    }

    async fn get(&self, family_id: FamilyId) -> Result<Option<TokenFamily>, StoreError> {
        let mut conn = self.connection.clone();
        self.load_family(&mut conn, family_id).await
    }

    async fn families_for_subject(&self, subject: &str) -> Result<Vec<FamilyId>, StoreError> {
        let mut conn = self.connection.clone();
        let key = subject_key(subject);
        let members: Vec<String> = conn
            .smembers(&key)
            .await
            .map_err(unavailable("list subject families"))?;
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let mut lookups = redis::pipe();
        for member in &members {
            lookups.exists(family_key(member));
        }
        let present: Vec<bool> = lookups
            .query_async(&mut conn)
            .await
            .map_err(unavailable("check subject families"))?;

        let (live, dead) = partition_members(&members, &present);
        if !dead.is_empty() {
            let _: () = conn
                .srem(&key, &dead)
                .await
                .map_err(unavailable("prune subject families"))?;
            tracing::debug!(target: "token.redis", pruned = dead.len(), "Pruned expired families from subject set");
        }
        Ok(live)
    }
}
