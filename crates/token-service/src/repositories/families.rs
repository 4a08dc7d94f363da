//! Family and generation records.
//!
//! Records form a flat table keyed by family id, with each family's
//! generations stored in order so generation `n` lives at index `n`.
//! Lookups by refresh-token hash and by subject go through secondary
//! indexes that point back into that table.

use crate::errors::StoreError;
use crate::models::{FamilyStatus, Generation, GenerationStatus, TokenFamily};
use async_trait::async_trait;
use common::types::FamilyId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Result of a conditional generation advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The expected generation was current; the next one is now current.
    Advanced,
    /// The family moved on or was revoked before this caller got there.
    Stale,
    /// No such family (never existed or expired).
    Missing,
}

/// Snapshot of a family taken right after revoking it.
#[derive(Debug, Clone)]
pub struct RevokedFamily {
    pub family: TokenFamily,
    pub generations: Vec<Generation>,
    /// False when the family was already revoked.
    pub newly_revoked: bool,
}

#[async_trait]
pub trait FamilyStore: Send + Sync {
    /// Persist a new family together with its generation 0.
    async fn create(&self, family: &TokenFamily, first: &Generation) -> Result<(), StoreError>;

    /// Resolve a refresh-token hash to its family and generation.
    async fn find_by_refresh_hash(
        &self,
        hash: &str,
    ) -> Result<Option<(TokenFamily, Generation)>, StoreError>;

    /// Atomically supersede generation `expected` of `family` and make
    /// `next` current.
    ///
    /// Succeeds only if the family is active and `expected` is still its
    /// current generation. `family` is the caller's snapshot; only its id
    /// and subject are relied on.
    async fn advance(
        &self,
        family: &TokenFamily,
        expected: u32,
        next: &Generation,
    ) -> Result<AdvanceOutcome, StoreError>;

    /// Mark the family and all of its generations revoked. Idempotent.
    ///
    /// Returns `None` for an unknown family.
    async fn revoke(&self, family_id: FamilyId, now: i64)
        -> Result<Option<RevokedFamily>, StoreError>;

    async fn get(&self, family_id: FamilyId) -> Result<Option<TokenFamily>, StoreError>;

    /// Ids of the families recorded for `subject`. Every active family is
    /// listed; revoked or expired ones may be omitted.
    async fn families_for_subject(&self, subject: &str) -> Result<Vec<FamilyId>, StoreError>;
}

// =============================================================================
// In-memory store
// =============================================================================

struct FamilyEntry {
    family: TokenFamily,
    generations: Vec<Generation>,
}

/// Process-local store.
///
/// Per-family state sits behind one `DashMap` shard lock, so the
/// conditional advance of one family never waits on an unrelated one.
#[derive(Default)]
pub struct InMemoryFamilyStore {
    families: DashMap<FamilyId, FamilyEntry>,
    by_refresh_hash: DashMap<String, (FamilyId, u32)>,
    by_subject: DashMap<String, Vec<FamilyId>>,
}

impl InMemoryFamilyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every generation of a family, oldest first.
    pub fn generations(&self, family_id: FamilyId) -> Vec<Generation> {
        self.families
            .get(&family_id)
            .map(|entry| entry.generations.clone())
            .unwrap_or_default()
    }

    /// Drop families whose current generation has expired.
    pub fn purge_expired(&self, now: i64) -> usize {
        let expired: Vec<FamilyId> = self
            .families
            .iter()
            .filter(|entry| entry.family.expires_at <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut purged = 0;
        for family_id in expired {
            let Some((_, entry)) = self
                .families
                .remove_if(&family_id, |_, entry| entry.family.expires_at <= now)
            else {
                continue;
            };
            for generation in &entry.generations {
                self.by_refresh_hash.remove(&generation.refresh_token_hash);
            }
            if let Some(mut ids) = self.by_subject.get_mut(&entry.family.subject) {
                ids.retain(|id| *id != family_id);
            }
            self.by_subject
                .remove_if(&entry.family.subject, |_, ids| ids.is_empty());
            purged += 1;
        }
        purged
    }
}

#[async_trait]
impl FamilyStore for InMemoryFamilyStore {
    async fn create(&self, family: &TokenFamily, first: &Generation) -> Result<(), StoreError> {
        match self.families.entry(family.family_id) {
            Entry::Occupied(_) => {
                return Err(StoreError::Corrupt(format!(
                    "family {} already exists",
                    family.family_id
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(FamilyEntry {
                    family: family.clone(),
                    generations: vec![first.clone()],
                });
            }
        }
        self.by_refresh_hash.insert(
            first.refresh_token_hash.clone(),
            (family.family_id, first.number),
        );
        self.by_subject
            .entry(family.subject.clone())
            .or_default()
            .push(family.family_id);
        Ok(())
    }

    async fn find_by_refresh_hash(
        &self,
        hash: &str,
    ) -> Result<Option<(TokenFamily, Generation)>, StoreError> {
        let Some((family_id, number)) = self.by_refresh_hash.get(hash).map(|r| *r.value()) else {
            return Ok(None);
        };
        let Some(entry) = self.families.get(&family_id) else {
            return Ok(None);
        };
        let Some(generation) = entry.generations.get(number as usize) else {
            return Err(StoreError::Corrupt(format!(
                "index points at missing generation {number} of family {family_id}"
            )));
        };
        Ok(Some((entry.family.clone(), generation.clone())))
    }

    async fn advance(
        &self,
        family: &TokenFamily,
        expected: u32,
        next: &Generation,
    ) -> Result<AdvanceOutcome, StoreError> {
        let family_id = family.family_id;
        // Holding the shard write guard makes check-and-set one step
        let Some(mut entry) = self.families.get_mut(&family_id) else {
            return Ok(AdvanceOutcome::Missing);
        };

        if entry.family.status != FamilyStatus::Active
            || entry.family.current_generation != expected
        {
            return Ok(AdvanceOutcome::Stale);
        }
        if next.number != expected + 1 || entry.generations.len() != next.number as usize {
            return Err(StoreError::Corrupt(format!(
                "generation {} does not follow {expected}",
                next.number
            )));
        }

        let FamilyEntry {
            family: stored,
            generations,
        } = &mut *entry;
        let Some(current) = generations.get_mut(expected as usize) else {
            return Err(StoreError::Corrupt(format!(
                "family {family_id} has no generation {expected}"
            )));
        };
        if !current.status.can_become(GenerationStatus::Superseded) {
            return Err(StoreError::Corrupt(format!(
                "generation {expected} of family {family_id} is {}, not current",
                current.status.as_str()
            )));
        }
        current.status = GenerationStatus::Superseded;

        let mut next = next.clone();
        next.status = GenerationStatus::Current;
        stored.current_generation = next.number;
        stored.expires_at = next.refresh_expires_at;
        self.by_refresh_hash
            .insert(next.refresh_token_hash.clone(), (family_id, next.number));
        generations.push(next);

        Ok(AdvanceOutcome::Advanced)
    }

    async fn revoke(
        &self,
        family_id: FamilyId,
        now: i64,
    ) -> Result<Option<RevokedFamily>, StoreError> {
        let Some(mut entry) = self.families.get_mut(&family_id) else {
            return Ok(None);
        };

        let newly_revoked = entry.family.status == FamilyStatus::Active;
        if newly_revoked {
            entry.family.status = FamilyStatus::Revoked;
            entry.family.revoked_at = Some(now);
        }
        for generation in &mut entry.generations {
            if generation.status.can_become(GenerationStatus::Revoked) {
                generation.status = GenerationStatus::Revoked;
            }
        }

        Ok(Some(RevokedFamily {
            family: entry.family.clone(),
            generations: entry.generations.clone(),
            newly_revoked,
        }))
    }

    async fn get(&self, family_id: FamilyId) -> Result<Option<TokenFamily>, StoreError> {
        Ok(self.families.get(&family_id).map(|e| e.family.clone()))
    }

    async fn families_for_subject(&self, subject: &str) -> Result<Vec<FamilyId>, StoreError> {
        Ok(self
            .by_subject
            .get(subject)
            .map(|ids| ids.clone())
            .unwrap_or_default())
    }
}
