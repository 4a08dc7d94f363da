use common::types::FamilyId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FamilyStatus {
    Active,
    Revoked,
}

impl FamilyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FamilyStatus::Active => "active",
            FamilyStatus::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(FamilyStatus::Active),
            "revoked" => Some(FamilyStatus::Revoked),
            _ => None,
        }
    }
}

/// Generation lifecycle. `Superseded` and `Revoked` never return to `Current`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Current,
    Superseded,
    Revoked,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Current => "current",
            GenerationStatus::Superseded => "superseded",
            GenerationStatus::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "current" => Some(GenerationStatus::Current),
            "superseded" => Some(GenerationStatus::Superseded),
            "revoked" => Some(GenerationStatus::Revoked),
            _ => None,
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_become(&self, next: GenerationStatus) -> bool {
        matches!(
            (self, next),
            (GenerationStatus::Current, GenerationStatus::Superseded)
                | (GenerationStatus::Current, GenerationStatus::Revoked)
                | (GenerationStatus::Superseded, GenerationStatus::Revoked)
                | (GenerationStatus::Revoked, GenerationStatus::Revoked)
        )
    }
}

/// A token minted for a generation, tracked so revocation can reach it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    pub jti: String,
    /// Unix seconds.
    pub expires_at: i64,
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("jti", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Lineage of refresh tokens from one authentication event.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenFamily {
    pub family_id: FamilyId,
    pub subject: String,
    pub session_id: String,
    /// Normalized, space-separated.
    pub scope: String,
    pub audience: String,
    pub custom: Map<String, Value>,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    pub current_generation: u32,
    pub status: FamilyStatus,
    pub created_at: i64,
    /// Refresh expiry of the current generation; storage may drop the
    /// family after this.
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<i64>,
    /// Thumbprint of the key every generation must prove possession of.
    /// Fixed at issue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpop_jkt: Option<String>,
}

impl fmt::Debug for TokenFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenFamily")
            .field("family_id", &self.family_id)
            .field("subject", &"[REDACTED]")
            .field("session_id", &"[REDACTED]")
            .field("scope", &self.scope)
            .field("current_generation", &self.current_generation)
            .field("status", &self.status)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("revoked_at", &self.revoked_at)
            .field("sender_constrained", &self.dpop_jkt.is_some())
            .finish()
    }
}

impl TokenFamily {
    pub fn is_revoked(&self) -> bool {
        self.status == FamilyStatus::Revoked
    }

    pub fn is_sender_constrained(&self) -> bool {
        self.dpop_jkt.is_some()
    }
}

/// One link in a family's rotation chain, keyed by `(family_id, number)`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub family_id: FamilyId,
    pub number: u32,
    /// Hex SHA-256 of the serialized refresh token.
    pub refresh_token_hash: String,
    pub status: GenerationStatus,
    pub issued_at: i64,
    pub refresh_expires_at: i64,
    pub tokens: Vec<IssuedToken>,
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("family_id", &self.family_id)
            .field("number", &self.number)
            .field("refresh_token_hash", &"[REDACTED]")
            .field("status", &self.status)
            .field("issued_at", &self.issued_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

impl Generation {
    /// Tokens that have not yet expired at `now`.
    pub fn live_tokens(&self, now: i64) -> impl Iterator<Item = &IssuedToken> {
        self.tokens.iter().filter(move |t| t.expires_at > now)
    }

    pub fn refresh_expired(&self, now: i64) -> bool {
        self.refresh_expires_at <= now
    }
}
