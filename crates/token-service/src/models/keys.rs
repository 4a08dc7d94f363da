use crate::errors::FetchError;
use chrono::{DateTime, Utc};
use common::jwt::{decode_ed25519_public_key_jwk, encode_ed25519_public_key_jwk, EDDSA_ALG};
use jsonwebtoken::DecodingKey;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// Signs new tokens. Exactly one per key set.
    Active,
    /// Verify-only until the grace window elapses.
    Previous,
    /// Past the grace window; never published.
    Retired,
}

/// A public verification key. Private material never lives here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningKey {
    pub kid: String,
    pub algorithm: String,
    /// Raw 32-byte Ed25519 public key.
    pub public_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub status: KeyStatus,
    /// When this key stopped being active.
    pub rotated_at: Option<DateTime<Utc>>,
}

impl SigningKey {
    pub fn new_active(kid: impl Into<String>, public_key: Vec<u8>) -> Self {
        Self {
            kid: kid.into(),
            algorithm: EDDSA_ALG.to_string(),
            public_key,
            created_at: Utc::now(),
            status: KeyStatus::Active,
            rotated_at: None,
        }
    }

    pub fn decoding_key(&self) -> DecodingKey {
        DecodingKey::from_ed_der(&self.public_key)
    }

    pub fn to_jwk(&self) -> JsonWebKey {
        JsonWebKey {
            kid: self.kid.clone(),
            kty: "OKP".to_string(),
            crv: "Ed25519".to_string(),
            x: encode_ed25519_public_key_jwk(&self.public_key),
            use_: "sig".to_string(),
            alg: self.algorithm.clone(),
        }
    }

    /// Accepts only Ed25519 signature keys.
    pub fn from_jwk(jwk: &JsonWebKey, status: KeyStatus) -> Result<Self, FetchError> {
        if jwk.kid.is_empty() {
            return Err(FetchError::Malformed("jwk without kid".to_string()));
        }
        if jwk.kty != "OKP" || jwk.crv != "Ed25519" {
            return Err(FetchError::Malformed(format!(
                "unsupported key type {}/{}",
                jwk.kty, jwk.crv
            )));
        }
        if !jwk.alg.is_empty() && jwk.alg != EDDSA_ALG {
            return Err(FetchError::Malformed(format!("unsupported alg {}", jwk.alg)));
        }
        if !jwk.use_.is_empty() && jwk.use_ != "sig" {
            return Err(FetchError::Malformed(format!("unsupported use {}", jwk.use_)));
        }
        let public_key = decode_ed25519_public_key_jwk(&jwk.x)
            .map_err(|_| FetchError::Malformed("invalid Ed25519 x value".to_string()))?;

        Ok(Self {
            kid: jwk.kid.clone(),
            algorithm: EDDSA_ALG.to_string(),
            public_key,
            created_at: Utc::now(),
            status,
            rotated_at: None,
        })
    }
}

/// Immutable, versioned collection of verification keys.
///
/// The first key is the active key; every other key is `Previous`.
/// A `KeySet` is never mutated after construction. Changes are published
/// by building a new set and swapping the pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySet {
    version: u64,
    keys: Vec<SigningKey>,
}

impl KeySet {
    /// Build a set whose first key becomes the active key.
    pub fn new(version: u64, keys: Vec<SigningKey>) -> Result<Self, FetchError> {
        let mut keys = keys.into_iter();
        let active = keys.next().ok_or(FetchError::EmptyKeySet)?;
        Ok(Self::with_active(version, active, keys.collect()))
    }

    pub fn with_active(version: u64, mut active: SigningKey, previous: Vec<SigningKey>) -> Self {
        active.status = KeyStatus::Active;
        let mut keys = Vec::with_capacity(previous.len() + 1);
        keys.push(active);
        keys.extend(previous.into_iter().map(|mut key| {
            key.status = KeyStatus::Previous;
            key
        }));
        Self { version, keys }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn keys(&self) -> &[SigningKey] {
        &self.keys
    }

    pub fn active(&self) -> Option<&SigningKey> {
        self.keys.first()
    }

    pub fn find(&self, kid: &str) -> Option<&SigningKey> {
        self.keys.iter().find(|k| k.kid == kid)
    }

    /// JWKS document with the active key first.
    pub fn to_jwks(&self) -> Jwks {
        Jwks {
            keys: self.keys.iter().map(SigningKey::to_jwk).collect(),
        }
    }

    /// Parse a fetched JWKS document. Unsupported keys are skipped.
    pub fn from_jwks(jwks: &Jwks, version: u64) -> Result<Self, FetchError> {
        let mut keys = Vec::with_capacity(jwks.keys.len());
        for jwk in &jwks.keys {
            match SigningKey::from_jwk(jwk, KeyStatus::Previous) {
                Ok(key) if keys.iter().any(|k: &SigningKey| k.kid == key.kid) => {
                    tracing::warn!(target: "token.keys", kid = %key.kid, "Duplicate kid in key set, keeping first");
                }
                Ok(key) => keys.push(key),
                Err(e) => {
                    tracing::warn!(target: "token.keys", kid = %jwk.kid, error = %e, "Skipping unusable key");
                }
            }
        }
        Self::new(version, keys)
    }
}

/// JSON Web Key Set (RFC 7517)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<JsonWebKey>,
}

/// JSON Web Key (RFC 7517)
///
/// Fields default to empty on input so keys of other types still parse
/// and can be skipped individually.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonWebKey {
    #[serde(default)]
    pub kid: String,
    pub kty: String,
    #[serde(default)]
    pub crv: String,
    #[serde(default)]
    pub x: String,
    #[serde(rename = "use", default)]
    pub use_: String,
    #[serde(default)]
    pub alg: String,
}
