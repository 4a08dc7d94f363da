//! Cryptographic helpers: key generation, refresh-token hashing and
//! signature verification. Signing itself goes through [`signer`];
//! proof-of-possession JWTs are handled in [`dpop`].

pub mod dpop;
pub mod signer;

use crate::errors::{SignerError, TokenError};
use crate::models::{Claims, SigningKey};
use chrono::{DateTime, Utc};
use common::jwt::MAX_JWT_SIZE_BYTES;
use common::secret::SecretBox;
use jsonwebtoken::{decode, Algorithm, Validation};
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{Ed25519KeyPair, KeyPair};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Freshly generated Ed25519 key material.
pub struct GeneratedKey {
    pub pkcs8: SecretBox<Vec<u8>>,
    pub public_key: Vec<u8>,
}

/// Generate an Ed25519 keypair with the system RNG.
pub fn generate_signing_keypair() -> Result<GeneratedKey, SignerError> {
    let rng = SystemRandom::new();

    let pkcs8_bytes = Ed25519KeyPair::generate_pkcs8(&rng)
        .map_err(|e| SignerError::Rejected(format!("Keypair generation failed: {e}")))?;

    let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8_bytes.as_ref())
        .map_err(|e| SignerError::Rejected(format!("Keypair parsing failed: {e}")))?;

    Ok(GeneratedKey {
        public_key: key_pair.public_key().as_ref().to_vec(),
        pkcs8: SecretBox::new(Box::new(pkcs8_bytes.as_ref().to_vec())),
    })
}

pub fn generate_random_bytes(len: usize) -> Result<Vec<u8>, SignerError> {
    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; len];
    rng.fill(&mut bytes)
        .map_err(|e| SignerError::Rejected(format!("Random bytes generation failed: {e}")))?;
    Ok(bytes)
}

/// Key id format: `tl-{YYYYMMDD}-{8 hex}`.
pub fn generate_key_id(now: DateTime<Utc>) -> Result<String, SignerError> {
    let suffix = generate_random_bytes(4)?;
    Ok(format!("tl-{}-{}", now.format("%Y%m%d"), hex::encode(suffix)))
}

/// Lookup key for a refresh token. The raw token is never stored.
pub fn hash_refresh_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Verify a compact JWS against one key and return its claims.
///
/// Only the signature and structure are checked here. Expiry and claim
/// requirements are the validator's job so it can order them after the
/// signature check.
pub fn verify_signature(token: &str, key: &SigningKey) -> Result<Claims, TokenError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        return Err(TokenError::TokenInvalid);
    }

    let mut validation = Validation::new(Algorithm::EdDSA);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();

    let token_data = decode::<Claims>(token, &key.decoding_key(), &validation).map_err(|e| {
        tracing::debug!(target: "token.crypto", error = %e, kid = %key.kid, "Token verification failed");
        TokenError::TokenInvalid
    })?;

    Ok(token_data.claims)
}
