//! Deterministic cryptographic fixtures for testing
//!
//! Provides reproducible Ed25519 keypairs, signers built from them, and
//! client keys for proof-of-possession tests.
//! All fixtures are deterministic based on seed values.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use token_service::crypto::dpop::{access_token_hash, ProofJwk, DPOP_PROOF_TYPE};
use token_service::crypto::signer::LocalSigner;
use token_service::models::SigningKey;

/// Test fixture error type
#[derive(Error, Debug)]
pub enum FixtureError {
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),
}

/// A deterministic Ed25519 keypair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestKeyPair {
    /// Raw 32-byte public key.
    pub public_key: Vec<u8>,
    /// PKCS#8 v1 document holding the seed.
    pub pkcs8: Vec<u8>,
}

/// Generate a deterministic Ed25519 keypair for testing.
///
/// The same seed always produces the same keypair.
///
/// # Example
/// ```rust,ignore
/// let key = test_signing_key(1)?;
/// assert_eq!(key, test_signing_key(1)?);
/// ```
pub fn test_signing_key(seed: u8) -> Result<TestKeyPair, FixtureError> {
    let seed_bytes = seed_bytes(seed);

    let key_pair = Ed25519KeyPair::from_seed_unchecked(&seed_bytes)
        .map_err(|e| FixtureError::Crypto(format!("Failed to generate test keypair: {:?}", e)))?;

    Ok(TestKeyPair {
        public_key: key_pair.public_key().as_ref().to_vec(),
        pkcs8: build_pkcs8_from_seed(&seed_bytes),
    })
}

/// A [`LocalSigner`] whose active key comes from `seed`.
pub fn test_local_signer(
    seed: u8,
    kid: &str,
    grace_window: Duration,
) -> Result<Arc<LocalSigner>, FixtureError> {
    let key = test_signing_key(seed)?;
    let signer = LocalSigner::from_pkcs8(kid, &key.pkcs8, grace_window)
        .map_err(|e| FixtureError::Crypto(format!("Failed to build test signer: {e}")))?;
    Ok(Arc::new(signer))
}

/// The active verification key matching [`test_signing_key`] for `seed`.
pub fn test_verification_key(seed: u8, kid: &str) -> Result<SigningKey, FixtureError> {
    Ok(SigningKey::new_active(kid, test_signing_key(seed)?.public_key))
}

/// A client Ed25519 key that signs DPoP proofs.
///
/// # Example
/// ```rust,ignore
/// let client = TestProofKey::from_seed(9)?;
/// let binding = lifecycle
///     .verify_dpop_proof(&DpopRequest::new(&client.proof("POST", uri), "POST", uri))
///     .await?;
/// ```
pub struct TestProofKey {
    pair: Ed25519KeyPair,
}

impl TestProofKey {
    pub fn from_seed(seed: u8) -> Result<Self, FixtureError> {
        let pair = Ed25519KeyPair::from_seed_unchecked(&seed_bytes(seed))
            .map_err(|e| FixtureError::Crypto(format!("Failed to build proof key: {:?}", e)))?;
        Ok(Self { pair })
    }

    pub fn jwk(&self) -> ProofJwk {
        ProofJwk {
            kty: "OKP".to_string(),
            crv: Some("Ed25519".to_string()),
            x: Some(URL_SAFE_NO_PAD.encode(self.pair.public_key().as_ref())),
            y: None,
            n: None,
            e: None,
            d: None,
        }
    }

    /// RFC 7638 thumbprint, the value carried in `cnf.jkt`.
    pub fn jkt(&self) -> String {
        self.jwk()
            .thumbprint()
            .unwrap_or_else(|e| panic!("fixture key has no thumbprint: {e}"))
    }

    /// A fresh proof for a token-endpoint request.
    pub fn proof(&self, method: &str, uri: &str) -> String {
        self.sign_claims(&proof_claims(method, uri))
    }

    /// A fresh proof for a resource request carrying `access_token`.
    pub fn proof_for_token(&self, method: &str, uri: &str, access_token: &str) -> String {
        let mut claims = proof_claims(method, uri);
        claims["ath"] = Value::from(access_token_hash(access_token));
        self.sign_claims(&claims)
    }

    /// Sign arbitrary claims under a well-formed proof header.
    pub fn sign_claims(&self, claims: &Value) -> String {
        let header = json!({"typ": DPOP_PROOF_TYPE, "alg": "EdDSA", "jwk": self.jwk()});
        let input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        );
        let signature = self.pair.sign(input.as_bytes());
        format!("{input}.{}", URL_SAFE_NO_PAD.encode(signature.as_ref()))
    }
}

fn proof_claims(method: &str, uri: &str) -> Value {
    json!({
        "jti": uuid::Uuid::new_v4().to_string(),
        "htm": method,
        "htu": uri,
        "iat": Utc::now().timestamp(),
    })
}

fn seed_bytes(seed: u8) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    for (i, byte) in bytes.iter_mut().enumerate() {
        let i = i as u8;
        *byte = seed.wrapping_mul(i.wrapping_add(7)).wrapping_add(i);
    }
    bytes
}

/// Build a PKCS#8 v1 document (RFC 5208) from an Ed25519 seed.
///
/// Test-only. Production keys come from `ring::rand::SystemRandom`.
fn build_pkcs8_from_seed(seed: &[u8; 32]) -> Vec<u8> {
    // SEQUENCE { INTEGER 0, SEQUENCE { OID 1.3.101.112 }, OCTET STRING { OCTET STRING seed } }
    let mut pkcs8 = vec![0x30, 0x2e, 0x02, 0x01, 0x00];
    pkcs8.extend_from_slice(&[0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70]);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(seed);
    pkcs8
}
