//! Proof-of-possession JWTs (RFC 9449).
//!
//! A proof is a compact JWS whose header carries the client's public key.
//! Verification here covers the envelope only: header shape, an accepted
//! algorithm, the signature against the embedded key, and the RFC 7638
//! thumbprint of that key. Request binding (`htm`, `htu`, `iat`, `ath`) and
//! one-time use are checked by the proof verifier service.

use crate::errors::ProofError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use common::jwt::MAX_JWT_SIZE_BYTES;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

/// Required `typ` header of a proof.
pub const DPOP_PROOF_TYPE: &str = "dpop+jwt";

/// Longest accepted proof `jti`.
pub const MAX_PROOF_JTI_LEN: usize = 256;

/// Length of a base64url SHA-256 thumbprint.
const THUMBPRINT_LEN: usize = 43;

/// Public key embedded in a proof header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofJwk {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    /// Private exponent or scalar. Never allowed in a proof.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
}

impl ProofJwk {
    /// RFC 7638 thumbprint: base64url SHA-256 over the required members,
    /// serialized in lexicographic order without whitespace.
    pub fn thumbprint(&self) -> Result<String, ProofError> {
        let members: BTreeMap<&str, &str> = match self.kty.as_str() {
            "EC" => BTreeMap::from([
                ("crv", member(&self.crv)?),
                ("kty", "EC"),
                ("x", member(&self.x)?),
                ("y", member(&self.y)?),
            ]),
            "OKP" => BTreeMap::from([
                ("crv", member(&self.crv)?),
                ("kty", "OKP"),
                ("x", member(&self.x)?),
            ]),
            "RSA" => BTreeMap::from([
                ("e", member(&self.e)?),
                ("kty", "RSA"),
                ("n", member(&self.n)?),
            ]),
            _ => return Err(ProofError::Malformed("unsupported key type")),
        };
        let canonical = serde_json::to_string(&members)
            .map_err(|_| ProofError::Malformed("key not serializable"))?;
        Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes())))
    }

    fn decoding_key(&self, alg: Algorithm) -> Result<DecodingKey, ProofError> {
        let key = match (alg, self.kty.as_str(), self.crv.as_deref()) {
            (Algorithm::EdDSA, "OKP", Some("Ed25519")) => {
                DecodingKey::from_ed_components(member(&self.x)?)
            }
            (Algorithm::ES256, "EC", Some("P-256")) => {
                DecodingKey::from_ec_components(member(&self.x)?, member(&self.y)?)
            }
            (Algorithm::RS256, "RSA", _) => {
                DecodingKey::from_rsa_components(member(&self.n)?, member(&self.e)?)
            }
            _ => return Err(ProofError::KeyMismatch),
        };
        key.map_err(|_| ProofError::Malformed("unusable key"))
    }
}

fn member(value: &Option<String>) -> Result<&str, ProofError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or(ProofError::Malformed("key member missing"))
}

#[derive(Deserialize)]
struct ProofHeader {
    typ: String,
    alg: String,
    jwk: ProofJwk,
}

/// Claims of a proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofClaims {
    pub jti: String,
    /// HTTP method of the request the proof was made for.
    pub htm: String,
    /// HTTP target URI, without query and fragment.
    pub htu: String,
    pub iat: i64,
    /// base64url SHA-256 of the access token, on resource requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// A proof whose signature verified against its own header key.
#[derive(Debug, Clone)]
pub struct VerifiedProof {
    pub claims: ProofClaims,
    /// Thumbprint of the signing key.
    pub jkt: String,
}

/// Check a proof's envelope and signature.
///
/// Accepts `EdDSA` (Ed25519), `ES256` and `RS256`. Symmetric algorithms and
/// `none` are refused before any key is built.
pub fn verify_proof(proof: &str) -> Result<VerifiedProof, ProofError> {
    if proof.len() > MAX_JWT_SIZE_BYTES {
        return Err(ProofError::Malformed("too large"));
    }
    let mut parts = proof.split('.');
    let (Some(header_part), Some(_), Some(_), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ProofError::Malformed("not a compact JWS"));
    };

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_part)
        .map_err(|_| ProofError::Malformed("header encoding"))?;
    let header: ProofHeader =
        serde_json::from_slice(&header_bytes).map_err(|_| ProofError::Malformed("header"))?;

    if header.typ != DPOP_PROOF_TYPE {
        return Err(ProofError::Malformed("typ"));
    }
    let alg = match header.alg.as_str() {
        "EdDSA" => Algorithm::EdDSA,
        "ES256" => Algorithm::ES256,
        "RS256" => Algorithm::RS256,
        other => return Err(ProofError::UnsupportedAlgorithm(other.to_string())),
    };
    if header.jwk.d.is_some() {
        return Err(ProofError::Malformed("private key in header"));
    }
    let key = header.jwk.decoding_key(alg)?;

    let mut validation = Validation::new(alg);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();

    let claims = decode::<ProofClaims>(proof, &key, &validation)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::InvalidSignature => ProofError::BadSignature,
            _ => ProofError::Malformed("claims"),
        })?
        .claims;

    if claims.jti.is_empty() || claims.jti.len() > MAX_PROOF_JTI_LEN {
        return Err(ProofError::Malformed("jti"));
    }
    if claims.htm.is_empty() || claims.htu.is_empty() {
        return Err(ProofError::Malformed("request binding"));
    }

    Ok(VerifiedProof {
        jkt: header.jwk.thumbprint()?,
        claims,
    })
}

/// `ath` value for an access token.
pub fn access_token_hash(access_token: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(access_token.as_bytes()))
}

/// Shape check for a thumbprint supplied by a caller.
pub fn is_valid_thumbprint(jkt: &str) -> bool {
    jkt.len() == THUMBPRINT_LEN
        && jkt
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
