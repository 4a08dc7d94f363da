//! Data model for the token lifecycle.
//!
//! - [`claims`] - JWT payloads and validation requirements
//! - [`family`] - token families and their generation chain
//! - [`keys`] - verification keys, key sets and the JWKS document shape

pub mod claims;
pub mod family;
pub mod keys;

pub use claims::{Claims, Confirmation, RequiredClaims, TokenUse};
pub use family::{FamilyStatus, Generation, GenerationStatus, IssuedToken, TokenFamily};
pub use keys::{JsonWebKey, Jwks, KeySet, KeyStatus, SigningKey};

use common::secret::SecretString;
use common::types::FamilyId;
use std::fmt;

/// Tokens returned by `issue` and `rotate`.
///
/// `id_token` is only present on the initial issue.
pub struct TokenPair {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub id_token: Option<SecretString>,
    pub token_type: &'static str,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
    /// Refresh token lifetime in seconds.
    pub refresh_expires_in: u64,
    pub family_id: FamilyId,
    pub generation: u32,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("id_token", &self.id_token.as_ref().map(|_| "[REDACTED]"))
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("refresh_expires_in", &self.refresh_expires_in)
            .field("family_id", &self.family_id)
            .field("generation", &self.generation)
            .finish()
    }
}
