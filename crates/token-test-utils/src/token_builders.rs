//! Builder patterns for test data construction
//!
//! Provides fluent APIs for hand-crafted claim sets, signed with a test
//! signer, for exercising validation paths the issuer never produces
//! (expired, not yet valid, foreign issuer).

use crate::test_ids::{TEST_AUDIENCE, TEST_ISSUER, TEST_SESSION_1, TEST_SUBJECT_ALICE};
use chrono::Utc;
use common::jwt::{attach_signature, encode_signing_input, JoseHeader};
use serde_json::{Map, Value};
use token_service::crypto::signer::SigningKeySource;
use token_service::models::{Claims, Confirmation, TokenUse};
use uuid::Uuid;

/// Builder for test JWT claims
///
/// # Example
/// ```rust,ignore
/// let token = TestClaimsBuilder::new()
///     .for_subject("alice")
///     .with_scope("profile:read")
///     .expires_in(-60)
///     .sign_with(&signer)
///     .await;
/// ```
pub struct TestClaimsBuilder {
    claims: Claims,
}

impl TestClaimsBuilder {
    /// Create a builder for a valid access token, issued now, expiring in one hour.
    pub fn new() -> Self {
        let now = Utc::now().timestamp();
        Self {
            claims: Claims {
                sub: TEST_SUBJECT_ALICE.to_string(),
                iss: TEST_ISSUER.to_string(),
                aud: TEST_AUDIENCE.to_string(),
                iat: now,
                exp: now + 3600,
                nbf: None,
                jti: Uuid::new_v4().to_string(),
                sid: TEST_SESSION_1.to_string(),
                scope: String::new(),
                token_use: TokenUse::Access,
                fid: None,
                nonce: None,
                cnf: None,
                custom: Map::new(),
            },
        }
    }

    pub fn for_subject(mut self, subject: &str) -> Self {
        self.claims.sub = subject.to_string();
        self
    }

    /// Set the scope (space-separated)
    pub fn with_scope(mut self, scope: &str) -> Self {
        self.claims.scope = scope.to_string();
        self
    }

    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.claims.iss = issuer.to_string();
        self
    }

    pub fn with_audience(mut self, audience: &str) -> Self {
        self.claims.aud = audience.to_string();
        self
    }

    pub fn token_use(mut self, token_use: TokenUse) -> Self {
        self.claims.token_use = token_use;
        self
    }

    pub fn with_claim(mut self, name: &str, value: Value) -> Self {
        self.claims.custom.insert(name.to_string(), value);
        self
    }

    /// Set expiration in seconds from now (negative for an expired token)
    pub fn expires_in(mut self, seconds: i64) -> Self {
        self.claims.exp = Utc::now().timestamp() + seconds;
        self
    }

    /// Set issued-at timestamp
    pub fn issued_at(mut self, timestamp: i64) -> Self {
        self.claims.iat = timestamp;
        self
    }

    pub fn not_before(mut self, timestamp: i64) -> Self {
        self.claims.nbf = Some(timestamp);
        self
    }

    /// Bind the token to a proof-of-possession key thumbprint.
    pub fn bound_to_key(mut self, jkt: &str) -> Self {
        self.claims.cnf = Some(Confirmation {
            jkt: jkt.to_string(),
        });
        self
    }

    pub fn build(self) -> Claims {
        self.claims
    }

    /// Sign with the source's active key.
    pub async fn sign_with(self, signer: &dyn SigningKeySource) -> String {
        sign_claims(signer, &self.claims).await
    }
}

impl Default for TestClaimsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Sign arbitrary claims with the source's active key.
pub async fn sign_claims(signer: &dyn SigningKeySource, claims: &Claims) -> String {
    let kid = signer
        .active_key_id()
        .await
        .expect("test signer should have an active key");
    let input = encode_signing_input(&JoseHeader::eddsa(&kid), claims)
        .expect("claims should serialize");
    let signature = signer
        .sign(&kid, input.as_bytes())
        .await
        .expect("test signer should sign");
    attach_signature(&input, &signature)
}
