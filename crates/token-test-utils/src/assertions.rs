//! Custom test assertions for expressive tests
//!
//! Provides trait-based assertions over compact JWTs, decoded without
//! verification, and a helper for asserting error codes.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use common::types::FamilyId;
use serde::Deserialize;
use std::fmt::Debug;
use token_service::errors::TokenError;
use token_service::models::{Claims, TokenUse};

/// JWT header structure
#[derive(Debug, Deserialize)]
struct JwtHeader {
    pub alg: String,
    pub typ: String,
    #[serde(default)]
    pub kid: Option<String>,
}

/// Custom assertions for issued tokens
///
/// # Example
/// ```rust,ignore
/// pair.access_token
///     .expose_secret()
///     .assert_valid_jwt()
///     .assert_has_scope("profile:read")
///     .assert_signed_by("test-key-2025-01");
/// ```
pub trait TokenAssertions {
    /// Assert that the token is a three-part EdDSA JWT with a `kid`
    fn assert_valid_jwt(&self) -> &Self;

    /// Assert that the token contains the specified scope
    fn assert_has_scope(&self, scope: &str) -> &Self;

    /// Assert that the token was signed by the specified key
    fn assert_signed_by(&self, key_id: &str) -> &Self;

    /// Assert that the token expires within the specified seconds
    fn assert_expires_in(&self, seconds: u64) -> &Self;

    /// Assert that the token is for the specified subject
    fn assert_for_subject(&self, subject: &str) -> &Self;

    fn assert_token_use(&self, token_use: TokenUse) -> &Self;

    /// Assert that the token carries the given family id
    fn assert_in_family(&self, family_id: FamilyId) -> &Self;

    /// Assert that a registered or custom claim is absent
    fn assert_lacks_claim(&self, name: &str) -> &Self;
}

fn segment(token: &str, index: usize) -> Vec<u8> {
    let part = token
        .split('.')
        .nth(index)
        .unwrap_or_else(|| panic!("JWT has no segment {index}"));
    URL_SAFE_NO_PAD
        .decode(part)
        .unwrap_or_else(|e| panic!("Failed to base64 decode JWT segment {index}: {e}"))
}

fn header(token: &str) -> JwtHeader {
    serde_json::from_slice(&segment(token, 0)).expect("Failed to parse JWT header")
}

/// Decode the payload without verifying the signature.
pub fn decode_claims(token: &str) -> Claims {
    serde_json::from_slice(&segment(token, 1)).expect("Failed to parse JWT claims")
}

impl TokenAssertions for str {
    fn assert_valid_jwt(&self) -> &Self {
        let parts = self.split('.').count();
        assert_eq!(
            parts, 3,
            "JWT must have 3 parts (header.payload.signature), got {}",
            parts
        );

        let header = header(self);
        assert_eq!(header.alg, "EdDSA", "Expected EdDSA algorithm");
        assert_eq!(header.typ, "JWT", "Expected JWT type");
        assert!(header.kid.is_some(), "JWT header must carry a kid");

        decode_claims(self);
        self
    }

    fn assert_has_scope(&self, scope: &str) -> &Self {
        let claims = decode_claims(self);
        assert!(
            claims.has_scope(scope),
            "Token does not contain scope '{}'. Available scopes: {}",
            scope,
            claims.scope
        );
        self
    }

    fn assert_signed_by(&self, key_id: &str) -> &Self {
        let header = header(self);
        assert_eq!(
            header.kid.as_deref(),
            Some(key_id),
            "Expected key_id '{}', got {:?}",
            key_id,
            header.kid
        );
        self
    }

    fn assert_expires_in(&self, seconds: u64) -> &Self {
        let claims = decode_claims(self);
        let expires_in = claims.exp - chrono::Utc::now().timestamp();

        // Allow 5-second tolerance for slow test runs
        assert!(
            (expires_in - seconds as i64).abs() <= 5,
            "Expected token to expire in {} seconds, but expires in {} seconds",
            seconds,
            expires_in
        );
        self
    }

    fn assert_for_subject(&self, subject: &str) -> &Self {
        let claims = decode_claims(self);
        assert_eq!(
            claims.sub, subject,
            "Expected subject '{}', got '{}'",
            subject, claims.sub
        );
        self
    }

    fn assert_token_use(&self, token_use: TokenUse) -> &Self {
        let claims = decode_claims(self);
        assert_eq!(claims.token_use, token_use, "Unexpected token_use");
        self
    }

    fn assert_in_family(&self, family_id: FamilyId) -> &Self {
        let claims = decode_claims(self);
        assert_eq!(claims.fid, Some(family_id), "Token belongs to another family");
        self
    }

    fn assert_lacks_claim(&self, name: &str) -> &Self {
        let payload: serde_json::Value =
            serde_json::from_slice(&segment(self, 1)).expect("Failed to parse JWT claims");
        assert!(
            payload.get(name).is_none(),
            "Token unexpectedly carries claim '{}'",
            name
        );
        self
    }
}

/// Assert that `result` failed with the given stable error code.
pub fn assert_error_code<T: Debug>(result: Result<T, TokenError>, code: &str) {
    match result {
        Ok(value) => panic!("Expected error {code}, got Ok({value:?})"),
        Err(e) => assert_eq!(e.code(), code, "Unexpected error: {e:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(header: &str, payload: &str) -> String {
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(header.as_bytes()),
            URL_SAFE_NO_PAD.encode(payload.as_bytes())
        )
    }

    const HEADER: &str = r#"{"alg":"EdDSA","typ":"JWT","kid":"test-key-2025"}"#;
    const PAYLOAD: &str = r#"{"sub":"u1","iss":"i","aud":"api","iat":1234567890,"exp":9999999999,"jti":"j","sid":"s1","scope":"profile:read profile:write","token_use":"access"}"#;

    #[test]
    fn test_assert_valid_jwt_with_valid_token() {
        token(HEADER, PAYLOAD).assert_valid_jwt();
    }

    #[test]
    #[should_panic(expected = "JWT must have 3 parts")]
    fn test_assert_valid_jwt_with_invalid_structure() {
        "invalid.token".assert_valid_jwt();
    }

    #[test]
    fn test_assert_has_scope() {
        token(HEADER, PAYLOAD)
            .assert_has_scope("profile:read")
            .assert_has_scope("profile:write");
    }

    #[test]
    #[should_panic(expected = "does not contain scope")]
    fn test_assert_has_scope_missing() {
        token(HEADER, PAYLOAD).assert_has_scope("admin");
    }

    #[test]
    fn test_assert_signed_by_and_subject() {
        token(HEADER, PAYLOAD)
            .assert_signed_by("test-key-2025")
            .assert_for_subject("u1")
            .assert_token_use(TokenUse::Access)
            .assert_lacks_claim("nonce");
    }

    #[test]
    fn test_assert_error_code() {
        assert_error_code::<()>(Err(TokenError::TokenReplayed), "TOKEN_REPLAYED");
    }

    #[test]
    #[should_panic(expected = "Expected error")]
    fn test_assert_error_code_on_success() {
        assert_error_code(Ok(1), "TOKEN_INVALID");
    }
}
