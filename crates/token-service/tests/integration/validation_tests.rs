//! Integration tests for access token validation
//!
//! Tokens are built with [`TestClaimsBuilder`] and signed directly, so each
//! test controls exactly one claim. The order of checks matters: signature,
//! then expiry, then time and claim requirements, then revocation.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use token_service::models::{RequiredClaims, TokenUse};
use token_test_utils::{
    assert_error_code, test_local_signer, TestClaimsBuilder, TestLifecycle, SCOPE_ADMIN,
    SCOPE_PROFILE_READ, TEST_AUDIENCE, TEST_ISSUER, TEST_KEY_ID_1, TEST_KEY_ID_2,
    TEST_KEY_SEED_2, TEST_SUBJECT_BOB,
};

#[tokio::test]
async fn test_validate_well_formed_token_returns_claims() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let token = TestClaimsBuilder::new()
        .for_subject(TEST_SUBJECT_BOB)
        .with_scope(SCOPE_PROFILE_READ)
        .with_claim("tenant", json!("acme"))
        .sign_with(harness.signer.as_ref())
        .await;

    let claims = harness.lifecycle.validate_access(&token).await?;
    assert_eq!(claims.sub, TEST_SUBJECT_BOB);
    assert_eq!(claims.custom.get("tenant"), Some(&json!("acme")));
    Ok(())
}

#[tokio::test]
async fn test_validate_structurally_broken_tokens_are_invalid() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;

    for token in ["", "abc", "a.b", "a.b.c.d", "!!!.???.***"] {
        assert_error_code(harness.lifecycle.validate_access(token).await, "TOKEN_INVALID");
    }

    let oversized = "a".repeat(64 * 1024);
    assert_error_code(
        harness.lifecycle.validate_access(&oversized).await,
        "TOKEN_INVALID",
    );
    Ok(())
}

#[tokio::test]
async fn test_validate_tampered_payload_fails_signature() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let token = TestClaimsBuilder::new()
        .sign_with(harness.signer.as_ref())
        .await;

    let parts: Vec<&str> = token.split('.').collect();
    let mut payload: serde_json::Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1])?)?;
    payload["scope"] = json!(SCOPE_ADMIN);
    let forged = format!(
        "{}.{}.{}",
        parts[0],
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload)?),
        parts[2]
    );

    assert_error_code(harness.lifecycle.validate_access(&forged).await, "TOKEN_INVALID");
    Ok(())
}

#[tokio::test]
async fn test_validate_signature_from_unpublished_key_is_invalid() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;

    // Same kid as the published key, different private key
    let impostor = test_local_signer(TEST_KEY_SEED_2, TEST_KEY_ID_1, Duration::from_secs(60))?;
    let token = TestClaimsBuilder::new().sign_with(impostor.as_ref()).await;
    assert_error_code(harness.lifecycle.validate_access(&token).await, "TOKEN_INVALID");

    // A kid nobody published
    let stranger = test_local_signer(TEST_KEY_SEED_2, TEST_KEY_ID_2, Duration::from_secs(60))?;
    let token = TestClaimsBuilder::new().sign_with(stranger.as_ref()).await;
    assert_error_code(harness.lifecycle.validate_access(&token).await, "TOKEN_INVALID");
    Ok(())
}

#[tokio::test]
async fn test_validate_expired_token_reports_expiry_first() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;

    let token = TestClaimsBuilder::new()
        .expires_in(-60)
        .sign_with(harness.signer.as_ref())
        .await;
    assert_error_code(harness.lifecycle.validate_access(&token).await, "TOKEN_EXPIRED");

    // Expiry wins over a wrong audience
    let token = TestClaimsBuilder::new()
        .with_audience("someone-else")
        .expires_in(-60)
        .sign_with(harness.signer.as_ref())
        .await;
    assert_error_code(harness.lifecycle.validate_access(&token).await, "TOKEN_EXPIRED");
    Ok(())
}

#[tokio::test]
async fn test_validate_not_before_respects_clock_skew() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let now = Utc::now().timestamp();

    let within_skew = TestClaimsBuilder::new()
        .not_before(now + 60)
        .sign_with(harness.signer.as_ref())
        .await;
    harness.lifecycle.validate_access(&within_skew).await?;

    let beyond_skew = TestClaimsBuilder::new()
        .not_before(now + 3600)
        .expires_in(7200)
        .sign_with(harness.signer.as_ref())
        .await;
    assert_error_code(
        harness.lifecycle.validate_access(&beyond_skew).await,
        "CLAIMS_INVALID",
    );
    Ok(())
}

#[tokio::test]
async fn test_validate_issued_in_future_is_rejected() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let token = TestClaimsBuilder::new()
        .issued_at(Utc::now().timestamp() + 3600)
        .expires_in(7200)
        .sign_with(harness.signer.as_ref())
        .await;

    assert_error_code(harness.lifecycle.validate_access(&token).await, "CLAIMS_INVALID");
    Ok(())
}

#[tokio::test]
async fn test_validate_access_enforces_issuer_audience_and_use() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;

    let wrong_issuer = TestClaimsBuilder::new()
        .with_issuer("https://evil.example")
        .sign_with(harness.signer.as_ref())
        .await;
    let wrong_audience = TestClaimsBuilder::new()
        .with_audience("billing")
        .sign_with(harness.signer.as_ref())
        .await;
    let refresh = TestClaimsBuilder::new()
        .token_use(TokenUse::Refresh)
        .sign_with(harness.signer.as_ref())
        .await;

    for token in [&wrong_issuer, &wrong_audience, &refresh] {
        assert_error_code(harness.lifecycle.validate_access(token).await, "CLAIMS_INVALID");
    }
    Ok(())
}

#[tokio::test]
async fn test_validate_with_custom_requirements() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let token = TestClaimsBuilder::new()
        .with_scope(SCOPE_PROFILE_READ)
        .with_claim("tenant", json!("acme"))
        .sign_with(harness.signer.as_ref())
        .await;

    let base = RequiredClaims::access(TEST_ISSUER, TEST_AUDIENCE);

    harness
        .lifecycle
        .validate(&token, &base.clone().scope(SCOPE_PROFILE_READ).claim("tenant"))
        .await?;

    assert_error_code(
        harness
            .lifecycle
            .validate(&token, &base.clone().scope(SCOPE_ADMIN))
            .await,
        "CLAIMS_INVALID",
    );
    assert_error_code(
        harness.lifecycle.validate(&token, &base.claim("region")).await,
        "CLAIMS_INVALID",
    );
    Ok(())
}

#[tokio::test]
async fn test_validate_revoked_token_after_all_other_checks() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let token = TestClaimsBuilder::new()
        .sign_with(harness.signer.as_ref())
        .await;

    harness.lifecycle.revoke_token(&token).await?;
    assert_error_code(harness.lifecycle.validate_access(&token).await, "TOKEN_REVOKED");
    assert_eq!(harness.revocations.len(), 1);

    // Expired tokens need no revocation entry
    let expired = TestClaimsBuilder::new()
        .expires_in(-1)
        .sign_with(harness.signer.as_ref())
        .await;
    assert_error_code(harness.lifecycle.revoke_token(&expired).await, "TOKEN_EXPIRED");
    Ok(())
}
