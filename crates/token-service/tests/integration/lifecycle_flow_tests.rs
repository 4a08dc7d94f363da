//! End-to-end tests for issue, rotate, replay and logout
//!
//! Every test drives a [`TestLifecycle`]: the real issuer, family tracker
//! and validator over in-memory stores and a deterministic local signer.
//!
//! Tests follow the convention: `test_<feature>_<scenario>_<expected_result>`

use common::secret::ExposeSecret;
use token_service::errors::TokenError;
use token_service::models::{GenerationStatus, TokenUse};
use token_service::repositories::FamilyStore;
use token_service::services::{IssueRequest, RevocationReason, SecurityEvent};
use token_test_utils::{
    assert_error_code, decode_claims, TestLifecycle, TokenAssertions, SCOPE_PROFILE_READ,
    SCOPE_PROFILE_WRITE, TEST_KEY_ID_1, TEST_SESSION_1, TEST_SESSION_2, TEST_SUBJECT_ALICE,
    TEST_SUBJECT_BOB,
};

fn alice_login() -> IssueRequest {
    IssueRequest::new(TEST_SUBJECT_ALICE, TEST_SESSION_1)
        .scopes([SCOPE_PROFILE_READ, SCOPE_PROFILE_WRITE])
}

// ============================================================================
// Issue
// ============================================================================

#[tokio::test]
async fn test_issue_returns_signed_generation_zero() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;

    let pair = harness
        .lifecycle
        .issue(alice_login().nonce("n-123"))
        .await?;

    assert_eq!(pair.generation, 0);
    assert_eq!(pair.token_type, "Bearer");
    assert_eq!(pair.expires_in, 900);
    assert_eq!(pair.refresh_expires_in, 7 * 24 * 3600);

    pair.access_token
        .expose_secret()
        .assert_valid_jwt()
        .assert_signed_by(TEST_KEY_ID_1)
        .assert_for_subject(TEST_SUBJECT_ALICE)
        .assert_has_scope(SCOPE_PROFILE_READ)
        .assert_has_scope(SCOPE_PROFILE_WRITE)
        .assert_token_use(TokenUse::Access)
        .assert_in_family(pair.family_id)
        .assert_expires_in(900);

    pair.refresh_token
        .expose_secret()
        .assert_valid_jwt()
        .assert_token_use(TokenUse::Refresh)
        .assert_in_family(pair.family_id)
        .assert_expires_in(7 * 24 * 3600);

    let id_token = pair.id_token.as_ref().expect("initial issue carries an id token");
    let id_claims = decode_claims(id_token.expose_secret());
    assert_eq!(id_claims.token_use, TokenUse::Id);
    assert_eq!(id_claims.nonce.as_deref(), Some("n-123"));

    // Only the id token carries the nonce
    pair.access_token.expose_secret().assert_lacks_claim("nonce");

    let claims = harness
        .lifecycle
        .validate_access(pair.access_token.expose_secret())
        .await?;
    assert_eq!(claims.sid, TEST_SESSION_1);
    Ok(())
}

#[tokio::test]
async fn test_issue_records_family_with_current_generation() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let pair = harness.lifecycle.issue(alice_login()).await?;

    let family = harness
        .families
        .get(pair.family_id)
        .await?
        .expect("family should be recorded");
    assert_eq!(family.current_generation, 0);
    assert!(!family.is_revoked());

    let generations = harness.families.generations(pair.family_id);
    assert_eq!(generations.len(), 1);
    assert_eq!(generations[0].status, GenerationStatus::Current);
    Ok(())
}

#[tokio::test]
async fn test_issue_with_per_request_ttl_override() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;

    let pair = harness
        .lifecycle
        .issue(alice_login().access_ttl(std::time::Duration::from_secs(60)))
        .await?;

    assert_eq!(pair.expires_in, 60);
    pair.access_token.expose_secret().assert_expires_in(60);
    Ok(())
}

#[tokio::test]
async fn test_issue_rejects_bad_requests() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;

    assert_error_code(
        harness.lifecycle.issue(IssueRequest::new("", TEST_SESSION_1)).await,
        "INVALID_REQUEST",
    );
    assert_error_code(
        harness.lifecycle.issue(IssueRequest::new(TEST_SUBJECT_ALICE, "")).await,
        "INVALID_REQUEST",
    );
    assert_error_code(
        harness
            .lifecycle
            .issue(alice_login().claim("exp", serde_json::json!(0)))
            .await,
        "INVALID_REQUEST",
    );
    assert_error_code(
        harness
            .lifecycle
            .issue(alice_login().access_ttl(std::time::Duration::ZERO))
            .await,
        "INVALID_REQUEST",
    );

    let subject_families = harness.families.families_for_subject(TEST_SUBJECT_ALICE).await?;
    assert!(subject_families.is_empty(), "Rejected requests must not create families");
    Ok(())
}

// ============================================================================
// Rotation and replay
// ============================================================================

/// The canonical flow: log in, rotate once, then replay the first refresh
/// token. The replay revokes the family, so even the newest access token
/// stops validating.
#[tokio::test]
async fn test_replay_after_rotation_revokes_whole_family() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let mut events = harness.lifecycle.subscribe();

    let gen0 = harness.lifecycle.issue(alice_login()).await?;
    let gen1 = harness
        .lifecycle
        .rotate(gen0.refresh_token.expose_secret())
        .await?;

    assert_eq!(gen1.family_id, gen0.family_id);
    assert_eq!(gen1.generation, 1);
    assert!(gen1.id_token.is_none(), "Rotation does not mint an id token");
    gen1.access_token
        .expose_secret()
        .assert_in_family(gen0.family_id)
        .assert_has_scope(SCOPE_PROFILE_READ);

    // Both access tokens still validate before the replay
    harness
        .lifecycle
        .validate_access(gen0.access_token.expose_secret())
        .await?;
    harness
        .lifecycle
        .validate_access(gen1.access_token.expose_secret())
        .await?;

    assert_error_code(
        harness
            .lifecycle
            .rotate(gen0.refresh_token.expose_secret())
            .await,
        "TOKEN_REPLAYED",
    );

    assert_error_code(
        harness
            .lifecycle
            .validate_access(gen1.access_token.expose_secret())
            .await,
        "TOKEN_REVOKED",
    );
    assert_error_code(
        harness
            .lifecycle
            .validate_access(gen0.access_token.expose_secret())
            .await,
        "TOKEN_REVOKED",
    );

    // The legitimate holder's newest refresh token is dead too
    assert_error_code(
        harness
            .lifecycle
            .rotate(gen1.refresh_token.expose_secret())
            .await,
        "TOKEN_REPLAYED",
    );

    match events.try_recv()? {
        SecurityEvent::ReplayDetected {
            family_id,
            presented_generation,
            current_generation,
            ..
        } => {
            assert_eq!(family_id, gen0.family_id);
            assert_eq!(presented_generation, 0);
            assert_eq!(current_generation, 1);
        }
        other => panic!("Expected ReplayDetected, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_rotation_chain_supersedes_each_generation() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;

    let mut pair = harness.lifecycle.issue(alice_login()).await?;
    let family_id = pair.family_id;
    for expected in 1..=5 {
        pair = harness
            .lifecycle
            .rotate(pair.refresh_token.expose_secret())
            .await?;
        assert_eq!(pair.generation, expected);
    }

    let generations = harness.families.generations(family_id);
    assert_eq!(generations.len(), 6);
    let current: Vec<_> = generations
        .iter()
        .filter(|g| g.status == GenerationStatus::Current)
        .map(|g| g.number)
        .collect();
    assert_eq!(current, vec![5], "Exactly one generation is current");
    Ok(())
}

#[tokio::test]
async fn test_rotate_rejects_non_refresh_tokens() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let pair = harness.lifecycle.issue(alice_login()).await?;

    assert_error_code(
        harness
            .lifecycle
            .rotate(pair.access_token.expose_secret())
            .await,
        "TOKEN_INVALID",
    );
    assert_error_code(harness.lifecycle.rotate("").await, "TOKEN_INVALID");
    assert_error_code(
        harness.lifecycle.rotate("not.a.token").await,
        "TOKEN_INVALID",
    );

    // Presenting garbage is not a replay: the family survives
    harness
        .lifecycle
        .rotate(pair.refresh_token.expose_secret())
        .await?;
    Ok(())
}

// ============================================================================
// Logout
// ============================================================================

#[tokio::test]
async fn test_revoke_family_kills_access_and_refresh() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let mut events = harness.lifecycle.subscribe();
    let pair = harness.lifecycle.issue(alice_login()).await?;

    harness.lifecycle.revoke_family(pair.family_id).await?;
    // Idempotent
    harness.lifecycle.revoke_family(pair.family_id).await?;

    assert_error_code(
        harness
            .lifecycle
            .validate_access(pair.access_token.expose_secret())
            .await,
        "TOKEN_REVOKED",
    );
    assert_error_code(
        harness
            .lifecycle
            .rotate(pair.refresh_token.expose_secret())
            .await,
        "TOKEN_REPLAYED",
    );

    assert_eq!(
        events.try_recv()?,
        SecurityEvent::FamilyRevoked {
            family_id: pair.family_id,
            reason: RevocationReason::Administrative,
            subject_hash: token_service::observability::hash_for_correlation(TEST_SUBJECT_ALICE),
        }
    );
    Ok(())
}

#[tokio::test]
async fn test_revoke_subject_only_touches_that_subject() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;

    let laptop = harness.lifecycle.issue(alice_login()).await?;
    let phone = harness
        .lifecycle
        .issue(IssueRequest::new(TEST_SUBJECT_ALICE, TEST_SESSION_2))
        .await?;
    let bob = harness
        .lifecycle
        .issue(IssueRequest::new(TEST_SUBJECT_BOB, TEST_SESSION_1))
        .await?;

    assert_eq!(harness.lifecycle.revoke_subject(TEST_SUBJECT_ALICE).await?, 2);
    assert_eq!(harness.lifecycle.revoke_subject(TEST_SUBJECT_ALICE).await?, 0);

    for pair in [&laptop, &phone] {
        assert_error_code(
            harness
                .lifecycle
                .validate_access(pair.access_token.expose_secret())
                .await,
            "TOKEN_REVOKED",
        );
    }
    harness
        .lifecycle
        .validate_access(bob.access_token.expose_secret())
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_login_after_revocation_starts_fresh_family() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let first = harness.lifecycle.issue(alice_login()).await?;
    harness.lifecycle.revoke_subject(TEST_SUBJECT_ALICE).await?;

    let second = harness.lifecycle.issue(alice_login()).await?;
    assert_ne!(second.family_id, first.family_id);

    harness
        .lifecycle
        .validate_access(second.access_token.expose_secret())
        .await?;
    harness
        .lifecycle
        .rotate(second.refresh_token.expose_secret())
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_revoke_token_is_single_session_logout() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let pair = harness.lifecycle.issue(alice_login()).await?;
    let access = pair.access_token.expose_secret();

    harness.lifecycle.revoke_token(access).await?;
    harness.lifecycle.revoke_token(access).await?;

    assert!(matches!(
        harness.lifecycle.validate_access(access).await,
        Err(TokenError::TokenRevoked)
    ));

    // The family itself is untouched
    let next = harness
        .lifecycle
        .rotate(pair.refresh_token.expose_secret())
        .await?;
    harness
        .lifecycle
        .validate_access(next.access_token.expose_secret())
        .await?;
    Ok(())
}
