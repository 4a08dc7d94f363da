//! End-to-end tests for sender-constrained (DPoP) token families
//!
//! A family bound at login can only be refreshed, and its access tokens only
//! used, by whoever holds the client key. A stolen bound refresh token is
//! useless on its own and, unlike a bearer token, cannot be used to force a
//! family revocation.
//!
//! Tests follow the convention: `test_<feature>_<scenario>_<expected_result>`

use common::secret::ExposeSecret;
use token_service::models::TokenPair;
use token_service::repositories::FamilyStore;
use token_service::services::{DpopRequest, IssueRequest, SecurityEvent};
use token_test_utils::{
    assert_error_code, decode_claims, TestLifecycle, TestProofKey, TokenAssertions,
    SCOPE_PROFILE_READ, TEST_SESSION_1, TEST_SUBJECT_ALICE,
};

const TOKEN_URI: &str = "https://auth.test.internal/token";
const RESOURCE_URI: &str = "https://api.test.internal/profile";

async fn bound_login(
    harness: &TestLifecycle,
    client: &TestProofKey,
) -> Result<TokenPair, anyhow::Error> {
    let proof = client.proof("POST", TOKEN_URI);
    let binding = harness
        .lifecycle
        .verify_dpop_proof(&DpopRequest::new(&proof, "POST", TOKEN_URI))
        .await?;
    let pair = harness
        .lifecycle
        .issue(
            IssueRequest::new(TEST_SUBJECT_ALICE, TEST_SESSION_1)
                .scopes([SCOPE_PROFILE_READ])
                .bound_to(binding),
        )
        .await?;
    Ok(pair)
}

#[tokio::test]
async fn test_dpop_login_binds_family_and_access_token() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let client = TestProofKey::from_seed(9)?;

    let pair = bound_login(&harness, &client).await?;
    assert_eq!(pair.token_type, "DPoP");

    let access = decode_claims(pair.access_token.expose_secret());
    assert_eq!(access.bound_key(), Some(client.jkt().as_str()));
    pair.refresh_token.expose_secret().assert_lacks_claim("cnf");

    let family = harness
        .families
        .get(pair.family_id)
        .await?
        .expect("family recorded");
    assert_eq!(family.dpop_jkt.as_deref(), Some(client.jkt().as_str()));
    Ok(())
}

#[tokio::test]
async fn test_dpop_bound_refresh_rotates_with_proof() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let client = TestProofKey::from_seed(9)?;
    let gen0 = bound_login(&harness, &client).await?;

    let proof = client.proof("POST", TOKEN_URI);
    let gen1 = harness
        .lifecycle
        .rotate_with_proof(
            gen0.refresh_token.expose_secret(),
            &DpopRequest::new(&proof, "POST", TOKEN_URI),
        )
        .await?;

    assert_eq!(gen1.generation, 1);
    assert_eq!(gen1.token_type, "DPoP");
    let access = decode_claims(gen1.access_token.expose_secret());
    assert_eq!(access.bound_key(), Some(client.jkt().as_str()));
    Ok(())
}

/// The thief holds the refresh token but not the client key: the rotation
/// is refused before replay detection, so the family stays usable.
#[tokio::test]
async fn test_dpop_stolen_refresh_without_key_is_refused_without_cascade(
) -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let mut events = harness.lifecycle.subscribe();
    let client = TestProofKey::from_seed(9)?;
    let thief = TestProofKey::from_seed(10)?;
    let gen0 = bound_login(&harness, &client).await?;

    assert_error_code(
        harness
            .lifecycle
            .rotate(gen0.refresh_token.expose_secret())
            .await,
        "DPOP_PROOF_INVALID",
    );
    let thief_proof = thief.proof("POST", TOKEN_URI);
    assert_error_code(
        harness
            .lifecycle
            .rotate_with_proof(
                gen0.refresh_token.expose_secret(),
                &DpopRequest::new(&thief_proof, "POST", TOKEN_URI),
            )
            .await,
        "DPOP_PROOF_INVALID",
    );

    assert!(events.try_recv().is_err(), "No security event expected");
    harness
        .lifecycle
        .validate_access_with_proof(
            gen0.access_token.expose_secret(),
            &DpopRequest::new(
                &client.proof_for_token("GET", RESOURCE_URI, gen0.access_token.expose_secret()),
                "GET",
                RESOURCE_URI,
            ),
        )
        .await?;

    let proof = client.proof("POST", TOKEN_URI);
    harness
        .lifecycle
        .rotate_with_proof(
            gen0.refresh_token.expose_secret(),
            &DpopRequest::new(&proof, "POST", TOKEN_URI),
        )
        .await?;
    Ok(())
}

/// Holding the key does not exempt a superseded refresh token from replay
/// detection.
#[tokio::test]
async fn test_dpop_replay_with_valid_proof_still_revokes_family() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let mut events = harness.lifecycle.subscribe();
    let client = TestProofKey::from_seed(9)?;
    let gen0 = bound_login(&harness, &client).await?;

    let proof = client.proof("POST", TOKEN_URI);
    harness
        .lifecycle
        .rotate_with_proof(
            gen0.refresh_token.expose_secret(),
            &DpopRequest::new(&proof, "POST", TOKEN_URI),
        )
        .await?;

    let proof = client.proof("POST", TOKEN_URI);
    assert_error_code(
        harness
            .lifecycle
            .rotate_with_proof(
                gen0.refresh_token.expose_secret(),
                &DpopRequest::new(&proof, "POST", TOKEN_URI),
            )
            .await,
        "TOKEN_REPLAYED",
    );

    match events.try_recv()? {
        SecurityEvent::ReplayDetected { family_id, .. } => assert_eq!(family_id, gen0.family_id),
        other => panic!("Expected ReplayDetected, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_dpop_proof_cannot_be_reused_across_requests() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let client = TestProofKey::from_seed(9)?;
    let gen0 = bound_login(&harness, &client).await?;

    let proof = client.proof("POST", TOKEN_URI);
    let request = DpopRequest::new(&proof, "POST", TOKEN_URI);
    let gen1 = harness
        .lifecycle
        .rotate_with_proof(gen0.refresh_token.expose_secret(), &request)
        .await?;

    assert_error_code(
        harness
            .lifecycle
            .rotate_with_proof(gen1.refresh_token.expose_secret(), &request)
            .await,
        "DPOP_PROOF_REPLAYED",
    );
    assert_eq!(harness.proofs.len(), 2, "login and one rotation proof recorded");
    Ok(())
}

#[tokio::test]
async fn test_dpop_bound_access_token_requires_proof_at_resource() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let client = TestProofKey::from_seed(9)?;
    let pair = bound_login(&harness, &client).await?;
    let token = pair.access_token.expose_secret();

    assert_error_code(
        harness.lifecycle.validate_access(token).await,
        "DPOP_PROOF_INVALID",
    );

    // A proof made for the token endpoint carries no token hash
    let wrong_target = client.proof("GET", RESOURCE_URI);
    assert_error_code(
        harness
            .lifecycle
            .validate_access_with_proof(
                token,
                &DpopRequest::new(&wrong_target, "GET", RESOURCE_URI),
            )
            .await,
        "DPOP_PROOF_INVALID",
    );

    let proof = client.proof_for_token("GET", RESOURCE_URI, token);
    let claims = harness
        .lifecycle
        .validate_access_with_proof(token, &DpopRequest::new(&proof, "GET", RESOURCE_URI))
        .await?;
    assert_eq!(claims.sub, TEST_SUBJECT_ALICE);
    Ok(())
}

#[tokio::test]
async fn test_dpop_unbound_family_stays_bearer() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let client = TestProofKey::from_seed(9)?;
    let pair = harness
        .lifecycle
        .issue(IssueRequest::new(TEST_SUBJECT_ALICE, TEST_SESSION_1))
        .await?;
    assert_eq!(pair.token_type, "Bearer");
    pair.access_token.expose_secret().assert_lacks_claim("cnf");

    // A proof presented on refresh must verify, but does not bind the family
    let proof = client.proof("POST", TOKEN_URI);
    let gen1 = harness
        .lifecycle
        .rotate_with_proof(
            pair.refresh_token.expose_secret(),
            &DpopRequest::new(&proof, "POST", TOKEN_URI),
        )
        .await?;
    assert_eq!(gen1.token_type, "Bearer");
    harness
        .lifecycle
        .validate_access(gen1.access_token.expose_secret())
        .await?;
    Ok(())
}
