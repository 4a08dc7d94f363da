//! Fault injection tests for the revocation store
//!
//! Validation fails closed while the store is unreachable, and an
//! interrupted revocation cascade completes when the caller retries.

use common::secret::ExposeSecret;
use std::sync::Arc;
use token_service::repositories::revocation::mock::FlakyRevocationStore;
use token_service::repositories::{FamilyStore, RevocationStore};
use token_service::services::IssueRequest;
use token_test_utils::{assert_error_code, TestLifecycle, TEST_SESSION_1, TEST_SUBJECT_ALICE};

fn harness_with_flaky_store() -> Result<(TestLifecycle, Arc<FlakyRevocationStore>), anyhow::Error> {
    let store = Arc::new(FlakyRevocationStore::new());
    let harness = TestLifecycle::builder()
        .revocation_store(Arc::clone(&store) as Arc<dyn RevocationStore>)
        .build()?;
    Ok((harness, store))
}

#[tokio::test]
async fn test_validation_fails_closed_when_store_down() -> Result<(), anyhow::Error> {
    let (harness, store) = harness_with_flaky_store()?;
    let pair = harness
        .lifecycle
        .issue(IssueRequest::new(TEST_SUBJECT_ALICE, TEST_SESSION_1))
        .await?;

    store.set_down(true);
    assert_error_code(
        harness
            .lifecycle
            .validate_access(pair.access_token.expose_secret())
            .await,
        "STORE_UNAVAILABLE",
    );

    store.set_down(false);
    harness
        .lifecycle
        .validate_access(pair.access_token.expose_secret())
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_interrupted_replay_cascade_completes_on_retry() -> Result<(), anyhow::Error> {
    let (harness, store) = harness_with_flaky_store()?;
    let gen0 = harness
        .lifecycle
        .issue(IssueRequest::new(TEST_SUBJECT_ALICE, TEST_SESSION_1))
        .await?;
    let gen1 = harness
        .lifecycle
        .rotate(gen0.refresh_token.expose_secret())
        .await?;

    store.set_down(true);
    assert_error_code(
        harness
            .lifecycle
            .rotate(gen0.refresh_token.expose_secret())
            .await,
        "STORE_UNAVAILABLE",
    );

    // The family is already revoked even though the cascade did not finish
    let family = harness.families.get(gen0.family_id).await?.expect("family");
    assert!(family.is_revoked());

    store.set_down(false);
    assert_error_code(
        harness
            .lifecycle
            .rotate(gen1.refresh_token.expose_secret())
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
    Ok(())
}

#[tokio::test]
async fn test_revoke_token_during_outage_can_be_retried() -> Result<(), anyhow::Error> {
    let (harness, store) = harness_with_flaky_store()?;
    let pair = harness
        .lifecycle
        .issue(IssueRequest::new(TEST_SUBJECT_ALICE, TEST_SESSION_1))
        .await?;
    let access = pair.access_token.expose_secret();

    store.set_down(true);
    assert_error_code(harness.lifecycle.revoke_token(access).await, "STORE_UNAVAILABLE");

    store.set_down(false);
    harness.lifecycle.revoke_token(access).await?;
    assert_error_code(harness.lifecycle.validate_access(access).await, "TOKEN_REVOKED");
    Ok(())
}
