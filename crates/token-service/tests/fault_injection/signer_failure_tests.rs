//! Fault injection tests for the signing source
//!
//! A failing or stalled signer must never leave a half-built family or a
//! half-advanced rotation behind: the caller can simply retry.

use common::secret::ExposeSecret;
use std::sync::Arc;
use std::time::{Duration, Instant};
use token_service::crypto::signer::mock::MockSigner;
use token_service::crypto::signer::{FallbackSigner, SigningKeySource};
use token_service::repositories::FamilyStore;
use token_service::services::{IssueRequest, KeySetFetcher, MergedKeySetFetcher};
use token_test_utils::{
    assert_error_code, test_local_signer, TestLifecycle, TokenAssertions, TEST_KEY_ID_1,
    TEST_KEY_ID_2, TEST_KEY_SEED_1, TEST_KEY_SEED_2, TEST_SESSION_1, TEST_SUBJECT_ALICE,
};

/// A mock wrapping the same deterministic key the harness publishes.
fn mock_signer() -> Result<Arc<MockSigner>, anyhow::Error> {
    let inner = test_local_signer(TEST_KEY_SEED_1, TEST_KEY_ID_1, Duration::from_secs(3600))?;
    Ok(Arc::new(MockSigner::wrapping(inner)))
}

#[tokio::test]
async fn test_issue_during_signer_outage_records_nothing() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::builder()
        .signing_source(Arc::new(MockSigner::unavailable()))
        .build()?;

    assert_error_code(
        harness
            .lifecycle
            .issue(IssueRequest::new(TEST_SUBJECT_ALICE, TEST_SESSION_1))
            .await,
        "SIGNING_UNAVAILABLE",
    );
    assert!(harness
        .families
        .families_for_subject(TEST_SUBJECT_ALICE)
        .await?
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn test_rotate_during_signer_outage_is_retryable() -> Result<(), anyhow::Error> {
    let signer = mock_signer()?;
    let harness = TestLifecycle::builder()
        .signing_source(Arc::clone(&signer) as Arc<dyn SigningKeySource>)
        .build()?;

    let pair = harness
        .lifecycle
        .issue(IssueRequest::new(TEST_SUBJECT_ALICE, TEST_SESSION_1))
        .await?;

    signer.set_failing(true);
    let result = harness
        .lifecycle
        .rotate(pair.refresh_token.expose_secret())
        .await;
    assert!(result.as_ref().is_err_and(|e| e.is_retryable()));
    assert_error_code(result, "SIGNING_UNAVAILABLE");

    // Nothing advanced, so the same refresh token is still current
    let family = harness.families.get(pair.family_id).await?.expect("family");
    assert_eq!(family.current_generation, 0);

    signer.set_failing(false);
    let next = harness
        .lifecycle
        .rotate(pair.refresh_token.expose_secret())
        .await?;
    assert_eq!(next.generation, 1);
    Ok(())
}

#[tokio::test]
async fn test_stalled_signer_times_out() -> Result<(), anyhow::Error> {
    let inner = test_local_signer(TEST_KEY_SEED_1, TEST_KEY_ID_1, Duration::from_secs(3600))?;
    let harness = TestLifecycle::builder()
        .signing_source(Arc::new(
            MockSigner::wrapping(inner).with_delay(Duration::from_secs(5)),
        ))
        .signing_timeout(Duration::from_millis(100))
        .build()?;

    let started = Instant::now();
    assert_error_code(
        harness
            .lifecycle
            .issue(IssueRequest::new(TEST_SUBJECT_ALICE, TEST_SESSION_1))
            .await,
        "SIGNING_UNAVAILABLE",
    );
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "Issue should give up at the signing timeout"
    );
    Ok(())
}

/// With a fallback configured, an outage of the primary signer switches
/// signing to the fallback key; tokens from both keys validate because the
/// cache is fed the merged key set.
#[tokio::test]
async fn test_signer_outage_with_fallback_keeps_issuing() -> Result<(), anyhow::Error> {
    let primary = mock_signer()?;
    let fallback = test_local_signer(TEST_KEY_SEED_2, TEST_KEY_ID_2, Duration::from_secs(3600))?;
    let primary_keys = test_local_signer(TEST_KEY_SEED_1, TEST_KEY_ID_1, Duration::from_secs(3600))?;
    let fetcher = MergedKeySetFetcher::new(
        primary_keys.publisher() as Arc<dyn KeySetFetcher>,
        fallback.publisher() as Arc<dyn KeySetFetcher>,
    );
    let harness = TestLifecycle::builder()
        .signing_source(Arc::new(FallbackSigner::new(
            Arc::clone(&primary) as Arc<dyn SigningKeySource>,
            Arc::clone(&fallback),
            Duration::from_millis(100),
        )))
        .key_set_fetcher(Arc::new(fetcher))
        .build()?;

    let gen0 = harness
        .lifecycle
        .issue(IssueRequest::new(TEST_SUBJECT_ALICE, TEST_SESSION_1))
        .await?;
    gen0.access_token.expose_secret().assert_signed_by(TEST_KEY_ID_1);

    primary.set_failing(true);
    let gen1 = harness
        .lifecycle
        .rotate(gen0.refresh_token.expose_secret())
        .await?;
    gen1.access_token.expose_secret().assert_signed_by(TEST_KEY_ID_2);
    for token in [&gen0.access_token, &gen1.access_token] {
        harness.lifecycle.validate_access(token.expose_secret()).await?;
    }

    // Back on the primary once it recovers and the cooldown has passed
    primary.set_failing(false);
    tokio::time::sleep(Duration::from_millis(150)).await;
    let gen2 = harness
        .lifecycle
        .rotate(gen1.refresh_token.expose_secret())
        .await?;
    gen2.access_token.expose_secret().assert_signed_by(TEST_KEY_ID_1);
    Ok(())
}
