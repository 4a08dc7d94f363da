//! Integration tests for signing key rotation and key set caching
//!
//! Covers:
//! - tokens signed before a rotation validating through the grace window
//! - a separate validator picking up new keys over HTTP
//! - stale key sets served while the publisher is down, and only that long

use common::secret::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;
use token_service::services::key_cache::mock::CountingFetcher;
use token_service::services::{HttpKeySetFetcher, IssueRequest, KeyCacheConfig, KeySetFetcher};
use token_test_utils::{
    assert_error_code, TestClaimsBuilder, TestLifecycle, TestTokenServer, TokenAssertions,
    TEST_KEY_ID_1, TEST_SESSION_1, TEST_SUBJECT_ALICE,
};

#[tokio::test]
async fn test_tokens_signed_before_rotation_still_validate() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;

    let before = harness
        .lifecycle
        .issue(IssueRequest::new(TEST_SUBJECT_ALICE, TEST_SESSION_1))
        .await?;
    before
        .access_token
        .expose_secret()
        .assert_signed_by(TEST_KEY_ID_1);

    let new_kid = harness.lifecycle.rotate_signing_key().await?;
    assert_ne!(new_kid, TEST_KEY_ID_1);

    // Old key is retired but still published for the grace window
    harness
        .lifecycle
        .validate_access(before.access_token.expose_secret())
        .await?;

    let after = harness
        .lifecycle
        .rotate(before.refresh_token.expose_secret())
        .await?;
    after.access_token.expose_secret().assert_signed_by(&new_kid);
    harness
        .lifecycle
        .validate_access(after.access_token.expose_secret())
        .await?;

    let jwks = harness.lifecycle.published_jwks().await?;
    let kids: Vec<&str> = jwks.keys.iter().map(|k| k.kid.as_str()).collect();
    assert_eq!(kids, vec![new_kid.as_str(), TEST_KEY_ID_1]);
    Ok(())
}

#[tokio::test]
async fn test_rotated_out_key_disappears_after_grace() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::builder()
        .key_grace_window(Duration::from_secs(1))
        .build()?;

    let old_token = TestClaimsBuilder::new()
        .sign_with(harness.signer.as_ref())
        .await;
    harness.lifecycle.rotate_signing_key().await?;
    harness.lifecycle.validate_access(&old_token).await?;

    tokio::time::sleep(Duration::from_millis(1100)).await;
    harness.signer.prune_expired().await;
    harness.lifecycle.key_cache().refresh().await?;

    assert_eq!(harness.lifecycle.published_jwks().await?.keys.len(), 1);
    assert_error_code(
        harness.lifecycle.validate_access(&old_token).await,
        "TOKEN_INVALID",
    );
    Ok(())
}

/// A validator that only sees the publisher through its JWKS endpoint.
#[tokio::test]
async fn test_remote_validator_learns_new_key_on_kid_miss() -> Result<(), anyhow::Error> {
    let publisher = TestLifecycle::new()?;
    let server = TestTokenServer::spawn(Arc::clone(&publisher.lifecycle)).await?;

    let fetcher: Arc<dyn KeySetFetcher> = Arc::new(HttpKeySetFetcher::new(
        server.jwks_url(),
        Duration::from_secs(2),
    )?);
    let validator = TestLifecycle::builder()
        .key_set_fetcher(fetcher)
        .key_cache(KeyCacheConfig {
            miss_refresh_cooldown: Duration::ZERO,
            ..KeyCacheConfig::default()
        })
        .build()?;

    let first = publisher
        .lifecycle
        .issue(IssueRequest::new(TEST_SUBJECT_ALICE, TEST_SESSION_1))
        .await?;
    validator
        .lifecycle
        .validate_access(first.access_token.expose_secret())
        .await?;

    // The validator's cache still holds the single-key set
    publisher.lifecycle.rotate_signing_key().await?;
    let second = publisher
        .lifecycle
        .rotate(first.refresh_token.expose_secret())
        .await?;

    validator
        .lifecycle
        .validate_access(second.access_token.expose_secret())
        .await?;
    let cached = validator
        .lifecycle
        .key_cache()
        .current_set()
        .expect("cache should be warm");
    assert_eq!(cached.keys().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_stale_key_set_served_within_grace() -> Result<(), anyhow::Error> {
    let source = TestLifecycle::new()?;
    let fetcher = Arc::new(CountingFetcher::serving(source.signer.publisher().jwks()));

    let harness = TestLifecycle::builder()
        .key_set_fetcher(Arc::clone(&fetcher) as Arc<dyn KeySetFetcher>)
        .key_cache(KeyCacheConfig {
            ttl: Duration::from_millis(200),
            stale_grace: Duration::from_secs(60),
            miss_refresh_cooldown: Duration::ZERO,
        })
        .build()?;

    let token = TestClaimsBuilder::new()
        .sign_with(harness.signer.as_ref())
        .await;
    harness.lifecycle.validate_access(&token).await?;
    assert_eq!(fetcher.call_count(), 1);

    fetcher.set_failing();
    tokio::time::sleep(Duration::from_millis(300)).await;

    harness.lifecycle.validate_access(&token).await?;
    assert_eq!(fetcher.call_count(), 2, "An expired entry should trigger a refresh");
    Ok(())
}

#[tokio::test]
async fn test_key_set_unavailable_past_stale_grace() -> Result<(), anyhow::Error> {
    let source = TestLifecycle::new()?;
    let fetcher = Arc::new(CountingFetcher::serving(source.signer.publisher().jwks()));

    let harness = TestLifecycle::builder()
        .key_set_fetcher(Arc::clone(&fetcher) as Arc<dyn KeySetFetcher>)
        .key_cache(KeyCacheConfig {
            ttl: Duration::from_millis(100),
            stale_grace: Duration::from_millis(100),
            miss_refresh_cooldown: Duration::ZERO,
        })
        .build()?;

    let token = TestClaimsBuilder::new()
        .sign_with(harness.signer.as_ref())
        .await;
    harness.lifecycle.validate_access(&token).await?;

    fetcher.set_failing();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_error_code(
        harness.lifecycle.validate_access(&token).await,
        "KEY_SET_UNAVAILABLE",
    );

    // Recovery needs no restart
    fetcher.set_jwks(source.signer.publisher().jwks());
    harness.lifecycle.validate_access(&token).await?;
    Ok(())
}

#[tokio::test]
async fn test_cold_cache_with_unreachable_publisher() -> Result<(), anyhow::Error> {
    let fetcher: Arc<dyn KeySetFetcher> = Arc::new(CountingFetcher::failing());
    let harness = TestLifecycle::builder().key_set_fetcher(fetcher).build()?;

    let token = TestClaimsBuilder::new()
        .sign_with(harness.signer.as_ref())
        .await;
    assert_error_code(
        harness.lifecycle.validate_access(&token).await,
        "KEY_SET_UNAVAILABLE",
    );
    Ok(())
}
