//! Chaos tests for rotation and key rotation under concurrency
//!
//! These tests validate that:
//! - a refresh token is redeemed at most once, however many callers race
//! - rotations in different families never interfere with each other
//! - validation keeps succeeding while signing keys rotate underneath it

use common::secret::ExposeSecret;
use futures::future::join_all;
use std::sync::Arc;
use token_service::errors::TokenError;
use token_service::models::GenerationStatus;
use token_service::services::IssueRequest;
use token_test_utils::{TestLifecycle, TEST_SESSION_1, TEST_SUBJECT_ALICE};

const RACERS: usize = 16;

/// Everyone presents the same refresh token at once. One wins; the rest are
/// replays, and the replays take the winner down with the family.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_rotations_have_single_winner() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let pair = harness
        .lifecycle
        .issue(IssueRequest::new(TEST_SUBJECT_ALICE, TEST_SESSION_1))
        .await?;
    let refresh = pair.refresh_token.expose_secret().to_string();

    let handles = (0..RACERS).map(|_| {
        let lifecycle = Arc::clone(&harness.lifecycle);
        let refresh = refresh.clone();
        tokio::spawn(async move { lifecycle.rotate(&refresh).await })
    });
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .collect::<Result<_, _>>()?;

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1, "Exactly one rotation may succeed");
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, TokenError::TokenReplayed)));

    let winner_access = winners[0].access_token.expose_secret();
    assert!(matches!(
        harness.lifecycle.validate_access(winner_access).await,
        Err(TokenError::TokenRevoked)
    ));

    let generations = harness.families.generations(pair.family_id);
    assert_eq!(generations.len(), 2, "Losers must not record generations");
    assert!(generations
        .iter()
        .all(|g| g.status == GenerationStatus::Revoked));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_families_rotate_in_parallel() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;

    let mut refresh_tokens = Vec::with_capacity(RACERS);
    for i in 0..RACERS {
        let pair = harness
            .lifecycle
            .issue(IssueRequest::new(format!("user-{i}"), format!("session-{i}")))
            .await?;
        refresh_tokens.push(pair.refresh_token.expose_secret().to_string());
    }

    let handles = refresh_tokens.into_iter().map(|refresh| {
        let lifecycle = Arc::clone(&harness.lifecycle);
        tokio::spawn(async move {
            let mut current = refresh;
            for _ in 0..5 {
                let next = lifecycle.rotate(&current).await?;
                current = next.refresh_token.expose_secret().to_string();
            }
            Ok::<_, TokenError>(current)
        })
    });

    for result in join_all(handles).await {
        result??;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_validation_during_key_rotation() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let pair = harness
        .lifecycle
        .issue(IssueRequest::new(TEST_SUBJECT_ALICE, TEST_SESSION_1))
        .await?;
    let access = pair.access_token.expose_secret().to_string();

    let validators = (0..8).map(|_| {
        let lifecycle = Arc::clone(&harness.lifecycle);
        let access = access.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                lifecycle.validate_access(&access).await?;
                tokio::task::yield_now().await;
            }
            Ok::<_, TokenError>(())
        })
    });
    let validators: Vec<_> = validators.collect();

    for _ in 0..3 {
        harness.lifecycle.rotate_signing_key().await?;
        tokio::task::yield_now().await;
    }

    for result in join_all(validators).await {
        result??;
    }
    Ok(())
}
