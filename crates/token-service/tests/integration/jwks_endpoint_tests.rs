//! Integration tests for the HTTP surface: JWKS, health, readiness, metrics

use reqwest::StatusCode;
use std::sync::Arc;
use token_service::models::Jwks;
use token_test_utils::{
    test_verification_key, TestLifecycle, TestTokenServer, TEST_KEY_ID_1, TEST_KEY_SEED_1,
};

#[tokio::test]
async fn test_jwks_endpoint_publishes_active_key() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let server = TestTokenServer::spawn(Arc::clone(&harness.lifecycle)).await?;

    let response = reqwest::get(server.jwks_url()).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("cache-control")
            .and_then(|v| v.to_str().ok()),
        Some("public, max-age=300")
    );

    let jwks: Jwks = response.json().await?;
    assert_eq!(jwks.keys.len(), 1);

    let key = &jwks.keys[0];
    assert_eq!(key.kid, TEST_KEY_ID_1);
    assert_eq!(key.kty, "OKP");
    assert_eq!(key.crv, "Ed25519");
    assert_eq!(key.alg, "EdDSA");
    assert_eq!(key.use_, "sig");
    assert_eq!(
        *key,
        test_verification_key(TEST_KEY_SEED_1, TEST_KEY_ID_1)?.to_jwk()
    );
    Ok(())
}

#[tokio::test]
async fn test_jwks_endpoint_reflects_rotation() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let server = TestTokenServer::spawn(Arc::clone(&harness.lifecycle)).await?;

    let new_kid = harness.lifecycle.rotate_signing_key().await?;

    let jwks: Jwks = reqwest::get(server.jwks_url()).await?.json().await?;
    let kids: Vec<String> = jwks.keys.into_iter().map(|k| k.kid).collect();
    assert_eq!(kids, vec![new_kid, TEST_KEY_ID_1.to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_health_and_readiness() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let server = TestTokenServer::spawn(Arc::clone(&harness.lifecycle)).await?;

    let health = reqwest::get(format!("{}/health", server.url())).await?;
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(health.text().await?, "OK");

    let ready = reqwest::get(format!("{}/ready", server.url())).await?;
    assert_eq!(ready.status(), StatusCode::OK);
    let body: serde_json::Value = ready.json().await?;
    assert_eq!(body["status"], "ready");
    Ok(())
}

#[tokio::test]
async fn test_metrics_endpoint_serves_text() -> Result<(), anyhow::Error> {
    let harness = TestLifecycle::new()?;
    let server = TestTokenServer::spawn(Arc::clone(&harness.lifecycle)).await?;

    let response = reqwest::get(format!("{}/metrics", server.url())).await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}
