//! Test harnesses for end-to-end lifecycle tests
//!
//! - [`TestLifecycle`]: a fully wired [`TokenLifecycle`] over in-memory stores
//!   and a deterministic local signer, with the collaborators exposed for
//!   inspection
//! - [`TestTokenServer`]: the real HTTP router on a random local port, for
//!   fetching the published key set over HTTP

use crate::crypto_fixtures::test_local_signer;
use crate::test_ids::{TEST_AUDIENCE, TEST_ISSUER, TEST_KEY_ID_1, TEST_KEY_SEED_1};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use token_service::crypto::signer::{LocalSigner, SigningKeySource};
use token_service::repositories::{
    FamilyStore, InMemoryFamilyStore, InMemoryProofReplayStore, InMemoryRevocationStore,
    ProofReplayStore, RevocationStore,
};
use token_service::routes::{self, AppState};
use token_service::services::{
    DpopSettings, IssuerSettings, KeyCacheConfig, KeySetFetcher, LifecycleParts, MemoryStores,
    TokenLifecycle,
};

/// Builder for [`TestLifecycle`].
///
/// # Example
/// ```rust,ignore
/// let harness = TestLifecycle::builder()
///     .access_ttl(Duration::from_secs(900))
///     .refresh_ttl(Duration::from_secs(7 * 24 * 3600))
///     .build()?;
/// let pair = harness.lifecycle.issue(IssueRequest::new("u1", "s1")).await?;
/// ```
pub struct TestLifecycleBuilder {
    access_ttl: Duration,
    refresh_ttl: Duration,
    key_grace_window: Duration,
    key_cache: KeyCacheConfig,
    clock_skew: Duration,
    signing_timeout: Duration,
    dpop: DpopSettings,
    signer_override: Option<Arc<dyn SigningKeySource>>,
    fetcher_override: Option<Arc<dyn KeySetFetcher>>,
    revocations_override: Option<Arc<dyn RevocationStore>>,
}

impl TestLifecycleBuilder {
    pub fn access_ttl(mut self, ttl: Duration) -> Self {
        self.access_ttl = ttl;
        self
    }

    pub fn refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    pub fn key_grace_window(mut self, grace: Duration) -> Self {
        self.key_grace_window = grace;
        self
    }

    pub fn key_cache(mut self, config: KeyCacheConfig) -> Self {
        self.key_cache = config;
        self
    }

    pub fn signing_timeout(mut self, timeout: Duration) -> Self {
        self.signing_timeout = timeout;
        self
    }

    pub fn dpop_settings(mut self, settings: DpopSettings) -> Self {
        self.dpop = settings;
        self
    }

    /// Sign through `source` instead of the harness's local signer.
    pub fn signing_source(mut self, source: Arc<dyn SigningKeySource>) -> Self {
        self.signer_override = Some(source);
        self
    }

    /// Feed the key cache from `fetcher` instead of the local publisher.
    pub fn key_set_fetcher(mut self, fetcher: Arc<dyn KeySetFetcher>) -> Self {
        self.fetcher_override = Some(fetcher);
        self
    }

    /// Use `store` for revocations instead of the harness's in-memory store.
    pub fn revocation_store(mut self, store: Arc<dyn RevocationStore>) -> Self {
        self.revocations_override = Some(store);
        self
    }

    pub fn build(self) -> Result<TestLifecycle, anyhow::Error> {
        let signer = test_local_signer(TEST_KEY_SEED_1, TEST_KEY_ID_1, self.key_grace_window)?;
        let families = Arc::new(InMemoryFamilyStore::new());
        let revocations = Arc::new(InMemoryRevocationStore::new());
        let proofs = Arc::new(InMemoryProofReplayStore::new());

        let source = self
            .signer_override
            .unwrap_or_else(|| Arc::clone(&signer) as Arc<dyn SigningKeySource>);
        let fetcher = self
            .fetcher_override
            .unwrap_or_else(|| signer.publisher() as Arc<dyn KeySetFetcher>);
        let revocation_store = self
            .revocations_override
            .unwrap_or_else(|| Arc::clone(&revocations) as Arc<dyn RevocationStore>);

        let lifecycle = TokenLifecycle::assemble(LifecycleParts {
            signer: source,
            local_signer: Some(Arc::clone(&signer)),
            fetcher,
            families: Arc::clone(&families) as Arc<dyn FamilyStore>,
            revocations: revocation_store,
            proof_replay: Arc::clone(&proofs) as Arc<dyn ProofReplayStore>,
            settings: IssuerSettings {
                issuer: TEST_ISSUER.to_string(),
                audience: TEST_AUDIENCE.to_string(),
                access_ttl: self.access_ttl,
                refresh_ttl: self.refresh_ttl,
                signing_timeout: self.signing_timeout,
            },
            key_cache: self.key_cache,
            clock_skew: self.clock_skew,
            dpop: self.dpop,
        })
        .with_memory_stores(MemoryStores {
            families: Arc::clone(&families),
            revocations: Arc::clone(&revocations),
            proofs: Arc::clone(&proofs),
        });

        Ok(TestLifecycle {
            lifecycle: Arc::new(lifecycle),
            signer,
            families,
            revocations,
            proofs,
        })
    }
}

/// A wired lifecycle plus handles on its collaborators.
pub struct TestLifecycle {
    pub lifecycle: Arc<TokenLifecycle>,
    pub signer: Arc<LocalSigner>,
    pub families: Arc<InMemoryFamilyStore>,
    pub revocations: Arc<InMemoryRevocationStore>,
    /// Ledger of spent proof-of-possession `jti`s.
    pub proofs: Arc<InMemoryProofReplayStore>,
}

impl TestLifecycle {
    /// Defaults: 15 minute access tokens, 7 day refresh tokens, 1 day key grace.
    pub fn builder() -> TestLifecycleBuilder {
        TestLifecycleBuilder {
            access_ttl: Duration::from_secs(900),
            refresh_ttl: Duration::from_secs(7 * 24 * 3600),
            key_grace_window: Duration::from_secs(24 * 3600),
            key_cache: KeyCacheConfig::default(),
            clock_skew: Duration::from_secs(300),
            signing_timeout: Duration::from_secs(2),
            dpop: DpopSettings::default(),
            signer_override: None,
            fetcher_override: None,
            revocations_override: None,
        }
    }

    pub fn new() -> Result<Self, anyhow::Error> {
        Self::builder().build()
    }
}

/// Test harness serving the real router on `127.0.0.1:0`.
///
/// # Example
/// ```rust,ignore
/// let server = TestTokenServer::spawn(harness.lifecycle.clone()).await?;
/// let jwks_url = server.jwks_url();
/// ```
pub struct TestTokenServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl TestTokenServer {
    pub async fn spawn(lifecycle: Arc<TokenLifecycle>) -> Result<Self, anyhow::Error> {
        // A standalone recorder; installing a global one would clash across tests
        let metrics_handle = PrometheusBuilder::new().build_recorder().handle();
        let app = routes::build_routes(Arc::new(AppState { lifecycle }), metrics_handle);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            handle,
        })
    }

    /// Get the base URL of the test server
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn jwks_url(&self) -> String {
        format!("{}/.well-known/jwks.json", self.url())
    }
}

impl Drop for TestTokenServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
