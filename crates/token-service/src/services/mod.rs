//! Token lifecycle services.
//!
//! - [`issuer`] - mints a new family and its first generation
//! - [`family_tracker`] - refresh rotation, replay detection, revocation
//! - [`validator`] - signature, expiry, claim and revocation checks
//! - [`dpop`] - proof-of-possession checks for sender-constrained tokens
//! - [`key_cache`] - verification keys with single-flight refresh
//! - [`key_publisher`] - the authoritative published key set
//! - [`lifecycle`] - wiring of all of the above

pub mod dpop;
pub mod family_tracker;
pub mod issuer;
pub mod key_cache;
pub mod key_publisher;
pub mod lifecycle;
pub mod validator;

pub use dpop::{DpopBinding, DpopRequest, DpopSettings, ProofVerifier};
pub use family_tracker::{FamilyTracker, RevocationReason, SecurityEvent};
pub use issuer::{IssueRequest, IssuerSettings, TokenIssuer};
pub use key_cache::{
    HttpKeySetFetcher, KeyCacheConfig, KeyMaterialCache, KeySetFetcher, MergedKeySetFetcher,
};
pub use key_publisher::KeyPublisher;
pub use lifecycle::{LifecycleParts, MemoryStores, TokenLifecycle};
pub use validator::TokenValidator;
