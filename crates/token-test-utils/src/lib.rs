//! # Token Test Utilities
//!
//! Shared test utilities for the token lifecycle service.
//!
//! This crate provides:
//! - Deterministic crypto fixtures (seeded Ed25519 keys, signers and DPoP
//!   client keys)
//! - Test data builders (`TestClaimsBuilder`)
//! - Harnesses (`TestLifecycle` in-process, `TestTokenServer` over HTTP)
//! - Fixed test values (subjects, sessions, key ids)
//! - Custom assertions (`TokenAssertions` trait, `assert_error_code`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use token_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = TestLifecycle::new().unwrap();
//!     let pair = harness
//!         .lifecycle
//!         .issue(IssueRequest::new(TEST_SUBJECT_ALICE, TEST_SESSION_1).scopes([SCOPE_PROFILE_READ]))
//!         .await
//!         .unwrap();
//!
//!     pair.access_token
//!         .expose_secret()
//!         .assert_valid_jwt()
//!         .assert_has_scope(SCOPE_PROFILE_READ)
//!         .assert_signed_by(TEST_KEY_ID_1);
//! }
//! ```

pub mod assertions;
pub mod crypto_fixtures;
pub mod harness;
pub mod test_ids;
pub mod token_builders;

// Re-export commonly used items
pub use assertions::*;
pub use crypto_fixtures::*;
pub use harness::*;
pub use test_ids::*;
pub use token_builders::*;
