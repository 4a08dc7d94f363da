//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used for every bearer credential this
//! workspace handles: access tokens, refresh tokens, id tokens, and the
//! private signing material held by the local signer.
//!
//! `SecretString` and `SecretBox<T>` implement `Debug` with redaction, so a
//! struct that derives `Debug` over them is safe to log through `{:?}` or
//! `tracing`. Values are zeroized on drop.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct RefreshExchange {
//!     client: String,
//!     refresh_token: SecretString,
//! }
//!
//! let req = RefreshExchange {
//!     client: "web".to_string(),
//!     refresh_token: SecretString::from("eyJhbGciOi..."),
//! };
//!
//! assert!(!format!("{req:?}").contains("eyJhbGciOi"));
//! let raw: &str = req.refresh_token.expose_secret();
//! assert!(raw.starts_with("eyJ"));
//! ```
//!
//! Use `SecretString` for serialized tokens and `SecretBox<[u8]>` (or
//! `SecretBox<Vec<u8>>`) for binary key material.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
