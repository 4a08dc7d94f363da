//! Common utilities and types shared by the token lifecycle service and its test tooling.

#![warn(clippy::pedantic)]

/// Module for common data types
pub mod types;

/// Module for common configuration
pub mod config;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for JWT structural helpers (size limits, header parsing, iat checks)
pub mod jwt;
