//! Token Lifecycle Service Library
//!
//! Issues signed access/refresh/id tokens, rotates refresh tokens with
//! replay detection across a token family, publishes and caches the
//! verification key set, and validates tokens. Families may be bound to a
//! client key and then demand a proof of possession (RFC 9449).
//!
//! # Modules
//!
//! - `config` - Service configuration
//! - `crypto` - Key generation, refresh-token hashing, signing backends,
//!   proof-of-possession JWTs
//! - `errors` - Error taxonomy
//! - `handlers` - HTTP handlers (JWKS, health, metrics)
//! - `models` - Claims, families and key sets
//! - `observability` - Metrics and log correlation helpers
//! - `repositories` - Family, revocation and proof replay stores (in-memory, Redis)
//! - `routes` - HTTP router
//! - `services` - Issuer, family tracker, validator, proof verifier, key
//!   cache and publisher

pub mod config;
pub mod crypto;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod observability;
pub mod repositories;
pub mod routes;
pub mod services;
