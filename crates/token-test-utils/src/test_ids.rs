//! Fixed test values for deterministic tests
//!
//! Fixed subjects, sessions and key ids keep log output and assertion
//! messages stable across runs.

// Issuer settings
pub const TEST_ISSUER: &str = "https://auth.test.internal";
pub const TEST_AUDIENCE: &str = "api";

// Subjects
pub const TEST_SUBJECT_ALICE: &str = "u1";
pub const TEST_SUBJECT_BOB: &str = "u2";

// Sessions
pub const TEST_SESSION_1: &str = "s1";
pub const TEST_SESSION_2: &str = "s2";

// Signing key ids and the fixture seeds behind them
pub const TEST_KEY_ID_1: &str = "test-key-2025-01";
pub const TEST_KEY_ID_2: &str = "test-key-2025-02";
pub const TEST_KEY_SEED_1: u8 = 1;
pub const TEST_KEY_SEED_2: u8 = 2;

// Scopes
pub const SCOPE_PROFILE_READ: &str = "profile:read";
pub const SCOPE_PROFILE_WRITE: &str = "profile:write";
pub const SCOPE_ADMIN: &str = "admin";
