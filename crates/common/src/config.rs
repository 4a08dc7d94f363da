//! Common configuration types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObservabilityConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub log_level: String,
    /// Enable JSON-formatted logs
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    /// Read `LOG_LEVEL` and `LOG_FORMAT` (`json` | anything else) from a variable map.
    #[must_use]
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        Self {
            log_level: vars
                .get("LOG_LEVEL")
                .cloned()
                .unwrap_or(defaults.log_level),
            json_logs: vars
                .get("LOG_FORMAT")
                .is_some_and(|v| v.eq_ignore_ascii_case("json")),
        }
    }
}
