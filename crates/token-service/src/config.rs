use common::jwt::{DEFAULT_CLOCK_SKEW, MAX_CLOCK_SKEW};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8083";
pub const DEFAULT_AUDIENCE: &str = "api";
pub const DEFAULT_ACCESS_TOKEN_TTL_SECONDS: u64 = 900;
pub const DEFAULT_REFRESH_TOKEN_TTL_SECONDS: u64 = 604_800;
pub const DEFAULT_SIGNING_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_KEY_CACHE_TTL_SECONDS: u64 = 300;
pub const DEFAULT_KEY_CACHE_STALE_GRACE_SECONDS: u64 = 3_600;
pub const DEFAULT_KEY_REFRESH_INTERVAL_SECONDS: u64 = 240;
pub const DEFAULT_KEY_GRACE_WINDOW_SECONDS: u64 = 86_400;
pub const DEFAULT_SIGNING_FALLBACK_COOLDOWN_SECONDS: u64 = 30;
pub const DEFAULT_DPOP_PROOF_MAX_AGE_SECONDS: u64 = 300;
pub const DEFAULT_DPOP_CLOCK_SKEW_SECONDS: u64 = 60;

/// Which signing key source the service talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningBackend {
    /// Ed25519 keys generated and held in this process.
    Local,
    /// Remote key-management signer reached over HTTP.
    Remote { endpoint: String },
}

#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    pub issuer: String,
    pub audience: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub signing_backend: SigningBackend,
    pub signing_timeout: Duration,
    /// Sign with an in-process key while the remote signer is unreachable.
    pub signing_fallback: bool,
    /// How long to stay on the fallback key before trying the remote again.
    pub signing_fallback_cooldown: Duration,
    /// Remote publishing endpoint; `None` wires the cache to the in-process publisher.
    pub key_set_url: Option<String>,
    pub key_cache_ttl: Duration,
    pub key_cache_stale_grace: Duration,
    pub key_refresh_interval: Duration,
    pub key_grace_window: Duration,
    pub clock_skew: Duration,
    pub dpop_proof_max_age: Duration,
    pub dpop_clock_skew: Duration,
    /// `None` selects the in-memory stores.
    pub redis_url: Option<String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backend = match &self.signing_backend {
            SigningBackend::Local => "local",
            SigningBackend::Remote { .. } => "remote",
        };
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("access_token_ttl", &self.access_token_ttl)
            .field("refresh_token_ttl", &self.refresh_token_ttl)
            .field("signing_backend", &backend)
            .field("signing_timeout", &self.signing_timeout)
            .field("signing_fallback", &self.signing_fallback)
            .field("signing_fallback_cooldown", &self.signing_fallback_cooldown)
            .field("key_set_url", &self.key_set_url.as_ref().map(|_| "[REDACTED]"))
            .field("key_cache_ttl", &self.key_cache_ttl)
            .field("key_cache_stale_grace", &self.key_cache_stale_grace)
            .field("key_refresh_interval", &self.key_refresh_interval)
            .field("key_grace_window", &self.key_grace_window)
            .field("clock_skew", &self.clock_skew)
            .field("dpop_proof_max_age", &self.dpop_proof_max_age)
            .field("dpop_clock_skew", &self.dpop_clock_skew)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing)
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let issuer = vars
            .get("TOKEN_ISSUER")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("TOKEN_ISSUER".to_string()))?
            .clone();

        let bind_address = vars
            .get("BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let audience = vars
            .get("TOKEN_AUDIENCE")
            .cloned()
            .unwrap_or_else(|| DEFAULT_AUDIENCE.to_string());

        let signing_backend = match vars.get("SIGNING_BACKEND").map(String::as_str) {
            None | Some("local") => SigningBackend::Local,
            Some("remote") => SigningBackend::Remote {
                endpoint: vars
                    .get("SIGNING_ENDPOINT")
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| ConfigError::MissingEnvVar("SIGNING_ENDPOINT".to_string()))?
                    .clone(),
            },
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    name: "SIGNING_BACKEND".to_string(),
                    reason: format!("expected 'local' or 'remote', got '{other}'"),
                })
            }
        };

        let clock_skew = Duration::from_secs(positive_secs(
            vars,
            "JWT_CLOCK_SKEW_SECONDS",
            DEFAULT_CLOCK_SKEW.as_secs(),
        )?);
        if clock_skew > MAX_CLOCK_SKEW {
            return Err(ConfigError::InvalidValue {
                name: "JWT_CLOCK_SKEW_SECONDS".to_string(),
                reason: format!("must be at most {}", MAX_CLOCK_SKEW.as_secs()),
            });
        }

        let signing_fallback = match vars.get("SIGNING_FALLBACK_ENABLED").map(String::as_str) {
            None | Some("false") => false,
            Some("true") => true,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    name: "SIGNING_FALLBACK_ENABLED".to_string(),
                    reason: format!("expected 'true' or 'false', got '{other}'"),
                })
            }
        };
        if signing_fallback && signing_backend == SigningBackend::Local {
            return Err(ConfigError::InvalidValue {
                name: "SIGNING_FALLBACK_ENABLED".to_string(),
                reason: "only applies to the remote signing backend".to_string(),
            });
        }

        let dpop_clock_skew = Duration::from_secs(positive_secs(
            vars,
            "DPOP_CLOCK_SKEW_SECONDS",
            DEFAULT_DPOP_CLOCK_SKEW_SECONDS,
        )?);
        if dpop_clock_skew > MAX_CLOCK_SKEW {
            return Err(ConfigError::InvalidValue {
                name: "DPOP_CLOCK_SKEW_SECONDS".to_string(),
                reason: format!("must be at most {}", MAX_CLOCK_SKEW.as_secs()),
            });
        }

        let key_set_url = vars.get("KEY_SET_URL").filter(|v| !v.is_empty()).cloned();
        // A remote signer publishes its own key set; there is no local publisher to fall back on
        if matches!(signing_backend, SigningBackend::Remote { .. }) && key_set_url.is_none() {
            return Err(ConfigError::MissingEnvVar("KEY_SET_URL".to_string()));
        }

        Ok(Config {
            bind_address,
            issuer,
            audience,
            access_token_ttl: Duration::from_secs(positive_secs(
                vars,
                "ACCESS_TOKEN_TTL_SECONDS",
                DEFAULT_ACCESS_TOKEN_TTL_SECONDS,
            )?),
            refresh_token_ttl: Duration::from_secs(positive_secs(
                vars,
                "REFRESH_TOKEN_TTL_SECONDS",
                DEFAULT_REFRESH_TOKEN_TTL_SECONDS,
            )?),
            signing_backend,
            signing_timeout: Duration::from_millis(positive_secs(
                vars,
                "SIGNING_TIMEOUT_MS",
                DEFAULT_SIGNING_TIMEOUT_MS,
            )?),
            signing_fallback,
            signing_fallback_cooldown: Duration::from_secs(positive_secs(
                vars,
                "SIGNING_FALLBACK_COOLDOWN_SECONDS",
                DEFAULT_SIGNING_FALLBACK_COOLDOWN_SECONDS,
            )?),
            key_set_url,
            key_cache_ttl: Duration::from_secs(positive_secs(
                vars,
                "KEY_CACHE_TTL_SECONDS",
                DEFAULT_KEY_CACHE_TTL_SECONDS,
            )?),
            key_cache_stale_grace: Duration::from_secs(positive_secs(
                vars,
                "KEY_CACHE_STALE_GRACE_SECONDS",
                DEFAULT_KEY_CACHE_STALE_GRACE_SECONDS,
            )?),
            key_refresh_interval: Duration::from_secs(positive_secs(
                vars,
                "KEY_REFRESH_INTERVAL_SECONDS",
                DEFAULT_KEY_REFRESH_INTERVAL_SECONDS,
            )?),
            key_grace_window: Duration::from_secs(positive_secs(
                vars,
                "KEY_GRACE_WINDOW_SECONDS",
                DEFAULT_KEY_GRACE_WINDOW_SECONDS,
            )?),
            clock_skew,
            dpop_proof_max_age: Duration::from_secs(positive_secs(
                vars,
                "DPOP_PROOF_MAX_AGE_SECONDS",
                DEFAULT_DPOP_PROOF_MAX_AGE_SECONDS,
            )?),
            dpop_clock_skew,
            redis_url: vars.get("REDIS_URL").filter(|v| !v.is_empty()).cloned(),
        })
    }
}

/// Parse a strictly positive integer, falling back to `default` when unset.
fn positive_secs(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    let Some(raw) = vars.get(name) else {
        return Ok(default);
    };
    let value: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        reason: format!("'{raw}' is not a non-negative integer"),
    })?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            name: name.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
