use common::types::FamilyId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Claim names the issuer owns. Custom claims may not use them.
pub const REGISTERED_CLAIMS: &[&str] = &[
    "sub",
    "iss",
    "aud",
    "iat",
    "exp",
    "nbf",
    "jti",
    "sid",
    "scope",
    "token_use",
    "fid",
    "nonce",
    "cnf",
];

/// Which of the three issued tokens a claim set belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenUse {
    Access,
    Refresh,
    Id,
}

impl TokenUse {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenUse::Access => "access",
            TokenUse::Refresh => "refresh",
            TokenUse::Id => "id",
        }
    }
}

/// Key confirmation (RFC 7800) binding a token to a proof-of-possession key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    /// Base64url SHA-256 JWK thumbprint (RFC 7638).
    pub jkt: String,
}

/// JWT payload. Immutable once signed.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    pub jti: String,
    pub sid: String,
    /// Space-separated scopes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,
    pub token_use: TokenUse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fid: Option<FamilyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Present on access tokens of a sender-constrained family.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cnf: Option<Confirmation>,
    #[serde(flatten)]
    pub custom: Map<String, Value>,
}

impl fmt::Debug for Claims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claims")
            .field("sub", &"[REDACTED]")
            .field("iss", &self.iss)
            .field("aud", &self.aud)
            .field("iat", &self.iat)
            .field("exp", &self.exp)
            .field("nbf", &self.nbf)
            .field("jti", &"[REDACTED]")
            .field("sid", &"[REDACTED]")
            .field("scope", &self.scope)
            .field("token_use", &self.token_use)
            .field("fid", &self.fid)
            .field("nonce", &self.nonce.as_ref().map(|_| "[REDACTED]"))
            .field("cnf", &self.cnf)
            .field("custom_claims", &self.custom.len())
            .finish()
    }
}

impl Claims {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope.split_whitespace().any(|s| s == scope)
    }

    pub fn scopes(&self) -> Vec<&str> {
        self.scope.split_whitespace().collect()
    }

    /// Thumbprint of the key this token is bound to, if any.
    pub fn bound_key(&self) -> Option<&str> {
        self.cnf.as_ref().map(|c| c.jkt.as_str())
    }
}

/// Validate scope-tokens and join them into the `scope` claim value.
///
/// Each scope must be a non-empty RFC 6749 scope-token
/// (`%x21 / %x23-5B / %x5D-7E`). Duplicates collapse, first occurrence wins.
pub fn normalize_scopes<S: AsRef<str>>(scopes: &[S]) -> Result<String, String> {
    let mut seen: Vec<&str> = Vec::with_capacity(scopes.len());
    for scope in scopes {
        let scope = scope.as_ref();
        if scope.is_empty() {
            return Err("scope must not be empty".to_string());
        }
        if !scope.bytes().all(is_scope_char) {
            return Err("scope contains invalid characters".to_string());
        }
        if !seen.contains(&scope) {
            seen.push(scope);
        }
    }
    Ok(seen.join(" "))
}

fn is_scope_char(b: u8) -> bool {
    b == 0x21 || (0x23..=0x5B).contains(&b) || (0x5D..=0x7E).contains(&b)
}

/// Reject custom claims that would shadow a registered claim.
pub fn check_custom_claims(custom: &Map<String, Value>) -> Result<(), String> {
    match custom.keys().find(|k| REGISTERED_CLAIMS.contains(&k.as_str())) {
        Some(name) => Err(format!("custom claim '{name}' shadows a registered claim")),
        None => Ok(()),
    }
}

/// Claims a caller requires of a token beyond signature and expiry.
#[derive(Debug, Clone, Default)]
pub struct RequiredClaims {
    issuer: Option<String>,
    audience: Option<String>,
    token_use: Option<TokenUse>,
    scopes: Vec<String>,
    present: Vec<String>,
}

impl RequiredClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requirements for a bearer access token from this issuer.
    pub fn access(issuer: &str, audience: &str) -> Self {
        Self::new()
            .issuer(issuer)
            .audience(audience)
            .token_use(TokenUse::Access)
    }

    pub fn issuer(mut self, issuer: &str) -> Self {
        self.issuer = Some(issuer.to_string());
        self
    }

    pub fn audience(mut self, audience: &str) -> Self {
        self.audience = Some(audience.to_string());
        self
    }

    pub fn token_use(mut self, token_use: TokenUse) -> Self {
        self.token_use = Some(token_use);
        self
    }

    pub fn scope(mut self, scope: &str) -> Self {
        self.scopes.push(scope.to_string());
        self
    }

    /// Require a custom claim to be present (any value).
    pub fn claim(mut self, name: &str) -> Self {
        self.present.push(name.to_string());
        self
    }

    /// Returns the name of the first requirement the claims fail.
    pub fn check(&self, claims: &Claims) -> Result<(), &'static str> {
        if self.issuer.as_ref().is_some_and(|iss| *iss != claims.iss) {
            return Err("iss");
        }
        if self.audience.as_ref().is_some_and(|aud| *aud != claims.aud) {
            return Err("aud");
        }
        if self.token_use.is_some_and(|u| u != claims.token_use) {
            return Err("token_use");
        }
        if !self.scopes.iter().all(|s| claims.has_scope(s)) {
            return Err("scope");
        }
        if !self
            .present
            .iter()
            .all(|name| claims.custom.get(name).is_some_and(|v| !v.is_null()))
        {
            return Err("custom");
        }
        Ok(())
    }
}
