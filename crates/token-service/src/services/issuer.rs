//! Token issuance.
//!
//! The issuer is the only component that creates families. It also mints
//! the tokens for every later generation on behalf of the family tracker,
//! so both paths build claims and sign them the same way.

use crate::config::Config;
use crate::crypto::dpop::is_valid_thumbprint;
use crate::crypto::hash_refresh_token;
use crate::crypto::signer::SigningKeySource;
use crate::errors::{SignerError, TokenError};
use crate::models::claims::{check_custom_claims, normalize_scopes};
use crate::models::{
    Claims, Confirmation, FamilyStatus, Generation, GenerationStatus, IssuedToken, TokenFamily,
    TokenPair, TokenUse,
};
use crate::observability::{hash_for_correlation, metrics};
use crate::repositories::FamilyStore;
use crate::services::dpop::DpopBinding;
use chrono::Utc;
use common::jwt::{attach_signature, encode_signing_input, JoseHeader};
use common::secret::SecretString;
use common::types::{FamilyId, TokenId};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;

/// A signing race with key rotation is retried once with the new kid.
const MAX_SIGNING_ATTEMPTS: usize = 2;

/// Input to [`TokenIssuer::issue`].
#[derive(Clone)]
pub struct IssueRequest {
    pub subject: String,
    pub session_id: String,
    pub scopes: Vec<String>,
    pub custom_claims: Map<String, Value>,
    /// Defaults to the configured access TTL.
    pub access_ttl: Option<Duration>,
    /// Defaults to the configured refresh TTL.
    pub refresh_ttl: Option<Duration>,
    pub nonce: Option<String>,
    /// Thumbprint of the client key the family is bound to.
    pub dpop_jkt: Option<String>,
}

impl fmt::Debug for IssueRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssueRequest")
            .field("subject", &"[REDACTED]")
            .field("session_id", &"[REDACTED]")
            .field("scopes", &self.scopes)
            .field("custom_claims", &self.custom_claims.len())
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .field("nonce", &self.nonce.as_ref().map(|_| "[REDACTED]"))
            .field("sender_constrained", &self.dpop_jkt.is_some())
            .finish()
    }
}

impl IssueRequest {
    pub fn new(subject: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            session_id: session_id.into(),
            scopes: Vec::new(),
            custom_claims: Map::new(),
            access_ttl: None,
            refresh_ttl: None,
            nonce: None,
            dpop_jkt: None,
        }
    }

    pub fn scopes<S: Into<String>>(mut self, scopes: impl IntoIterator<Item = S>) -> Self {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn claim(mut self, name: impl Into<String>, value: Value) -> Self {
        self.custom_claims.insert(name.into(), value);
        self
    }

    pub fn access_ttl(mut self, ttl: Duration) -> Self {
        self.access_ttl = Some(ttl);
        self
    }

    pub fn refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = Some(ttl);
        self
    }

    pub fn nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    /// Bind the family to the key a verified proof demonstrated.
    pub fn bound_to(mut self, binding: DpopBinding) -> Self {
        self.dpop_jkt = Some(binding.jkt);
        self
    }
}

/// Issuer-wide settings.
#[derive(Debug, Clone)]
pub struct IssuerSettings {
    pub issuer: String,
    pub audience: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub signing_timeout: Duration,
}

impl IssuerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            access_ttl: config.access_token_ttl,
            refresh_ttl: config.refresh_token_ttl,
            signing_timeout: config.signing_timeout,
        }
    }
}

/// Tokens for one generation, signed but not yet persisted.
pub(crate) struct MintedGeneration {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub id_token: Option<SecretString>,
    pub generation: Generation,
}

impl MintedGeneration {
    pub(crate) fn into_pair(self, family: &TokenFamily) -> TokenPair {
        TokenPair {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            id_token: self.id_token,
            token_type: if family.is_sender_constrained() {
                "DPoP"
            } else {
                "Bearer"
            },
            expires_in: family.access_ttl_secs.unsigned_abs(),
            refresh_expires_in: family.refresh_ttl_secs.unsigned_abs(),
            family_id: family.family_id,
            generation: self.generation.number,
        }
    }
}

pub struct TokenIssuer {
    signer: Arc<dyn SigningKeySource>,
    families: Arc<dyn FamilyStore>,
    settings: IssuerSettings,
}

impl TokenIssuer {
    pub fn new(
        signer: Arc<dyn SigningKeySource>,
        families: Arc<dyn FamilyStore>,
        settings: IssuerSettings,
    ) -> Self {
        Self {
            signer,
            families,
            settings,
        }
    }

    pub fn settings(&self) -> &IssuerSettings {
        &self.settings
    }

    /// Start a new family at generation 0 and return its three tokens.
    ///
    /// Every call creates a distinct family; retries are not de-duplicated.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` for empty subject or session, TTLs under one
    ///   second, malformed scopes, custom claims that shadow registered
    ///   ones, an empty nonce, or a malformed key thumbprint
    /// - `SigningUnavailable` if the signing source fails or times out;
    ///   no family is recorded in that case
    /// - `StoreUnavailable` if the family cannot be recorded
    #[instrument(skip_all, fields(subject_hash = %hash_for_correlation(&request.subject)))]
    pub async fn issue(&self, request: IssueRequest) -> Result<TokenPair, TokenError> {
        let start = Instant::now();
        let result = self.issue_inner(request).await;

        let status = if result.is_ok() { "success" } else { "error" };
        metrics::record_token_issuance("issue", status, start.elapsed());
        result
    }

    async fn issue_inner(&self, request: IssueRequest) -> Result<TokenPair, TokenError> {
        if request.subject.is_empty() {
            return Err(TokenError::InvalidRequest("subject is required".to_string()));
        }
        if request.session_id.is_empty() {
            return Err(TokenError::InvalidRequest("session is required".to_string()));
        }
        if request.nonce.as_deref() == Some("") {
            return Err(TokenError::InvalidRequest("nonce must not be empty".to_string()));
        }
        if request
            .dpop_jkt
            .as_deref()
            .is_some_and(|jkt| !is_valid_thumbprint(jkt))
        {
            return Err(TokenError::InvalidRequest(
                "key thumbprint is malformed".to_string(),
            ));
        }
        let access_ttl = ttl_secs(request.access_ttl.unwrap_or(self.settings.access_ttl), "access")?;
        let refresh_ttl = ttl_secs(
            request.refresh_ttl.unwrap_or(self.settings.refresh_ttl),
            "refresh",
        )?;
        let scope = normalize_scopes(&request.scopes).map_err(TokenError::InvalidRequest)?;
        check_custom_claims(&request.custom_claims).map_err(TokenError::InvalidRequest)?;

        let now = Utc::now().timestamp();
        let family = TokenFamily {
            family_id: FamilyId::new(),
            subject: request.subject,
            session_id: request.session_id,
            scope,
            audience: self.settings.audience.clone(),
            custom: request.custom_claims,
            access_ttl_secs: access_ttl,
            refresh_ttl_secs: refresh_ttl,
            current_generation: 0,
            status: FamilyStatus::Active,
            created_at: now,
            expires_at: now.saturating_add(refresh_ttl),
            revoked_at: None,
            dpop_jkt: request.dpop_jkt,
        };

        let minted = self
            .mint_generation(&family, 0, request.nonce.as_deref(), now)
            .await?;

        // Only now does the family exist; a signing failure above leaves nothing behind
        self.families.create(&family, &minted.generation).await?;

        tracing::info!(
            target: "token.issuer",
            family_id = %family.family_id,
            access_ttl_secs = access_ttl,
            refresh_ttl_secs = refresh_ttl,
            sender_constrained = family.is_sender_constrained(),
            "Issued new token family"
        );
        Ok(minted.into_pair(&family))
    }

    /// Sign the tokens for generation `number` of `family`.
    ///
    /// The id token is minted only for generation 0.
    pub(crate) async fn mint_generation(
        &self,
        family: &TokenFamily,
        number: u32,
        nonce: Option<&str>,
        now: i64,
    ) -> Result<MintedGeneration, TokenError> {
        let access_exp = now.saturating_add(family.access_ttl_secs);
        let refresh_exp = now.saturating_add(family.refresh_ttl_secs);

        let access = self.claims_for(family, TokenUse::Access, now, access_exp);
        let refresh = self.claims_for(family, TokenUse::Refresh, now, refresh_exp);
        let id = (number == 0).then(|| {
            let mut claims = self.claims_for(family, TokenUse::Id, now, access_exp);
            claims.nonce = nonce.map(str::to_string);
            claims
        });

        let mut attempt = 0;
        let signed = loop {
            attempt += 1;
            let kid = self.with_timeout(self.signer.active_key_id()).await?;
            match self.sign_set(&kid, &access, &refresh, id.as_ref()).await {
                Err(SignerError::UnknownKey) if attempt < MAX_SIGNING_ATTEMPTS => {
                    tracing::debug!(target: "token.issuer", kid = %kid, "Active key rotated while signing, retrying");
                }
                other => break other.map_err(TokenError::from)?,
            }
        };
        let (access_token, refresh_token, id_token) = signed;

        let mut tokens = vec![
            IssuedToken {
                jti: access.jti.clone(),
                expires_at: access.exp,
            },
            IssuedToken {
                jti: refresh.jti.clone(),
                expires_at: refresh.exp,
            },
        ];
        if let Some(id) = &id {
            tokens.push(IssuedToken {
                jti: id.jti.clone(),
                expires_at: id.exp,
            });
        }

        Ok(MintedGeneration {
            generation: Generation {
                family_id: family.family_id,
                number,
                refresh_token_hash: hash_refresh_token(&refresh_token),
                status: GenerationStatus::Current,
                issued_at: now,
                refresh_expires_at: refresh_exp,
                tokens,
            },
            access_token: SecretString::from(access_token),
            refresh_token: SecretString::from(refresh_token),
            id_token: id_token.map(SecretString::from),
        })
    }

    fn claims_for(&self, family: &TokenFamily, token_use: TokenUse, now: i64, exp: i64) -> Claims {
        let cnf = match token_use {
            TokenUse::Access => family.dpop_jkt.clone().map(|jkt| Confirmation { jkt }),
            TokenUse::Refresh | TokenUse::Id => None,
        };
        let (scope, custom, fid) = match token_use {
            TokenUse::Access => (family.scope.clone(), family.custom.clone(), Some(family.family_id)),
            TokenUse::Refresh => (family.scope.clone(), Map::new(), Some(family.family_id)),
            TokenUse::Id => (String::new(), family.custom.clone(), None),
        };
        Claims {
            sub: family.subject.clone(),
            iss: self.settings.issuer.clone(),
            aud: family.audience.clone(),
            iat: now,
            exp,
            nbf: None,
            jti: TokenId::new().to_string(),
            sid: family.session_id.clone(),
            scope,
            token_use,
            fid,
            nonce: None,
            cnf,
            custom,
        }
    }

    async fn sign_set(
        &self,
        kid: &str,
        access: &Claims,
        refresh: &Claims,
        id: Option<&Claims>,
    ) -> Result<(String, String, Option<String>), SignerError> {
        let access = self.sign_claims(kid, access).await?;
        let refresh = self.sign_claims(kid, refresh).await?;
        let id = match id {
            Some(claims) => Some(self.sign_claims(kid, claims).await?),
            None => None,
        };
        Ok((access, refresh, id))
    }

    async fn sign_claims(&self, kid: &str, claims: &Claims) -> Result<String, SignerError> {
        let signing_input = encode_signing_input(&JoseHeader::eddsa(kid), claims)
            .map_err(|e| SignerError::Rejected(format!("claims serialization failed: {e}")))?;
        let signature = self
            .with_timeout(self.signer.sign(kid, signing_input.as_bytes()))
            .await?;
        Ok(attach_signature(&signing_input, &signature))
    }

    async fn with_timeout<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, SignerError>>,
    ) -> Result<T, SignerError> {
        match tokio::time::timeout(self.settings.signing_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    target: "token.issuer",
                    timeout_ms = self.settings.signing_timeout.as_millis() as u64,
                    "Signing call timed out"
                );
                Err(SignerError::Unavailable("timed out".to_string()))
            }
        }
    }
}

fn ttl_secs(ttl: Duration, which: &str) -> Result<i64, TokenError> {
    match i64::try_from(ttl.as_secs()) {
        Ok(secs) if secs > 0 => Ok(secs),
        _ => Err(TokenError::InvalidRequest(format!(
            "{which} TTL must be at least one second"
        ))),
    }
}
