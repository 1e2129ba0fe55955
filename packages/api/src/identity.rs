//! Identity Verifier.
//!
//! Validates bearer tokens against a cached set of trusted public keys. The
//! key set is reloaded on a bounded interval and on an unknown `kid`, and
//! keys that disappear from the source stay trusted for an overlap window so
//! that rotation needs no downtime.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use jobplane_types::{
    ErrorKind, SharedClock, async_trait,
    chrono::{DateTime, Utc},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header, errors::ErrorKind as JwtErrorKind};
use moka::sync::Cache;
use parking_lot::RwLock;

use crate::config::IdentityConfig;
use crate::credentials::{AccessClaims, AccessToken, CredentialVendor, Jwks, Role, Scope};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("Token expired")]
    Expired,
    #[error("Token not yet valid")]
    NotYetValid,
    #[error("Invalid token signature")]
    BadSignature,
    #[error("Unknown issuer: {0}")]
    UnknownIssuer(String),
    #[error("Token not intended for this audience")]
    InvalidAudience,
    #[error("Malformed token: {0}")]
    Malformed(String),
}

impl VerifyError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::AuthDenied
    }

    fn label(&self) -> &'static str {
        match self {
            VerifyError::Expired => "expired",
            VerifyError::NotYetValid => "not_yet_valid",
            VerifyError::BadSignature => "bad_signature",
            VerifyError::UnknownIssuer(_) => "unknown_issuer",
            VerifyError::InvalidAudience => "invalid_audience",
            VerifyError::Malformed(_) => "malformed",
        }
    }
}

impl From<jsonwebtoken::errors::Error> for VerifyError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            JwtErrorKind::InvalidSignature => VerifyError::BadSignature,
            JwtErrorKind::InvalidIssuer => VerifyError::UnknownIssuer("issuer not trusted".into()),
            JwtErrorKind::InvalidAudience => VerifyError::InvalidAudience,
            JwtErrorKind::ExpiredSignature => VerifyError::Expired,
            JwtErrorKind::ImmatureSignature => VerifyError::NotYetValid,
            _ => VerifyError::Malformed(err.to_string()),
        }
    }
}

/// Explicit capability check failure on an already verified identity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("Missing scope: {0}")]
    MissingScope(Scope),
    #[error("Token is bound to another resource")]
    ResourceMismatch,
}

impl CapabilityError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::AuthDenied
    }
}

/// A verified caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub role: Role,
    pub scopes: BTreeSet<Scope>,
    pub resource: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub token_id: String,
}

impl Identity {
    pub fn has(&self, scope: Scope) -> bool {
        self.scopes.contains(&scope)
    }

    pub fn require(&self, scope: Scope) -> Result<(), CapabilityError> {
        if self.has(scope) {
            Ok(())
        } else {
            Err(CapabilityError::MissingScope(scope))
        }
    }

    /// Tokens without a resource claim are not bound; bound tokens only
    /// match their own resource.
    pub fn require_resource(&self, resource: &str) -> Result<(), CapabilityError> {
        match &self.resource {
            Some(bound) if bound != resource => Err(CapabilityError::ResourceMismatch),
            _ => Ok(()),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.resource.is_some()
    }
}

#[async_trait]
pub trait KeySource: Send + Sync {
    async fn fetch(&self) -> jobplane_types::Result<Jwks>;
}

/// In-process key set, replaced wholesale on rotation.
#[derive(Debug, Default)]
pub struct StaticKeySource {
    keys: RwLock<Jwks>,
}

impl StaticKeySource {
    pub fn new(keys: Jwks) -> Self {
        Self {
            keys: RwLock::new(keys),
        }
    }

    pub fn replace(&self, keys: Jwks) {
        *self.keys.write() = keys;
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn fetch(&self) -> jobplane_types::Result<Jwks> {
        Ok(self.keys.read().clone())
    }
}

/// Remote JWKS document.
#[derive(Debug, Clone)]
pub struct JwksKeySource {
    client: reqwest::Client,
    url: String,
}

impl JwksKeySource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl KeySource for JwksKeySource {
    async fn fetch(&self) -> jobplane_types::Result<Jwks> {
        let jwks = self
            .client
            .get(&self.url)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?
            .json::<Jwks>()
            .await?;
        Ok(jwks)
    }
}

#[async_trait]
impl KeySource for CredentialVendor {
    async fn fetch(&self) -> jobplane_types::Result<Jwks> {
        Ok(self.jwks())
    }
}

#[derive(Clone)]
struct CachedKey {
    key: DecodingKey,
    last_seen: DateTime<Utc>,
}

#[derive(Default)]
struct KeyCache {
    keys: HashMap<String, CachedKey>,
    loaded_at: Option<DateTime<Utc>>,
    last_forced: Option<DateTime<Utc>>,
}

#[derive(Clone)]
struct CachedIdentity {
    identity: Identity,
    nbf: i64,
    exp: i64,
}

pub struct IdentityVerifier {
    source: Arc<dyn KeySource>,
    config: IdentityConfig,
    clock: SharedClock,
    keys: RwLock<KeyCache>,
    refresh_lock: tokio::sync::Mutex<()>,
    identities: Cache<String, CachedIdentity>,
}

impl fmt::Debug for IdentityVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityVerifier")
            .field("trusted_issuers", &self.config.trusted_issuers)
            .field("keys", &self.keys.read().keys.len())
            .finish_non_exhaustive()
    }
}

impl IdentityVerifier {
    pub fn new(source: Arc<dyn KeySource>, config: IdentityConfig, clock: SharedClock) -> Self {
        let identities = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(std::time::Duration::from_secs(config.cache_ttl_secs))
            .build();
        Self {
            source,
            config,
            clock,
            keys: RwLock::new(KeyCache::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
            identities,
        }
    }

    pub async fn verify_token(&self, token: &AccessToken) -> Result<Identity, VerifyError> {
        self.verify(token.as_str()).await
    }

    #[tracing::instrument(name = "identity.verify", skip_all)]
    pub async fn verify(&self, token: &str) -> Result<Identity, VerifyError> {
        let result = self.verify_inner(token).await;
        if let Err(e) = &result {
            tracing::warn!(reason = %e, "Rejected identity token");
            metrics::counter!("jobplane_tokens_rejected_total", "reason" => e.label()).increment(1);
        }
        result
    }

    async fn verify_inner(&self, token: &str) -> Result<Identity, VerifyError> {
        let cache_key = blake3::hash(token.as_bytes()).to_hex().to_string();
        if let Some(cached) = self.identities.get(&cache_key) {
            self.check_window(cached.nbf, cached.exp)?;
            return Ok(cached.identity);
        }

        let header = decode_header(token)?;
        if header.alg != Algorithm::ES256 {
            return Err(VerifyError::Malformed(format!("unsupported algorithm {:?}", header.alg)));
        }
        let kid = header
            .kid
            .ok_or_else(|| VerifyError::Malformed("missing key id".into()))?;
        let key = self.key_for(&kid).await?;

        let mut validation = Validation::new(Algorithm::ES256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.set_issuer(&self.config.trusted_issuers);
        validation.set_audience(&[&self.config.audience]);

        let claims = decode::<AccessClaims>(token, &key, &validation)?.claims;
        self.check_window(claims.nbf, claims.exp)?;

        let identity = Identity {
            subject: claims.sub,
            role: claims.role,
            scopes: claims.scope.into_iter().collect(),
            resource: claims.resource,
            issued_at: DateTime::from_timestamp(claims.iat, 0).unwrap_or_default(),
            expires_at: DateTime::from_timestamp(claims.exp, 0).unwrap_or_default(),
            token_id: claims.jti,
        };

        self.identities.insert(
            cache_key,
            CachedIdentity {
                identity: identity.clone(),
                nbf: claims.nbf,
                exp: claims.exp,
            },
        );

        Ok(identity)
    }

    /// Expiry and not-before against the injected clock, with bounded skew.
    fn check_window(&self, nbf: i64, exp: i64) -> Result<(), VerifyError> {
        let now = self.clock.now().timestamp();
        let skew = self.config.clock_skew_secs;
        if now >= exp + skew {
            return Err(VerifyError::Expired);
        }
        if now + skew < nbf {
            return Err(VerifyError::NotYetValid);
        }
        Ok(())
    }

    async fn key_for(&self, kid: &str) -> Result<DecodingKey, VerifyError> {
        let now = self.clock.now();

        if self.is_stale(now) {
            self.refresh(now, false).await;
        }
        if let Some(key) = self.lookup(kid) {
            return Ok(key);
        }

        if self.may_force(now) {
            tracing::debug!(kid, "Unknown key id; forcing key refresh");
            self.refresh(now, true).await;
            if let Some(key) = self.lookup(kid) {
                return Ok(key);
            }
        }

        Err(VerifyError::UnknownIssuer(format!("unknown key id {}", kid)))
    }

    fn lookup(&self, kid: &str) -> Option<DecodingKey> {
        self.keys.read().keys.get(kid).map(|cached| cached.key.clone())
    }

    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.keys.read().loaded_at {
            Some(loaded_at) => now - loaded_at >= self.config.key_refresh(),
            None => true,
        }
    }

    fn may_force(&self, now: DateTime<Utc>) -> bool {
        match self.keys.read().last_forced {
            Some(last) => now - last >= self.config.min_refresh(),
            None => true,
        }
    }

    async fn refresh(&self, now: DateTime<Utc>, forced: bool) {
        let _guard = self.refresh_lock.lock().await;
        if !forced && !self.is_stale(now) {
            return;
        }
        if forced && !self.may_force(now) {
            return;
        }

        let fetched = self.source.fetch().await;

        let mut cache = self.keys.write();
        if forced {
            cache.last_forced = Some(now);
        }

        match fetched {
            Ok(jwks) => {
                for jwk in jwks.keys {
                    match jwk.decoding_key() {
                        Ok(key) => {
                            cache.keys.insert(jwk.kid.clone(), CachedKey { key, last_seen: now });
                        }
                        Err(e) => {
                            tracing::warn!(kid = %jwk.kid, error = %e, "Skipping unusable public key");
                        }
                    }
                }
                let overlap = self.config.rotation_overlap();
                cache.keys.retain(|kid, cached| {
                    let keep = cached.last_seen + overlap > now;
                    if !keep {
                        tracing::info!(kid = %kid, "Retiring rotated-out public key");
                    }
                    keep
                });
                cache.loaded_at = Some(now);
                tracing::debug!(keys = cache.keys.len(), "Refreshed trusted key set");
            }
            Err(e) => {
                // Keep serving the current keys; retry after the minimum interval.
                tracing::warn!(error = %e, "Failed to refresh trusted key set");
                cache.loaded_at = Some(now - self.config.key_refresh() + self.config.min_refresh());
            }
        }
    }
}
