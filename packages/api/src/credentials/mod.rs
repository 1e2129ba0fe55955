//! Credential Vendor.
//!
//! Issues short-lived, narrowly scoped access tokens on demand. Each call is
//! independent: there are no refresh tokens, and a caller that needs a new
//! token asks again. The only state is the signing key.

use std::collections::BTreeSet;
use std::fmt;

use jobplane_types::{
    ErrorKind, SharedClock,
    chrono::{DateTime, Duration, Utc},
    create_id,
};
use jsonwebtoken::{Algorithm, Header, encode};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::config::CredentialConfig;

pub mod keys;
pub mod scope;

pub use keys::{Jwk, Jwks, SigningKey};
pub use scope::{DISPATCHER_SCOPES, Role, Scope, ScopePolicy, USER_SCOPES, WORKER_SCOPES};

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Requested scope exceeds policy: {0}")]
    ScopeDenied(String),
    #[error("Invalid signing key: {0}")]
    InvalidKey(String),
    #[error("Failed to sign token: {0}")]
    Signing(String),
}

impl CredentialError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CredentialError::ScopeDenied(_) => ErrorKind::ScopeDenied,
            CredentialError::InvalidKey(_) | CredentialError::Signing(_) => ErrorKind::AuthDenied,
        }
    }
}

/// Who a token is issued to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    pub role: Role,
}

impl Subject {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

/// Claims carried by every access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub role: Role,
    pub scope: Vec<Scope>,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,
    /// Task the token is bound to. A bound token authorizes nothing else.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

/// A signed, immutable access token. Renders redacted in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    raw: String,
    claims: AccessClaims,
}

impl AccessToken {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn claims(&self) -> &AccessClaims {
        &self.claims
    }

    pub fn subject(&self) -> &str {
        &self.claims.sub
    }

    pub fn scope(&self) -> &[Scope] {
        &self.claims.scope
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.claims.iat, 0).unwrap_or_default()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.claims.exp, 0).unwrap_or_default()
    }

    pub fn signature(&self) -> &str {
        self.raw.rsplit('.').next().unwrap_or_default()
    }

    fn redacted(&self) -> String {
        let prefix: String = self.raw.chars().take(10).collect();
        format!("{}…", prefix)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &self.redacted())
            .field("sub", &self.claims.sub)
            .field("scope", &self.claims.scope)
            .field("exp", &self.claims.exp)
            .finish()
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub subject: Subject,
    pub scope: BTreeSet<Scope>,
    /// Requested lifetime, clamped to the configured ceiling
    pub ttl: Option<Duration>,
    pub resource: Option<String>,
}

impl TokenRequest {
    pub fn new(subject: Subject, scope: &[Scope]) -> Self {
        Self {
            subject,
            scope: scope.iter().copied().collect(),
            ttl: None,
            resource: None,
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn bound_to(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

pub struct CredentialVendor {
    key: RwLock<SigningKey>,
    config: CredentialConfig,
    clock: SharedClock,
}

impl fmt::Debug for CredentialVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVendor")
            .field("kid", &self.key.read().kid())
            .field("issuer", &self.config.issuer)
            .finish_non_exhaustive()
    }
}

impl CredentialVendor {
    pub fn new(key: SigningKey, config: CredentialConfig, clock: SharedClock) -> Self {
        Self {
            key: RwLock::new(key),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &CredentialConfig {
        &self.config
    }

    pub fn issue(&self, subject: &Subject, scope: &[Scope]) -> Result<AccessToken, CredentialError> {
        self.issue_with(TokenRequest::new(subject.clone(), scope))
    }

    #[instrument(name = "vendor.issue", skip(self, request), fields(sub = %request.subject.id, role = %request.subject.role))]
    pub fn issue_with(&self, request: TokenRequest) -> Result<AccessToken, CredentialError> {
        if request.scope.is_empty() {
            return Err(CredentialError::ScopeDenied("empty scope".into()));
        }

        let excess = self.config.policy.excess(request.subject.role, &request.scope);
        if !excess.is_empty() {
            let names = excess.iter().map(Scope::to_string).collect::<Vec<_>>().join(" ");
            tracing::warn!(excess = %names, "Refusing token request beyond role policy");
            metrics::counter!("jobplane_tokens_refused_total", "role" => request.subject.role.as_str())
                .increment(1);
            return Err(CredentialError::ScopeDenied(format!(
                "role {} may not hold {}",
                request.subject.role, names
            )));
        }

        let ceiling = self.config.token_ttl_ceiling();
        let ttl = request
            .ttl
            .unwrap_or_else(|| self.config.default_token_ttl())
            .min(ceiling)
            .max(Duration::seconds(1));

        let iat = self.clock.now().timestamp();
        let claims = AccessClaims {
            sub: request.subject.id,
            role: request.subject.role,
            scope: request.scope.into_iter().collect(),
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            iat,
            nbf: iat,
            exp: iat + ttl.num_seconds(),
            jti: create_id(),
            resource: request.resource,
        };

        let key = self.key.read();
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(key.kid().to_string());

        let raw = encode(&header, &claims, key.encoding_key())
            .map_err(|e| CredentialError::Signing(e.to_string()))?;

        tracing::debug!(exp = claims.exp, resource = ?claims.resource, "Issued access token");
        metrics::counter!("jobplane_tokens_issued_total", "role" => claims.role.as_str()).increment(1);

        Ok(AccessToken { raw, claims })
    }

    /// Replace the signing key. Verifiers keep trusting the previous key for
    /// their rotation overlap window.
    pub fn rotate(&self, key: SigningKey) {
        let mut current = self.key.write();
        tracing::info!(old_kid = %current.kid(), new_kid = %key.kid(), "Rotating signing key");
        *current = key;
    }

    pub fn jwks(&self) -> Jwks {
        Jwks {
            keys: vec![self.key.read().jwk().clone()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobplane_types::ManualClock;

    fn vendor(clock: &ManualClock) -> CredentialVendor {
        CredentialVendor::new(
            SigningKey::generate("test").unwrap(),
            CredentialConfig::default(),
            clock.shared(),
        )
    }

    #[test]
    fn issues_requested_scope_only() {
        let clock = ManualClock::starting_now();
        let vendor = vendor(&clock);
        let token = vendor
            .issue(&Subject::new("alice", Role::User), &[Scope::TaskRead])
            .unwrap();

        assert_eq!(token.subject(), "alice");
        assert_eq!(token.scope(), &[Scope::TaskRead]);
        assert_eq!(token.issued_at(), clock.now());
        assert_eq!(token.expires_at() - token.issued_at(), Duration::seconds(120));
    }

    #[test]
    fn scope_beyond_role_is_denied() {
        let clock = ManualClock::starting_now();
        let vendor = vendor(&clock);
        let err = vendor
            .issue(&Subject::new("alice", Role::User), &[Scope::TaskSubmit, Scope::QueueClaim])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScopeDenied);
    }

    #[test]
    fn empty_scope_is_denied() {
        let clock = ManualClock::starting_now();
        let vendor = vendor(&clock);
        assert!(matches!(
            vendor.issue(&Subject::new("d", Role::Dispatcher), &[]),
            Err(CredentialError::ScopeDenied(_))
        ));
    }

    #[test]
    fn ttl_is_clamped_to_ceiling() {
        let clock = ManualClock::starting_now();
        let vendor = vendor(&clock);
        let token = vendor
            .issue_with(
                TokenRequest::new(Subject::new("d", Role::Dispatcher), DISPATCHER_SCOPES)
                    .ttl(Duration::hours(8)),
            )
            .unwrap();
        assert_eq!(token.expires_at() - token.issued_at(), Duration::seconds(300));
    }

    #[test]
    fn tokens_are_never_reused() {
        let clock = ManualClock::starting_now();
        let vendor = vendor(&clock);
        let subject = Subject::new("d", Role::Dispatcher);
        let first = vendor.issue(&subject, DISPATCHER_SCOPES).unwrap();
        let second = vendor.issue(&subject, DISPATCHER_SCOPES).unwrap();
        assert_ne!(first.claims().jti, second.claims().jti);
        assert_ne!(first.as_str(), second.as_str());
    }

    #[test]
    fn debug_and_display_are_redacted() {
        let clock = ManualClock::starting_now();
        let vendor = vendor(&clock);
        let token = vendor
            .issue(&Subject::new("alice", Role::User), USER_SCOPES)
            .unwrap();

        assert!(!format!("{:?}", token).contains(token.as_str()));
        assert!(!token.to_string().contains(token.signature()));
    }
}
