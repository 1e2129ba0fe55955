//! Process-wide configuration, loaded once at startup and passed explicitly
//! into each component's constructor.
//!
//! Every field has a default and a `JOBPLANE_*` environment override. A set
//! but unparseable variable fails startup instead of silently falling back.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use jobplane_executor::WorkerConfig;
use jobplane_types::chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::credentials::ScopePolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for: {0}")]
    InvalidValue(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn env_parse<T: FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(var.to_string())),
        _ => Ok(default),
    }
}

fn env_opt(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn env_list(var: &str, default: Vec<String>) -> Vec<String> {
    match env_opt(var) {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        None => default,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub visibility_timeout_secs: i64,
    pub max_attempts: u32,
    /// How long a dedup key keeps resolving to its first task, and how long
    /// a settled task stays queryable
    pub dedup_retention_secs: i64,
    pub dead_letter_retention_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 30,
            max_attempts: 3,
            dedup_retention_secs: 24 * 60 * 60,
            dead_letter_retention_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::seconds(self.visibility_timeout_secs)
    }

    pub fn dedup_retention(&self) -> Duration {
        Duration::seconds(self.dedup_retention_secs)
    }

    pub fn dead_letter_retention(&self) -> Duration {
        Duration::seconds(self.dead_letter_retention_secs)
    }

    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            visibility_timeout_secs: env_parse(
                "JOBPLANE_VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout_secs,
            )?,
            max_attempts: env_parse("JOBPLANE_MAX_ATTEMPTS", defaults.max_attempts)?,
            dedup_retention_secs: env_parse(
                "JOBPLANE_DEDUP_RETENTION_SECS",
                defaults.dedup_retention_secs,
            )?,
            dead_letter_retention_secs: env_parse(
                "JOBPLANE_DEAD_LETTER_RETENTION_SECS",
                defaults.dead_letter_retention_secs,
            )?,
        };
        if config.visibility_timeout_secs <= 0 {
            return Err(ConfigError::InvalidValue("JOBPLANE_VISIBILITY_TIMEOUT_SECS".into()));
        }
        if config.max_attempts == 0 {
            return Err(ConfigError::InvalidValue("JOBPLANE_MAX_ATTEMPTS".into()));
        }
        if config.dead_letter_retention_secs < config.dedup_retention_secs {
            return Err(ConfigError::InvalidValue("JOBPLANE_DEAD_LETTER_RETENTION_SECS".into()));
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    pub issuer: String,
    pub audience: String,
    pub token_ttl_ceiling_secs: i64,
    pub default_token_ttl_secs: i64,
    pub policy: ScopePolicy,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            issuer: "jobplane".to_string(),
            audience: "jobplane".to_string(),
            token_ttl_ceiling_secs: 300,
            default_token_ttl_secs: 120,
            policy: ScopePolicy::default(),
        }
    }
}

impl CredentialConfig {
    pub fn token_ttl_ceiling(&self) -> Duration {
        Duration::seconds(self.token_ttl_ceiling_secs)
    }

    pub fn default_token_ttl(&self) -> Duration {
        Duration::seconds(self.default_token_ttl_secs.min(self.token_ttl_ceiling_secs))
    }

    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let policy = match env_opt("JOBPLANE_SCOPE_POLICY") {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|_| ConfigError::InvalidValue("JOBPLANE_SCOPE_POLICY".into()))?,
            None => defaults.policy,
        };
        let config = Self {
            issuer: env_opt("JOBPLANE_ISSUER").unwrap_or(defaults.issuer),
            audience: env_opt("JOBPLANE_AUDIENCE").unwrap_or(defaults.audience),
            token_ttl_ceiling_secs: env_parse(
                "JOBPLANE_TOKEN_TTL_CEILING_SECS",
                defaults.token_ttl_ceiling_secs,
            )?,
            default_token_ttl_secs: env_parse(
                "JOBPLANE_TOKEN_TTL_SECS",
                defaults.default_token_ttl_secs,
            )?,
            policy,
        };
        if config.token_ttl_ceiling_secs <= 0 {
            return Err(ConfigError::InvalidValue("JOBPLANE_TOKEN_TTL_CEILING_SECS".into()));
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub trusted_issuers: Vec<String>,
    pub audience: String,
    pub clock_skew_secs: i64,
    pub key_refresh_secs: i64,
    /// Lower bound between forced refreshes triggered by an unknown `kid`
    pub min_refresh_secs: i64,
    /// How long a key that vanished from the source stays trusted
    pub rotation_overlap_secs: i64,
    /// Remote JWKS document; the in-process vendor is used when unset
    pub jwks_url: Option<String>,
    pub cache_ttl_secs: u64,
    pub cache_capacity: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            trusted_issuers: vec!["jobplane".to_string()],
            audience: "jobplane".to_string(),
            clock_skew_secs: 5,
            key_refresh_secs: 300,
            min_refresh_secs: 10,
            rotation_overlap_secs: 600,
            jwks_url: None,
            cache_ttl_secs: 60,
            cache_capacity: 10_000,
        }
    }
}

impl IdentityConfig {
    pub fn clock_skew(&self) -> Duration {
        Duration::seconds(self.clock_skew_secs)
    }

    pub fn key_refresh(&self) -> Duration {
        Duration::seconds(self.key_refresh_secs)
    }

    pub fn min_refresh(&self) -> Duration {
        Duration::seconds(self.min_refresh_secs)
    }

    pub fn rotation_overlap(&self) -> Duration {
        Duration::seconds(self.rotation_overlap_secs)
    }

    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            trusted_issuers: env_list("JOBPLANE_TRUSTED_ISSUERS", defaults.trusted_issuers),
            audience: env_opt("JOBPLANE_AUDIENCE").unwrap_or(defaults.audience),
            clock_skew_secs: env_parse("JOBPLANE_CLOCK_SKEW_SECS", defaults.clock_skew_secs)?,
            key_refresh_secs: env_parse("JOBPLANE_KEY_REFRESH_SECS", defaults.key_refresh_secs)?,
            min_refresh_secs: env_parse("JOBPLANE_KEY_MIN_REFRESH_SECS", defaults.min_refresh_secs)?,
            rotation_overlap_secs: env_parse(
                "JOBPLANE_KEY_ROTATION_OVERLAP_SECS",
                defaults.rotation_overlap_secs,
            )?,
            jwks_url: env_opt("JOBPLANE_JWKS_URL"),
            cache_ttl_secs: env_parse("JOBPLANE_IDENTITY_CACHE_TTL_SECS", defaults.cache_ttl_secs)?,
            cache_capacity: env_parse(
                "JOBPLANE_IDENTITY_CACHE_CAPACITY",
                defaults.cache_capacity,
            )?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    /// Added to the remaining lease when sizing pre-signed URL lifetimes
    pub presign_grace_secs: i64,
    /// Origin the dispatcher presents to the worker pool
    pub source_ip: IpAddr,
    pub subject: String,
    /// Base64 shared secret for worker-pool one-time codes
    pub totp_secret: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            batch_size: 16,
            presign_grace_secs: 30,
            source_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            subject: "dispatcher".to_string(),
            totp_secret: None,
        }
    }
}

impl DispatchConfig {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    pub fn presign_grace(&self) -> Duration {
        Duration::seconds(self.presign_grace_secs)
    }

    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            poll_interval_ms: env_parse("JOBPLANE_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            batch_size: env_parse("JOBPLANE_BATCH_SIZE", defaults.batch_size)?.max(1),
            presign_grace_secs: env_parse(
                "JOBPLANE_PRESIGN_GRACE_SECS",
                defaults.presign_grace_secs,
            )?,
            source_ip: env_parse("JOBPLANE_DISPATCHER_SOURCE_IP", defaults.source_ip)?,
            subject: env_opt("JOBPLANE_DISPATCHER_SUBJECT").unwrap_or(defaults.subject),
            totp_secret: env_opt("JOBPLANE_TOTP_SECRET"),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Local directory backing the object store; in-memory when unset
    pub root: Option<String>,
    /// Public base URL pre-signed links are minted against
    pub base_url: String,
    /// Secret for pre-signed URL signatures; random per process when unset
    pub url_secret: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: None,
            base_url: "http://127.0.0.1:8080".to_string(),
            url_secret: None,
        }
    }
}

impl StorageConfig {
    fn from_env(server: &ServerConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            root: env_opt("JOBPLANE_STORAGE_ROOT"),
            base_url: env_opt("JOBPLANE_PUBLIC_URL")
                .unwrap_or_else(|| format!("http://{}", server.bind)),
            url_secret: env_opt("JOBPLANE_URL_SECRET"),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

impl ServerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = env_parse("JOBPLANE_PORT", 8080)?;
        let host: IpAddr = env_parse("JOBPLANE_HOST", IpAddr::V4(Ipv4Addr::LOCALHOST))?;
        Ok(Self {
            bind: SocketAddr::new(host, port),
        })
    }
}

fn worker_from_env() -> Result<WorkerConfig, ConfigError> {
    let defaults = WorkerConfig::default();
    Ok(WorkerConfig {
        capacity: env_parse("JOBPLANE_WORKER_CAPACITY", defaults.capacity)?,
        prewarm: env_parse("JOBPLANE_WORKER_PREWARM", defaults.prewarm)?,
        cold_start_ms: env_parse("JOBPLANE_WORKER_COLD_START_MS", defaults.cold_start_ms)?,
        allowed_networks: env_list("JOBPLANE_WORKER_ALLOWED_NETWORKS", defaults.allowed_networks),
        totp_step_secs: env_parse("JOBPLANE_TOTP_STEP_SECS", defaults.totp_step_secs)?,
        totp_digits: env_parse("JOBPLANE_TOTP_DIGITS", defaults.totp_digits)?,
        totp_drift_steps: env_parse("JOBPLANE_TOTP_DRIFT_STEPS", defaults.totp_drift_steps)?,
        callback_timeout_ms: env_parse(
            "JOBPLANE_CALLBACK_TIMEOUT_MS",
            defaults.callback_timeout_ms,
        )?,
        callback_retries: env_parse("JOBPLANE_CALLBACK_RETRIES", defaults.callback_retries)?,
        transport: env_parse("JOBPLANE_WORKER_TRANSPORT", defaults.transport)?,
        transfer_timeout_ms: env_parse(
            "JOBPLANE_TRANSFER_TIMEOUT_MS",
            defaults.transfer_timeout_ms,
        )?,
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub queue: QueueConfig,
    pub credentials: CredentialConfig,
    pub identity: IdentityConfig,
    pub dispatch: DispatchConfig,
    pub worker: WorkerConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
}

impl PlatformConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let server = ServerConfig::from_env()?;
        let config = Self {
            queue: QueueConfig::from_env()?,
            credentials: CredentialConfig::from_env()?,
            identity: IdentityConfig::from_env()?,
            dispatch: DispatchConfig::from_env()?,
            worker: worker_from_env()?,
            storage: StorageConfig::from_env(&server)?,
            server,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self
            .identity
            .trusted_issuers
            .iter()
            .any(|issuer| issuer == &self.credentials.issuer)
            && self.identity.jwks_url.is_none()
        {
            return Err(ConfigError::Invalid(format!(
                "issuer {} is not trusted by the in-process verifier",
                self.credentials.issuer
            )));
        }
        if self.identity.audience != self.credentials.audience && self.identity.jwks_url.is_none() {
            return Err(ConfigError::Invalid(
                "verifier audience differs from issued audience".into(),
            ));
        }
        Ok(())
    }
}
