use std::env;
use std::time::Duration;

use jobplane_api::config::PlatformConfig;

#[derive(Clone, Debug)]
pub struct Config {
    pub platform: PlatformConfig,
    /// Receives every status report when set; logged otherwise
    pub status_webhook: Option<String>,
    pub status_webhook_timeout: Duration,
    pub status_webhook_retries: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Config {
            platform: PlatformConfig::from_env()
                .map_err(|e| ConfigError::Platform(e.to_string()))?,
            status_webhook: env::var("JOBPLANE_STATUS_WEBHOOK").ok(),
            status_webhook_timeout: Duration::from_millis(
                env::var("JOBPLANE_STATUS_WEBHOOK_TIMEOUT_MS")
                    .unwrap_or_else(|_| "5000".to_string())
                    .parse()
                    .map_err(|_| {
                        ConfigError::InvalidValue("JOBPLANE_STATUS_WEBHOOK_TIMEOUT_MS".to_string())
                    })?,
            ),
            status_webhook_retries: env::var("JOBPLANE_STATUS_WEBHOOK_RETRIES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .map_err(|_| {
                    ConfigError::InvalidValue("JOBPLANE_STATUS_WEBHOOK_RETRIES".to_string())
                })?,
        })
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue(String),
    Platform(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(var) => write!(f, "Invalid value for: {}", var),
            ConfigError::Platform(msg) => write!(f, "Invalid platform configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
