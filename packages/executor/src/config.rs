use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How workers reach object storage and the status callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerTransport {
    /// Through the in-process gateway and status intake.
    #[default]
    Local,
    /// Through the public HTTP surface, as a worker in another process would.
    Http,
}

impl FromStr for WorkerTransport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(WorkerTransport::Local),
            "http" => Ok(WorkerTransport::Http),
            other => Err(format!("unknown worker transport: {}", other)),
        }
    }
}

impl fmt::Display for WorkerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerTransport::Local => f.write_str("local"),
            WorkerTransport::Http => f.write_str("http"),
        }
    }
}

/// Configuration for the worker pool and its authorization policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum number of concurrently running workers
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Workers kept idle for instant assignment
    #[serde(default = "default_prewarm")]
    pub prewarm: usize,
    /// Delay paid by assignments that find no pre-warmed worker (milliseconds)
    #[serde(default = "default_cold_start_ms")]
    pub cold_start_ms: u64,
    /// CIDR ranges the dispatcher may connect from
    #[serde(default = "default_allowed_networks")]
    pub allowed_networks: Vec<String>,
    /// One-time code step (seconds)
    #[serde(default = "default_totp_step_secs")]
    pub totp_step_secs: u64,
    /// One-time code length
    #[serde(default = "default_totp_digits")]
    pub totp_digits: u32,
    /// Steps of clock drift accepted on either side
    #[serde(default = "default_totp_drift_steps")]
    pub totp_drift_steps: u32,
    /// Timeout for status callback HTTP requests (milliseconds)
    #[serde(default = "default_callback_timeout_ms")]
    pub callback_timeout_ms: u64,
    /// Number of retries for failed callback requests
    #[serde(default = "default_callback_retries")]
    pub callback_retries: u32,
    #[serde(default)]
    pub transport: WorkerTransport,
    /// Timeout for object transfers over HTTP (milliseconds)
    #[serde(default = "default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
}

fn default_capacity() -> usize {
    8
}
fn default_prewarm() -> usize {
    2
}
fn default_cold_start_ms() -> u64 {
    250
}
fn default_allowed_networks() -> Vec<String> {
    vec!["127.0.0.0/8".to_string(), "::1/128".to_string()]
}
fn default_totp_step_secs() -> u64 {
    30
}
fn default_totp_digits() -> u32 {
    6
}
fn default_totp_drift_steps() -> u32 {
    1
}
fn default_callback_timeout_ms() -> u64 {
    5000
}
fn default_callback_retries() -> u32 {
    3
}
fn default_transfer_timeout_ms() -> u64 {
    30_000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            prewarm: default_prewarm(),
            cold_start_ms: default_cold_start_ms(),
            allowed_networks: default_allowed_networks(),
            totp_step_secs: default_totp_step_secs(),
            totp_digits: default_totp_digits(),
            totp_drift_steps: default_totp_drift_steps(),
            callback_timeout_ms: default_callback_timeout_ms(),
            callback_retries: default_callback_retries(),
            transport: WorkerTransport::default(),
            transfer_timeout_ms: default_transfer_timeout_ms(),
        }
    }
}

impl WorkerConfig {
    pub fn cold_start_delay(&self) -> Duration {
        Duration::from_millis(self.cold_start_ms)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_parses_case_insensitively() {
        assert_eq!("HTTP".parse::<WorkerTransport>(), Ok(WorkerTransport::Http));
        assert_eq!("local".parse::<WorkerTransport>(), Ok(WorkerTransport::Local));
        assert!("grpc".parse::<WorkerTransport>().is_err());
    }

    #[test]
    fn missing_transport_defaults_to_local() {
        let config: WorkerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.transport, WorkerTransport::Local);
        assert_eq!(config.transfer_timeout(), Duration::from_secs(30));
    }
}
