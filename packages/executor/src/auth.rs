//! Two-factor authorization of the dispatcher towards the worker pool.
//!
//! Both factors are evaluated on every request and both must hold:
//!
//! 1. the request originates from an allow-listed network, and
//! 2. it carries a time-based one-time code derived from the shared secret
//!    (HMAC-SHA256, dynamic truncation) for the current step, within the
//!    configured drift.
//!
//! The result is a tagged [`Authorization`]; denials are values, not errors.

use hmac::{Hmac, Mac};
use ipnetwork::IpNetwork;
use jobplane_types::chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::net::IpAddr;

use crate::config::WorkerConfig;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct Totp {
    secret: Vec<u8>,
    step_secs: u64,
    digits: u32,
    drift_steps: u32,
}

impl fmt::Debug for Totp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Totp")
            .field("step_secs", &self.step_secs)
            .field("digits", &self.digits)
            .field("drift_steps", &self.drift_steps)
            .finish_non_exhaustive()
    }
}

impl Totp {
    pub fn new(secret: impl Into<Vec<u8>>, step_secs: u64, digits: u32, drift_steps: u32) -> Self {
        Self {
            secret: secret.into(),
            step_secs: step_secs.max(1),
            digits: digits.clamp(6, 9),
            drift_steps,
        }
    }

    pub fn from_config(secret: impl Into<Vec<u8>>, config: &WorkerConfig) -> Self {
        Self::new(
            secret,
            config.totp_step_secs,
            config.totp_digits,
            config.totp_drift_steps,
        )
    }

    /// Fresh random shared secret.
    pub fn generate_secret() -> Result<Vec<u8>, getrandom::Error> {
        let mut secret = vec![0u8; 32];
        getrandom::fill(&mut secret)?;
        Ok(secret)
    }

    pub fn step_duration(&self) -> Duration {
        Duration::seconds(self.step_secs as i64)
    }

    pub fn step_at(&self, at: DateTime<Utc>) -> u64 {
        (at.timestamp().max(0) as u64) / self.step_secs
    }

    /// Start of the step following the one `at` falls in.
    pub fn step_end(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let next = (self.step_at(at) + 1) * self.step_secs;
        DateTime::from_timestamp(next as i64, 0).unwrap_or(at + self.step_duration())
    }

    fn code_for_step(&self, step: u64) -> String {
        // HMAC accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC-SHA256 accepts any key length"));
        mac.update(&step.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let binary = ((digest[offset] as u32 & 0x7f) << 24)
            | ((digest[offset + 1] as u32) << 16)
            | ((digest[offset + 2] as u32) << 8)
            | (digest[offset + 3] as u32);
        let code = binary % 10u32.pow(self.digits);

        format!("{:0width$}", code, width = self.digits as usize)
    }

    pub fn code_at(&self, at: DateTime<Utc>) -> String {
        self.code_for_step(self.step_at(at))
    }

    pub fn verify(&self, code: &str, at: DateTime<Utc>) -> bool {
        let current = self.step_at(at);
        let drift = self.drift_steps as u64;
        let first = current.saturating_sub(drift);

        // Every candidate is compared so timing does not reveal the step.
        (first..=current + drift).fold(false, |matched, step| {
            constant_time_eq(self.code_for_step(step).as_bytes(), code.as_bytes()) | matched
        })
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Credentials the dispatcher presents to the worker pool.
#[derive(Clone, Serialize, Deserialize)]
pub struct WorkerAuth {
    pub source_ip: IpAddr,
    pub code: String,
    /// Instant the code was derived for
    pub timestamp: DateTime<Utc>,
}

impl fmt::Debug for WorkerAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerAuth")
            .field("source_ip", &self.source_ip)
            .field("code", &"******")
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

impl WorkerAuth {
    pub fn generate(totp: &Totp, source_ip: IpAddr, now: DateTime<Utc>) -> Self {
        Self {
            source_ip,
            code: totp.code_at(now),
            timestamp: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    OriginNotAllowed,
    InvalidCode,
    /// Neither factor held
    OriginAndCode,
    /// The presented timestamp is outside the accepted drift
    StaleTimestamp,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DenialReason::OriginNotAllowed => "source address not in allow-list",
            DenialReason::InvalidCode => "invalid one-time code",
            DenialReason::OriginAndCode => "source address and one-time code rejected",
            DenialReason::StaleTimestamp => "authorization timestamp outside window",
        };
        f.write_str(text)
    }
}

/// Capability handed out by the pool after a successful authorization.
/// Valid until the end of the one-time-code step it was issued in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolGrant {
    pub grant_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Authorized(PoolGrant),
    Denied(DenialReason),
}

impl Authorization {
    pub fn is_authorized(&self) -> bool {
        matches!(self, Authorization::Authorized(_))
    }
}

#[derive(Debug, Clone)]
pub struct WorkerAuthPolicy {
    allowed: Vec<IpNetwork>,
    totp: Totp,
}

impl WorkerAuthPolicy {
    pub fn new(allowed: Vec<IpNetwork>, totp: Totp) -> Self {
        Self { allowed, totp }
    }

    /// Build from configured CIDR strings. Unparseable ranges are skipped with
    /// a warning, so a typo narrows the allow-list instead of widening it.
    pub fn from_config(config: &WorkerConfig, secret: impl Into<Vec<u8>>) -> Self {
        let allowed = config
            .allowed_networks
            .iter()
            .filter_map(|range| match range.parse::<IpNetwork>() {
                Ok(network) => Some(network),
                Err(e) => {
                    tracing::warn!(range = %range, error = %e, "Ignoring invalid allow-list entry");
                    None
                }
            })
            .collect();
        Self::new(allowed, Totp::from_config(secret, config))
    }

    pub fn totp(&self) -> &Totp {
        &self.totp
    }

    pub fn origin_allowed(&self, ip: IpAddr) -> bool {
        self.allowed.iter().any(|network| network.contains(ip))
    }

    /// Evaluate both factors. Returns the denial reason, or `None` when the
    /// conjunction holds.
    pub fn check(&self, auth: &WorkerAuth, now: DateTime<Utc>) -> Option<DenialReason> {
        let origin_ok = self.origin_allowed(auth.source_ip);
        let code_ok = self.totp.verify(&auth.code, now);

        let window = self.totp.step_duration() * (self.totp.drift_steps as i32 + 1);
        let timestamp_ok = (now - auth.timestamp).abs() <= window;

        match (origin_ok, code_ok, timestamp_ok) {
            (true, true, true) => None,
            (false, false, _) => Some(DenialReason::OriginAndCode),
            (false, true, _) => Some(DenialReason::OriginNotAllowed),
            (true, false, _) => Some(DenialReason::InvalidCode),
            (true, true, false) => Some(DenialReason::StaleTimestamp),
        }
    }
}
