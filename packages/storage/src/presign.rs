//! Pre-signed object URLs.
//!
//! A URL grants exactly one operation on exactly one object until an explicit
//! expiry:
//!
//! ```text
//! {base}/objects/{path}?op={read|write}&exp={unix_seconds}&sig={base64url(hmac)}
//! ```
//!
//! The signature is HMAC-SHA256 over `"{op}\n{path}\n{exp}"`. Verification
//! checks the signature first, then the operation, then the expiry, so a
//! tampered expiry is reported as denied rather than expired.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use jobplane_types::chrono::{DateTime, Utc};
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;

use crate::error::TransferError;

type HmacSha256 = Hmac<Sha256>;

pub const OBJECTS_PREFIX: &str = "/objects/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
        }
    }

    pub fn parse(value: &str) -> Result<Self, TransferError> {
        match value {
            "read" => Ok(Operation::Read),
            "write" => Ok(Operation::Write),
            other => Err(TransferError::Malformed(format!("unknown operation '{}'", other))),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A time-boxed, operation-scoped grant on a single object.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresignedUrl {
    pub url: String,
    pub path: String,
    pub operation: Operation,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for PresignedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The signature is a bearer capability; keep it out of logs.
        f.debug_struct("PresignedUrl")
            .field("path", &self.path)
            .field("operation", &self.operation)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// The signed components of a pre-signed URL, as received over the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct SignedQuery {
    pub op: String,
    pub exp: i64,
    pub sig: String,
}

#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
    base_url: String,
}

impl fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlSigner")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(secret: impl Into<Vec<u8>>, base_url: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Signer with a random 256-bit secret, for single-process deployments.
    pub fn with_random_secret(base_url: impl Into<String>) -> Result<Self, TransferError> {
        let mut secret = [0u8; 32];
        getrandom::fill(&mut secret)
            .map_err(|e| TransferError::Transport(format!("Failed to generate secret: {}", e)))?;
        Ok(Self::new(secret.to_vec(), base_url))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn mac(&self, op: &str, path: &str, exp: i64) -> HmacSha256 {
        // HMAC accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC-SHA256 accepts any key length"));
        mac.update(op.as_bytes());
        mac.update(b"\n");
        mac.update(path.as_bytes());
        mac.update(b"\n");
        mac.update(exp.to_string().as_bytes());
        mac
    }

    pub fn sign(&self, path: &Path, operation: Operation, expires_at: DateTime<Utc>) -> PresignedUrl {
        let exp = expires_at.timestamp();
        let signature = self.mac(operation.as_str(), path.as_ref(), exp).finalize();
        let sig = URL_SAFE_NO_PAD.encode(signature.into_bytes());

        let encoded_path = path
            .as_ref()
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");

        let url = format!(
            "{}{}{}?op={}&exp={}&sig={}",
            self.base_url,
            OBJECTS_PREFIX,
            encoded_path,
            operation.as_str(),
            exp,
            sig
        );

        PresignedUrl {
            url,
            path: path.to_string(),
            operation,
            expires_at: DateTime::from_timestamp(exp, 0).unwrap_or(expires_at),
        }
    }

    /// Verify already-split URL components against the operation the caller
    /// is attempting. Returns the object path the grant is bound to.
    pub fn verify_parts(
        &self,
        raw_path: &str,
        query: &SignedQuery,
        attempted: Operation,
        now: DateTime<Utc>,
    ) -> Result<Path, TransferError> {
        let path = Path::parse(raw_path)
            .map_err(|e| TransferError::InvalidLocator(e.to_string()))?;

        let sig = URL_SAFE_NO_PAD
            .decode(&query.sig)
            .map_err(|_| TransferError::AccessDenied("invalid signature encoding".into()))?;

        self.mac(&query.op, path.as_ref(), query.exp)
            .verify_slice(&sig)
            .map_err(|_| TransferError::AccessDenied("signature mismatch".into()))?;

        let granted = Operation::parse(&query.op)?;
        if granted != attempted {
            return Err(TransferError::AccessDenied(format!(
                "URL grants {} but {} was attempted",
                granted, attempted
            )));
        }

        if now.timestamp() >= query.exp {
            return Err(TransferError::AccessExpired);
        }

        Ok(path)
    }

    /// Verify a complete URL string as produced by [`UrlSigner::sign`].
    pub fn verify(
        &self,
        url: &str,
        attempted: Operation,
        now: DateTime<Utc>,
    ) -> Result<Path, TransferError> {
        let (raw_path, query) = split_url(url)?;
        self.verify_parts(&raw_path, &query, attempted, now)
    }
}

/// Split a pre-signed URL into its decoded object path and signed query.
pub fn split_url(url: &str) -> Result<(String, SignedQuery), TransferError> {
    let (location, query) = url
        .split_once('?')
        .ok_or_else(|| TransferError::Malformed("missing query".into()))?;

    let start = location
        .find(OBJECTS_PREFIX)
        .ok_or_else(|| TransferError::Malformed("missing object path".into()))?;
    let encoded_path = &location[start + OBJECTS_PREFIX.len()..];

    let mut segments = Vec::new();
    for segment in encoded_path.split('/') {
        let decoded = urlencoding::decode(segment)
            .map_err(|e| TransferError::Malformed(format!("bad path encoding: {}", e)))?;
        segments.push(decoded.into_owned());
    }

    let mut op = None;
    let mut exp = None;
    let mut sig = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("op", value)) => op = Some(value.to_string()),
            Some(("exp", value)) => {
                exp = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| TransferError::Malformed("bad expiry".into()))?,
                )
            }
            Some(("sig", value)) => sig = Some(value.to_string()),
            _ => {}
        }
    }

    match (op, exp, sig) {
        (Some(op), Some(exp), Some(sig)) => Ok((segments.join("/"), SignedQuery { op, exp, sig })),
        _ => Err(TransferError::Malformed("missing op, exp or sig".into())),
    }
}
