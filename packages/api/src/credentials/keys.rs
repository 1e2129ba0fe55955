//! ES256 signing material for access tokens.
//!
//! The keypair is injected at deploy time so that every control-plane
//! instance signs with the same key:
//!
//! - `JOBPLANE_SIGNING_KEY`: base64-encoded PKCS#8 PEM private key (P-256)
//! - `JOBPLANE_SIGNING_PUB`: base64-encoded PEM public key (P-256)
//! - `JOBPLANE_SIGNING_KID`: key identifier (defaults to `jobplane-es256-v1`)
//!
//! Without them a key is generated in-process, which only suits a single
//! instance.

use jobplane_types::base64::Engine;
use jobplane_types::base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use jsonwebtoken::{DecodingKey, EncodingKey};
use p256::{
    PublicKey, SecretKey,
    elliptic_curve::sec1::ToEncodedPoint,
    pkcs8::{DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding},
};
use serde::{Deserialize, Serialize};

use super::CredentialError;

pub const SIGNING_KEY_ENV: &str = "JOBPLANE_SIGNING_KEY";
pub const SIGNING_PUB_ENV: &str = "JOBPLANE_SIGNING_PUB";
pub const SIGNING_KID_ENV: &str = "JOBPLANE_SIGNING_KID";

const DEFAULT_KID: &str = "jobplane-es256-v1";

/// Public key in JWK form, as published in the JWKS document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    pub alg: String,
    pub kid: String,
    #[serde(rename = "use")]
    pub r#use: String,
}

impl Jwk {
    pub fn decoding_key(&self) -> Result<DecodingKey, CredentialError> {
        DecodingKey::from_ec_components(&self.x, &self.y)
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

#[derive(Clone)]
pub struct SigningKey {
    kid: String,
    encoding: EncodingKey,
    jwk: Jwk,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    pub fn from_pem(
        kid: impl Into<String>,
        private_pem: &[u8],
        public_pem: &[u8],
    ) -> Result<Self, CredentialError> {
        let kid = kid.into();
        let encoding = EncodingKey::from_ec_pem(private_pem)
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;

        let pem = String::from_utf8_lossy(public_pem);
        let public = PublicKey::from_public_key_pem(&pem)
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
        let jwk = public_jwk(&kid, &public)?;

        Ok(Self { kid, encoding, jwk })
    }

    /// Generate a fresh P-256 keypair.
    pub fn generate(kid: impl Into<String>) -> Result<Self, CredentialError> {
        let secret = loop {
            let mut bytes = [0u8; 32];
            getrandom::fill(&mut bytes)
                .map_err(|e| CredentialError::InvalidKey(format!("entropy unavailable: {}", e)))?;
            // Out-of-range scalars are rejected; draw again.
            if let Ok(secret) = SecretKey::from_slice(&bytes) {
                break secret;
            }
        };

        let private_pem = secret
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
        let public_pem = secret
            .public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;

        Self::from_pem(kid, private_pem.as_bytes(), public_pem.as_bytes())
    }

    /// Load the keypair from the environment. `Ok(None)` when unset.
    pub fn from_env() -> Result<Option<Self>, CredentialError> {
        let (Ok(private_b64), Ok(public_b64)) =
            (std::env::var(SIGNING_KEY_ENV), std::env::var(SIGNING_PUB_ENV))
        else {
            return Ok(None);
        };

        let private_pem = STANDARD
            .decode(private_b64.trim())
            .map_err(|_| CredentialError::InvalidKey(format!("{} is not base64", SIGNING_KEY_ENV)))?;
        let public_pem = STANDARD
            .decode(public_b64.trim())
            .map_err(|_| CredentialError::InvalidKey(format!("{} is not base64", SIGNING_PUB_ENV)))?;
        let kid = std::env::var(SIGNING_KID_ENV).unwrap_or_else(|_| DEFAULT_KID.to_string());

        Self::from_pem(kid, &private_pem, &public_pem).map(Some)
    }

    pub fn from_env_or_generate() -> Result<Self, CredentialError> {
        match Self::from_env()? {
            Some(key) => Ok(key),
            None => {
                tracing::warn!(
                    "{} not set; generating an ephemeral signing key for this process",
                    SIGNING_KEY_ENV
                );
                Self::generate(DEFAULT_KID)
            }
        }
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn jwk(&self) -> &Jwk {
        &self.jwk
    }

    pub(crate) fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }
}

fn public_jwk(kid: &str, public: &PublicKey) -> Result<Jwk, CredentialError> {
    let encoded = public.to_encoded_point(false);
    let x = encoded
        .x()
        .ok_or_else(|| CredentialError::InvalidKey("Missing X coord".to_string()))?;
    let y = encoded
        .y()
        .ok_or_else(|| CredentialError::InvalidKey("Missing Y coord".to_string()))?;

    Ok(Jwk {
        kty: "EC".to_string(),
        crv: "P-256".to_string(),
        x: URL_SAFE_NO_PAD.encode(x),
        y: URL_SAFE_NO_PAD.encode(y),
        alg: "ES256".to_string(),
        kid: kid.to_string(),
        r#use: "sig".to_string(),
    })
}
