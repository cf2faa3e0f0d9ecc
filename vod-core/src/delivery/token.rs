use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("hmac error")]
    Hmac,
    #[error("token expired")]
    TokenExpired,
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("malformed token: {0}")]
    Malformed(String),
}

/// Claims carried by a stream access token. The token is self-contained:
/// the edge verifies it with the shared secret alone, no store lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub asset_id: String,
    pub viewer_id: Option<String>,
    pub allow_download: bool,
    pub expires_at: DateTime<Utc>,
}

/// HMAC-SHA256 signer for access tokens and time-boxed URLs.
pub struct UrlSigner {
    secret: Vec<u8>,
}

impl UrlSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn from_secret_file(path: impl AsRef<Path>) -> Result<Self, TokenError> {
        let secret = std::fs::read(path.as_ref())?;
        Ok(Self { secret })
    }

    /// Encodes the claims as `base64url(payload).base64url(mac)`.
    pub fn issue(&self, claims: &AccessClaims) -> Result<String, TokenError> {
        let payload = serde_json::to_vec(claims)
            .map_err(|err| TokenError::Malformed(err.to_string()))?;
        let mac = self.mac(&payload)?;
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(mac)
        ))
    }

    /// Pure verification: signature first, then expiry. No I/O.
    pub fn verify(&self, token: &str) -> Result<AccessClaims, TokenError> {
        let (payload_part, mac_part) = token
            .split_once('.')
            .ok_or_else(|| TokenError::Malformed("missing signature separator".into()))?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_part)
            .map_err(|err| TokenError::Malformed(err.to_string()))?;
        let provided = URL_SAFE_NO_PAD
            .decode(mac_part)
            .map_err(|err| TokenError::Malformed(err.to_string()))?;
        let expected = self.mac(&payload)?;
        if expected != provided {
            return Err(TokenError::InvalidSignature);
        }
        let claims: AccessClaims = serde_json::from_slice(&payload)
            .map_err(|err| TokenError::Malformed(err.to_string()))?;
        if claims.expires_at < Utc::now() {
            return Err(TokenError::TokenExpired);
        }
        Ok(claims)
    }

    /// Appends `exp`/`sig` query parameters so the URL is independently
    /// verifiable until the expiry.
    pub fn signed_url(
        &self,
        base_url: &str,
        path: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        // A trailing slash keeps Url::join from eating the last base segment.
        let base = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))
            .map_err(|err| TokenError::Malformed(format!("invalid base url: {err}")))?;
        let mut url = base
            .join(path.trim_start_matches('/'))
            .map_err(|err| TokenError::Malformed(format!("invalid resource path: {err}")))?;
        let signature = self.sign_path(path, expires_at)?;
        url.query_pairs_mut()
            .append_pair("exp", &expires_at.timestamp().to_string())
            .append_pair("sig", &signature);
        Ok(url.to_string())
    }

    pub fn sign_path(&self, path: &str, expires_at: DateTime<Utc>) -> Result<String, TokenError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| TokenError::Hmac)?;
        mac.update(path.trim_start_matches('/').as_bytes());
        mac.update(b":");
        mac.update(expires_at.timestamp().to_string().as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    pub fn verify_path(
        &self,
        path: &str,
        expires_at: DateTime<Utc>,
        signature: &str,
    ) -> Result<(), TokenError> {
        if expires_at < Utc::now() {
            return Err(TokenError::TokenExpired);
        }
        let expected = self.sign_path(path, expires_at)?;
        if expected != signature {
            return Err(TokenError::InvalidSignature);
        }
        Ok(())
    }

    fn mac(&self, payload: &[u8]) -> Result<Vec<u8>, TokenError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| TokenError::Hmac)?;
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}
