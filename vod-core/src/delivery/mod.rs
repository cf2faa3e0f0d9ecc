mod cdn;
mod token;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::catalog::{AssetCatalog, CatalogError, EntitlementOracle, MediaAsset, ProcessingStatus};
use crate::config::DeliveryConfig;

pub use cdn::{CdnError, CdnPurger};
pub use token::{AccessClaims, TokenError, UrlSigner};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("asset not found: {0}")]
    NotFound(String),
    #[error("asset {0} is not ready for streaming")]
    NotReady(String),
    #[error("viewer authentication required for paid content")]
    AuthRequired,
    #[error("viewer has no access to this asset")]
    AccessDenied,
    #[error("viewer access to this asset has expired")]
    AccessExpired,
    #[error("token error: {0}")]
    Token(#[from] TokenError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("cdn purge failed: {0}")]
    Purge(#[from] CdnError),
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

#[derive(Debug, Clone, Serialize)]
pub struct StreamAccess {
    pub manifest_url: String,
    pub segments_base_url: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub qualities: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentAccess {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Entitlement-gated access resolution: free assets stream unconditionally,
/// paid assets require a live entitlement; grants are short-lived signed
/// URLs plus a self-contained access token.
pub struct DeliveryGate {
    catalog: Arc<dyn AssetCatalog>,
    oracle: Arc<dyn EntitlementOracle>,
    signer: UrlSigner,
    config: DeliveryConfig,
    purger: Option<CdnPurger>,
    access_log_path: PathBuf,
}

impl DeliveryGate {
    pub fn new(
        catalog: Arc<dyn AssetCatalog>,
        oracle: Arc<dyn EntitlementOracle>,
        signer: UrlSigner,
        config: DeliveryConfig,
    ) -> Self {
        let access_log_path = PathBuf::from(&config.signing.access_log_path);
        Self {
            catalog,
            oracle,
            signer,
            config,
            purger: None,
            access_log_path,
        }
    }

    pub fn with_purger(mut self, purger: CdnPurger) -> Self {
        self.purger = Some(purger);
        self
    }

    pub async fn resolve_stream_access(
        &self,
        asset_id: &str,
        viewer_id: Option<&str>,
        quality: Option<&str>,
        ttl: Option<Duration>,
    ) -> DeliveryResult<StreamAccess> {
        let (asset, manifest_path) = self.ready_asset(asset_id).await?;
        self.authorize(&asset, viewer_id).await?;

        let ttl = ttl
            .unwrap_or_else(|| Duration::minutes(self.config.signing.default_ttl_minutes as i64));
        let expires_at = Utc::now() + ttl;

        let claims = AccessClaims {
            asset_id: asset_id.to_string(),
            viewer_id: viewer_id.map(str::to_string),
            allow_download: false,
            expires_at,
        };
        let token = self.signer.issue(&claims)?;

        let base_path = manifest_parent(&manifest_path);
        let chosen_manifest = match quality {
            Some(quality)
                if asset
                    .available_qualities
                    .iter()
                    .any(|name| name == quality) =>
            {
                format!("{base_path}/{quality}/playlist.m3u8")
            }
            _ => manifest_path.clone(),
        };

        let base_url = &self.config.cdn.public_base_url;
        let manifest_url = self.signer.signed_url(base_url, &chosen_manifest, expires_at)?;
        let segments_base_url = self.signer.signed_url(base_url, &base_path, expires_at)?;

        self.append_access_log(asset_id, viewer_id, &token, expires_at);
        info!(asset_id, viewer = viewer_id.unwrap_or("anonymous"), "stream access granted");

        Ok(StreamAccess {
            manifest_url,
            segments_base_url,
            token,
            expires_at,
            qualities: asset.available_qualities,
        })
    }

    /// Same gate, scoped to one segment; used by clients that fetched the
    /// manifest once and request segments individually.
    pub async fn resolve_segment_access(
        &self,
        asset_id: &str,
        segment_path: &str,
        viewer_id: Option<&str>,
        ttl: Option<Duration>,
    ) -> DeliveryResult<SegmentAccess> {
        let (asset, manifest_path) = self.ready_asset(asset_id).await?;
        self.authorize(&asset, viewer_id).await?;

        let ttl = ttl
            .unwrap_or_else(|| Duration::minutes(self.config.signing.segment_ttl_minutes as i64));
        let expires_at = Utc::now() + ttl;
        let base_path = manifest_parent(&manifest_path);
        let path = format!("{base_path}/{}", segment_path.trim_start_matches('/'));
        let url = self
            .signer
            .signed_url(&self.config.cdn.public_base_url, &path, expires_at)?;
        Ok(SegmentAccess { url, expires_at })
    }

    /// Pure token check for the edge: no I/O, signature then expiry.
    pub fn verify_token(&self, token: &str) -> DeliveryResult<AccessClaims> {
        Ok(self.signer.verify(token)?)
    }

    /// Best-effort purge of the asset's manifest and segment prefix.
    pub async fn invalidate(&self, asset_id: &str) -> DeliveryResult<()> {
        let (_, manifest_path) = self.ready_asset(asset_id).await?;
        let base_path = manifest_parent(&manifest_path);
        let Some(purger) = &self.purger else {
            warn!(asset_id, "cdn purge skipped, no purge client configured");
            return Ok(());
        };
        purger
            .purge(&[manifest_path, format!("{base_path}/*")])
            .await?;
        Ok(())
    }

    async fn ready_asset(&self, asset_id: &str) -> DeliveryResult<(MediaAsset, String)> {
        let asset = self
            .catalog
            .get_asset(asset_id)
            .await?
            .ok_or_else(|| DeliveryError::NotFound(asset_id.to_string()))?;
        if asset.processing_status != ProcessingStatus::Ready {
            return Err(DeliveryError::NotReady(asset_id.to_string()));
        }
        let Some(manifest_path) = asset.manifest_path.clone() else {
            return Err(DeliveryError::NotReady(asset_id.to_string()));
        };
        Ok((asset, manifest_path))
    }

    async fn authorize(&self, asset: &MediaAsset, viewer_id: Option<&str>) -> DeliveryResult<()> {
        if asset.is_free() {
            return Ok(());
        }
        let viewer_id = viewer_id.ok_or(DeliveryError::AuthRequired)?;
        let entitlement = self
            .oracle
            .get_entitlement(&asset.asset_id, viewer_id)
            .await?
            .ok_or(DeliveryError::AccessDenied)?;
        if let Some(paid_through) = entitlement.paid_through {
            if paid_through < Utc::now() {
                return Err(DeliveryError::AccessExpired);
            }
        }
        Ok(())
    }

    fn append_access_log(
        &self,
        asset_id: &str,
        viewer_id: Option<&str>,
        token: &str,
        expires_at: DateTime<Utc>,
    ) {
        if let Some(parent) = self.access_log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let entry = AccessLogEntry {
            asset_id: asset_id.to_string(),
            viewer_id: viewer_id.map(str::to_string),
            token: token.to_string(),
            expires_at,
        };
        let Ok(json) = serde_json::to_string(&entry) else {
            return;
        };
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.access_log_path)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "{json}");
            }
            Err(error) => warn!(%error, "failed to append access log"),
        }
    }
}

fn manifest_parent(manifest_path: &str) -> String {
    manifest_path
        .rsplit_once('/')
        .map(|(parent, _)| parent.to_string())
        .unwrap_or_else(|| manifest_path.to_string())
}

#[derive(Debug, Serialize)]
struct AccessLogEntry {
    asset_id: String,
    viewer_id: Option<String>,
    token: String,
    expires_at: DateTime<Utc>,
}
