use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use thiserror::Error;

use crate::sqlite::configure_connection;

const ASSET_SCHEMA: &str = include_str!("../../sql/assets.sql");

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to open catalog database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on catalog database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("catalog path not configured")]
    MissingStore,
    #[error("invalid processing status: {0}")]
    InvalidStatus(String),
    #[error("asset not found: {0}")]
    NotFound(String),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    Pending,
    Uploading,
    Processing,
    Ready,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Uploading => "uploading",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Ready => "ready",
            ProcessingStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "uploading" => Ok(Self::Uploading),
            "processing" => Ok(Self::Processing),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            other => Err(CatalogError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaAsset {
    pub asset_id: String,
    pub title: Option<String>,
    pub price_cents: i64,
    pub source_key: Option<String>,
    pub processing_status: ProcessingStatus,
    pub processing_progress: Option<i64>,
    pub processing_error: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub manifest_path: Option<String>,
    pub available_qualities: Vec<String>,
}

impl MediaAsset {
    pub fn new(asset_id: impl Into<String>, price_cents: i64) -> Self {
        Self {
            asset_id: asset_id.into(),
            title: None,
            price_cents,
            source_key: None,
            processing_status: ProcessingStatus::Pending,
            processing_progress: None,
            processing_error: None,
            processing_started_at: None,
            processing_completed_at: None,
            manifest_path: None,
            available_qualities: Vec::new(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.price_cents == 0
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let qualities: Option<String> = row.get("available_qualities")?;
        Ok(Self {
            asset_id: row.get("asset_id")?,
            title: row.get("title")?,
            price_cents: row.get("price_cents")?,
            source_key: row.get("source_key")?,
            processing_status: row
                .get::<_, String>("processing_status")?
                .parse()
                .unwrap_or(ProcessingStatus::Pending),
            processing_progress: row.get("processing_progress")?,
            processing_error: row.get("processing_error")?,
            processing_started_at: parse_timestamp(row.get("processing_started_at")?),
            processing_completed_at: parse_timestamp(row.get("processing_completed_at")?),
            manifest_path: row.get("manifest_path")?,
            available_qualities: qualities
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Entitlement {
    pub asset_id: String,
    pub viewer_id: String,
    pub paid_through: Option<DateTime<Utc>>,
}

/// Read/write boundary with the platform metadata store. Only processing
/// fields are written through this trait; identity and pricing are owned
/// elsewhere.
#[async_trait]
pub trait AssetCatalog: Send + Sync {
    async fn get_asset(&self, asset_id: &str) -> CatalogResult<Option<MediaAsset>>;

    async fn mark_processing(&self, asset_id: &str) -> CatalogResult<()>;

    async fn update_progress(&self, asset_id: &str, percent: i64) -> CatalogResult<()>;

    async fn mark_ready(
        &self,
        asset_id: &str,
        manifest_path: &str,
        qualities: &[String],
    ) -> CatalogResult<()>;

    async fn mark_failed(&self, asset_id: &str, message: &str) -> CatalogResult<()>;
}

/// Read-only view of purchase state. A `paid_through` of `None` on a present
/// record means unlimited access; a missing record denies paid assets.
#[async_trait]
pub trait EntitlementOracle: Send + Sync {
    async fn get_entitlement(
        &self,
        asset_id: &str,
        viewer_id: &str,
    ) -> CatalogResult<Option<Entitlement>>;
}

#[derive(Debug, Clone)]
pub struct SqliteAssetStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteAssetStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteAssetStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> CatalogResult<SqliteAssetStore> {
        let path = self.path.ok_or(CatalogError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteAssetStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteAssetStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteAssetStore {
    pub fn builder() -> SqliteAssetStoreBuilder {
        SqliteAssetStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> CatalogResult<Self> {
        SqliteAssetStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> CatalogResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            CatalogError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| CatalogError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> CatalogResult<()> {
        let conn = self.open()?;
        conn.execute_batch(ASSET_SCHEMA)?;
        Ok(())
    }

    pub fn upsert_asset(&self, asset: &MediaAsset) -> CatalogResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO media_assets (
                asset_id, title, price_cents, source_key, processing_status,
                processing_progress, processing_error, manifest_path,
                available_qualities, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, CURRENT_TIMESTAMP)
            ON CONFLICT(asset_id) DO UPDATE SET
                title = excluded.title,
                price_cents = excluded.price_cents,
                source_key = excluded.source_key,
                processing_status = excluded.processing_status,
                processing_progress = excluded.processing_progress,
                processing_error = excluded.processing_error,
                manifest_path = excluded.manifest_path,
                available_qualities = excluded.available_qualities,
                updated_at = CURRENT_TIMESTAMP",
            params![
                &asset.asset_id,
                &asset.title,
                asset.price_cents,
                &asset.source_key,
                asset.processing_status.as_str(),
                &asset.processing_progress,
                &asset.processing_error,
                &asset.manifest_path,
                serde_json::to_string(&asset.available_qualities).unwrap_or_default(),
            ],
        )?;
        Ok(())
    }

    pub fn grant_entitlement(
        &self,
        asset_id: &str,
        viewer_id: &str,
        paid_through: Option<DateTime<Utc>>,
    ) -> CatalogResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO entitlements (asset_id, viewer_id, paid_through)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(asset_id, viewer_id) DO UPDATE SET
                paid_through = excluded.paid_through",
            params![asset_id, viewer_id, paid_through.map(|dt| dt.naive_utc())],
        )?;
        Ok(())
    }

    pub fn fetch_asset(&self, asset_id: &str) -> CatalogResult<Option<MediaAsset>> {
        let conn = self.open()?;
        let asset = conn
            .query_row(
                "SELECT * FROM media_assets WHERE asset_id = ?1",
                [asset_id],
                MediaAsset::from_row,
            )
            .optional()?;
        Ok(asset)
    }

    fn expect_updated(affected: usize, asset_id: &str) -> CatalogResult<()> {
        if affected == 0 {
            return Err(CatalogError::NotFound(asset_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AssetCatalog for SqliteAssetStore {
    async fn get_asset(&self, asset_id: &str) -> CatalogResult<Option<MediaAsset>> {
        self.fetch_asset(asset_id)
    }

    async fn mark_processing(&self, asset_id: &str) -> CatalogResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE media_assets SET
                processing_status = 'processing',
                processing_progress = 0,
                processing_error = NULL,
                processing_started_at = CURRENT_TIMESTAMP,
                updated_at = CURRENT_TIMESTAMP
             WHERE asset_id = ?1",
            [asset_id],
        )?;
        Self::expect_updated(affected, asset_id)
    }

    async fn update_progress(&self, asset_id: &str, percent: i64) -> CatalogResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE media_assets SET
                processing_progress = ?1,
                updated_at = CURRENT_TIMESTAMP
             WHERE asset_id = ?2",
            params![percent, asset_id],
        )?;
        Self::expect_updated(affected, asset_id)
    }

    async fn mark_ready(
        &self,
        asset_id: &str,
        manifest_path: &str,
        qualities: &[String],
    ) -> CatalogResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE media_assets SET
                processing_status = 'ready',
                processing_progress = 100,
                processing_error = NULL,
                processing_completed_at = CURRENT_TIMESTAMP,
                manifest_path = ?1,
                available_qualities = ?2,
                updated_at = CURRENT_TIMESTAMP
             WHERE asset_id = ?3",
            params![
                manifest_path,
                serde_json::to_string(qualities).unwrap_or_default(),
                asset_id
            ],
        )?;
        Self::expect_updated(affected, asset_id)
    }

    async fn mark_failed(&self, asset_id: &str, message: &str) -> CatalogResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE media_assets SET
                processing_status = 'failed',
                processing_error = ?1,
                updated_at = CURRENT_TIMESTAMP
             WHERE asset_id = ?2",
            params![message, asset_id],
        )?;
        Self::expect_updated(affected, asset_id)
    }
}

#[async_trait]
impl EntitlementOracle for SqliteAssetStore {
    async fn get_entitlement(
        &self,
        asset_id: &str,
        viewer_id: &str,
    ) -> CatalogResult<Option<Entitlement>> {
        let conn = self.open()?;
        let entitlement = conn
            .query_row(
                "SELECT asset_id, viewer_id, paid_through FROM entitlements
                 WHERE asset_id = ?1 AND viewer_id = ?2",
                [asset_id, viewer_id],
                |row| {
                    Ok(Entitlement {
                        asset_id: row.get(0)?,
                        viewer_id: row.get(1)?,
                        paid_through: parse_timestamp(row.get(2)?),
                    })
                },
            )
            .optional()?;
        Ok(entitlement)
    }
}

fn parse_timestamp(value: Option<NaiveDateTime>) -> Option<DateTime<Utc>> {
    value.map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
}
