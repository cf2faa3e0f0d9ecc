use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VodConfig {
    pub system: SystemSection,
    pub paths: PathsSection,
    pub limits: LimitsSection,
}

impl VodConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub node_name: String,
    pub node_role: String,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub data_dir: String,
    pub work_dir: String,
    pub storage_dir: String,
    pub logs_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    pub max_upload_bytes: u64,
    pub min_part_bytes: u64,
    pub max_part_bytes: u64,
    pub session_ttl_hours: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub ingest: IngestSection,
    pub queue: QueueSection,
    pub transcode: TranscodeSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestSection {
    pub allowed_content_types: Vec<String>,
    pub default_part_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSection {
    pub concurrency: u32,
    pub max_attempts: u32,
    pub backoff_base_seconds: u64,
    pub backoff_cap_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub stall_timeout_seconds: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscodeSection {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub segment_seconds: u32,
    pub gop_frames: u32,
    pub preset: String,
    pub rungs: Vec<RungEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RungEntry {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    pub signing: SigningSection,
    pub cdn: CdnSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SigningSection {
    pub token_secret_path: String,
    pub default_ttl_minutes: u64,
    pub segment_ttl_minutes: u64,
    pub access_log_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CdnSection {
    pub api_base: String,
    pub zone_id: String,
    pub api_token_path: String,
    pub public_base_url: String,
    pub manifest_ttl_seconds: u64,
    pub segment_ttl_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub vod: VodConfig,
    pub pipeline: PipelineConfig,
    pub delivery: DeliveryConfig,
}

impl ConfigBundle {
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let vod = load_vod_config(dir.join("vod.toml"))?;
        let pipeline = load_pipeline_config(dir.join("pipeline.toml"))?;
        let delivery = load_delivery_config(dir.join("delivery.toml"))?;
        Ok(Self {
            vod,
            pipeline,
            delivery,
        })
    }
}

pub fn load_vod_config<P: AsRef<Path>>(path: P) -> Result<VodConfig> {
    load_toml(path)
}

pub fn load_pipeline_config<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
    load_toml(path)
}

pub fn load_delivery_config<P: AsRef<Path>>(path: P) -> Result<DeliveryConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
