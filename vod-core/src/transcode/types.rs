use std::path::PathBuf;

use serde::Serialize;

use crate::config::RungEntry;

/// Media facts extracted from the source before any encoding decision.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: Option<u32>,
}

/// One quality/bitrate variant in the adaptive ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityRung {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
}

impl QualityRung {
    pub fn bandwidth_bits(&self) -> u64 {
        u64::from(self.video_bitrate_kbps + self.audio_bitrate_kbps) * 1000
    }

    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

impl From<&RungEntry> for QualityRung {
    fn from(entry: &RungEntry) -> Self {
        Self {
            name: entry.name.clone(),
            width: entry.width,
            height: entry.height,
            video_bitrate_kbps: entry.video_bitrate_kbps,
            audio_bitrate_kbps: entry.audio_bitrate_kbps,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Download,
    Probe,
    Transcode,
    Manifest,
    Publish,
    Finalize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Setup => "setup",
            Stage::Download => "download",
            Stage::Probe => "probe",
            Stage::Transcode => "transcode",
            Stage::Manifest => "manifest",
            Stage::Publish => "publish",
            Stage::Finalize => "finalize",
        }
    }
}

/// Working tree for one job attempt, exclusively owned by its worker.
#[derive(Debug, Clone)]
pub struct WorkDirs {
    pub root: PathBuf,
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl WorkDirs {
    pub fn new(root: PathBuf) -> Self {
        let source_dir = root.join("source");
        let output_dir = root.join("out");
        Self {
            root,
            source_dir,
            output_dir,
        }
    }

    pub fn source_file(&self, source_key: &str) -> PathBuf {
        let name = source_key.rsplit('/').next().unwrap_or("input");
        self.source_dir.join(format!("input_{name}"))
    }
}

#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub rung: QualityRung,
    pub segment_seconds: u32,
    pub gop_frames: u32,
    pub preset: String,
    pub source_duration_seconds: f64,
}

#[derive(Debug, Clone)]
pub struct RungArtifacts {
    pub rung: QualityRung,
    pub playlist: PathBuf,
    pub segment_count: usize,
}
