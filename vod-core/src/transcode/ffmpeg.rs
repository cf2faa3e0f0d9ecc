use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::error::{TranscodeError, TranscodeResult};
use super::types::{EncodeRequest, RungArtifacts, SourceInfo};

pub const RUNG_PLAYLIST_NAME: &str = "playlist.m3u8";

/// Extracts duration, resolution and bitrate from a local media file.
#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe(&self, input: &Path) -> TranscodeResult<SourceInfo>;
}

#[derive(Debug, Clone)]
pub struct FfprobeProber {
    binary: PathBuf,
}

impl FfprobeProber {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, input: &Path) -> TranscodeResult<SourceInfo> {
        let output = Command::new(&self.binary)
            .arg("-v")
            .arg("error")
            .arg("-show_format")
            .arg("-show_streams")
            .arg("-of")
            .arg("json")
            .arg(input)
            .output()
            .await
            .map_err(|err| TranscodeError::InvalidSource(format!("ffprobe failed to run: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TranscodeError::InvalidSource(format!(
                "ffprobe exited with {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|err| TranscodeError::InvalidSource(format!("unreadable probe output: {err}")))?;

        let video = parsed["streams"]
            .as_array()
            .and_then(|streams| {
                streams
                    .iter()
                    .find(|stream| stream["codec_type"].as_str() == Some("video"))
            })
            .ok_or_else(|| TranscodeError::InvalidSource("no video stream present".into()))?;

        let width = video["width"].as_u64().unwrap_or(0) as u32;
        let height = video["height"].as_u64().unwrap_or(0) as u32;
        if width == 0 || height == 0 {
            return Err(TranscodeError::InvalidSource(
                "video stream reports no resolution".into(),
            ));
        }

        let duration_seconds = parsed["format"]["duration"]
            .as_str()
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|value| *value > 0.0)
            .ok_or_else(|| TranscodeError::InvalidSource("source has no duration".into()))?;

        let bitrate_kbps = parsed["format"]["bit_rate"]
            .as_str()
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(|bits| (bits / 1000) as u32);

        Ok(SourceInfo {
            duration_seconds,
            width,
            height,
            bitrate_kbps,
        })
    }
}

/// Produces one rung's segmented stream. Implementations report encode
/// progress as a fraction of the source duration and must honor the stop
/// signal promptly.
#[async_trait]
pub trait SegmentEncoder: Send + Sync {
    async fn encode(
        &self,
        request: &EncodeRequest,
        on_progress: &(dyn Fn(f64) + Send + Sync),
        stop: &mut watch::Receiver<bool>,
    ) -> TranscodeResult<RungArtifacts>;
}

/// Supervised ffmpeg child. Progress key=value lines are streamed from the
/// progress pipe and parsed incrementally so the child never blocks on a
/// full pipe; cancellation kills the child instead of waiting it out.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    binary: PathBuf,
}

impl FfmpegEncoder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn build_args(request: &EncodeRequest, playlist: &Path) -> Vec<String> {
        let rung = &request.rung;
        vec![
            "-hide_banner".to_string(),
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            request.input.to_string_lossy().to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-vf".to_string(),
            format!("scale={}:{}", rung.width, rung.height),
            "-b:v".to_string(),
            format!("{}k", rung.video_bitrate_kbps),
            "-maxrate".to_string(),
            format!("{}k", rung.video_bitrate_kbps),
            "-bufsize".to_string(),
            format!("{}k", rung.video_bitrate_kbps * 2),
            "-b:a".to_string(),
            format!("{}k", rung.audio_bitrate_kbps),
            "-preset".to_string(),
            request.preset.clone(),
            "-g".to_string(),
            request.gop_frames.to_string(),
            "-keyint_min".to_string(),
            request.gop_frames.to_string(),
            "-sc_threshold".to_string(),
            "0".to_string(),
            "-hls_time".to_string(),
            request.segment_seconds.to_string(),
            "-hls_playlist_type".to_string(),
            "vod".to_string(),
            "-hls_segment_filename".to_string(),
            request
                .output_dir
                .join("segment_%03d.ts")
                .to_string_lossy()
                .to_string(),
            "-f".to_string(),
            "hls".to_string(),
            "-progress".to_string(),
            "pipe:1".to_string(),
            "-nostats".to_string(),
            playlist.to_string_lossy().to_string(),
        ]
    }
}

#[async_trait]
impl SegmentEncoder for FfmpegEncoder {
    async fn encode(
        &self,
        request: &EncodeRequest,
        on_progress: &(dyn Fn(f64) + Send + Sync),
        stop: &mut watch::Receiver<bool>,
    ) -> TranscodeResult<RungArtifacts> {
        tokio::fs::create_dir_all(&request.output_dir)
            .await
            .map_err(|source| TranscodeError::Io {
                source,
                path: request.output_dir.clone(),
            })?;
        let playlist = request.output_dir.join(RUNG_PLAYLIST_NAME);
        let args = Self::build_args(request, &playlist);
        debug!(rung = %request.rung.name, "spawning encoder");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| TranscodeError::Encode {
                rung: request.rung.name.clone(),
                detail: format!("failed to spawn encoder: {err}"),
            })?;

        let (stdout, mut stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = child.start_kill();
                return Err(TranscodeError::Encode {
                    rung: request.rung.name.clone(),
                    detail: "encoder pipes unavailable".to_string(),
                });
            }
        };
        let mut lines = BufReader::new(stdout).lines();
        let out_time = Regex::new(r"^out_time_ms=(\d+)").map_err(|err| TranscodeError::Encode {
            rung: request.rung.name.clone(),
            detail: err.to_string(),
        })?;
        let duration = request.source_duration_seconds.max(0.001);

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(captures) = out_time.captures(line.trim()) {
                                if let Ok(micros) = captures[1].parse::<u64>() {
                                    let encoded = micros as f64 / 1_000_000.0;
                                    on_progress((encoded / duration).clamp(0.0, 1.0));
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(rung = %request.rung.name, error = %err, "progress pipe read failed");
                            break;
                        }
                    }
                }
                changed = stop.changed() => {
                    // A closed stop channel means the owning worker is gone;
                    // treat it like a cancel rather than spinning.
                    if changed.is_err() || *stop.borrow() {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        return Err(TranscodeError::Cancelled);
                    }
                }
            }
        }

        let mut stderr_tail = String::new();
        let _ = stderr.read_to_string(&mut stderr_tail).await;
        let status = child.wait().await.map_err(|err| TranscodeError::Encode {
            rung: request.rung.name.clone(),
            detail: format!("encoder did not exit cleanly: {err}"),
        })?;
        if !status.success() {
            return Err(TranscodeError::Encode {
                rung: request.rung.name.clone(),
                detail: format!(
                    "encoder exited with {:?}: {}",
                    status.code(),
                    tail(&stderr_tail, 512)
                ),
            });
        }

        let segment_count = count_segments(&request.output_dir)?;
        if segment_count == 0 {
            return Err(TranscodeError::Encode {
                rung: request.rung.name.clone(),
                detail: "encoder produced no segments".to_string(),
            });
        }
        on_progress(1.0);

        Ok(RungArtifacts {
            rung: request.rung.clone(),
            playlist,
            segment_count,
        })
    }
}

fn count_segments(dir: &Path) -> TranscodeResult<usize> {
    let entries = std::fs::read_dir(dir).map_err(|source| TranscodeError::Io {
        source,
        path: dir.to_path_buf(),
    })?;
    let mut count = 0;
    for entry in entries.flatten() {
        if entry.path().extension().map(|ext| ext == "ts").unwrap_or(false) {
            count += 1;
        }
    }
    Ok(count)
}

fn tail(text: &str, limit: usize) -> &str {
    let trimmed = text.trim();
    // Advance to a char boundary so the slice stays valid UTF-8.
    let mut start = trimmed.len().saturating_sub(limit);
    while start < trimmed.len() && !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}
