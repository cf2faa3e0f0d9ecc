mod error;
mod ffmpeg;
mod ladder;
mod types;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::catalog::AssetCatalog;
use crate::config::TranscodeSection;
use crate::jobs::{JobContext, JobFailure, JobHandler, JobRecord, JobSuccess};
use crate::storage::{CachePolicy, ObjectStore};

pub use error::{TranscodeError, TranscodeResult};
pub use ffmpeg::{
    FfmpegEncoder, FfprobeProber, MediaProber, SegmentEncoder, RUNG_PLAYLIST_NAME,
};
pub use ladder::QualityLadder;
pub use types::{EncodeRequest, QualityRung, RungArtifacts, SourceInfo, Stage, WorkDirs};

pub const MASTER_MANIFEST_NAME: &str = "master.m3u8";

const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/MP2T";

/// Runs the transcode stages for one claimed job: working directory, source
/// download, probe, ladder selection, per-rung encode, master manifest,
/// publish, catalog finalize. The working directory is removed on every exit
/// path.
pub struct TranscodePipeline {
    storage: Arc<dyn ObjectStore>,
    catalog: Arc<dyn AssetCatalog>,
    prober: Arc<dyn MediaProber>,
    encoder: Arc<dyn SegmentEncoder>,
    section: TranscodeSection,
    ladder: QualityLadder,
    work_root: PathBuf,
    failure_log: PathBuf,
}

impl TranscodePipeline {
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        catalog: Arc<dyn AssetCatalog>,
        section: TranscodeSection,
        work_root: impl Into<PathBuf>,
        logs_dir: impl AsRef<Path>,
    ) -> Self {
        let ladder = QualityLadder::from_config(&section);
        let prober = Arc::new(FfprobeProber::new(&section.ffprobe));
        let encoder = Arc::new(FfmpegEncoder::new(&section.ffmpeg));
        Self {
            storage,
            catalog,
            prober,
            encoder,
            section,
            ladder,
            work_root: work_root.into(),
            failure_log: logs_dir.as_ref().join("transcode_failures.log"),
        }
    }

    pub fn with_prober(mut self, prober: Arc<dyn MediaProber>) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn SegmentEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn ladder(&self) -> &QualityLadder {
        &self.ladder
    }

    async fn execute(
        &self,
        job: &JobRecord,
        ctx: &JobContext,
        work: &WorkDirs,
    ) -> TranscodeResult<JobSuccess> {
        // Setup (0%)
        ctx.update_progress(Stage::Setup.as_str(), 0, None);
        for dir in [&work.source_dir, &work.output_dir] {
            fs::create_dir_all(dir)
                .await
                .map_err(|source| TranscodeError::Io {
                    source,
                    path: dir.clone(),
                })?;
        }
        self.catalog.mark_processing(&job.asset_id).await?;
        self.ensure_live(ctx)?;

        // Download (0-10%)
        ctx.update_progress(Stage::Download.as_str(), 1, None);
        let source_file = work.source_file(&job.source_key);
        self.storage.get_object(&job.source_key, &source_file).await?;
        ctx.update_progress(Stage::Download.as_str(), 10, None);
        self.ensure_live(ctx)?;

        // Probe (10-15%); an unreadable source is permanent, not retried.
        let source = self.prober.probe(&source_file).await?;
        info!(
            job_id = %job.job_id,
            height = source.height,
            duration_s = source.duration_seconds,
            "source probed"
        );
        ctx.update_progress(Stage::Probe.as_str(), 15, None);
        self.mirror_progress(&job.asset_id, 15).await;
        self.ensure_live(ctx)?;

        // Ladder selection; at least one rung for any valid source.
        let rungs = self.ladder.select(&job.requested_qualities, source.height);
        if rungs.is_empty() {
            return Err(TranscodeError::InvalidSource(
                "no quality rungs configured".into(),
            ));
        }

        // Per-rung encode (15-85%, evenly split across rungs).
        let span = 70.0 / rungs.len() as f64;
        for (index, rung) in rungs.iter().enumerate() {
            self.ensure_live(ctx)?;
            let base = 15.0 + span * index as f64;
            ctx.update_progress(Stage::Transcode.as_str(), base as u8, Some(rung.name.as_str()));

            let request = EncodeRequest {
                input: source_file.clone(),
                output_dir: work.output_dir.join(&rung.name),
                rung: rung.clone(),
                segment_seconds: self.section.segment_seconds,
                gop_frames: self.section.gop_frames,
                preset: self.section.preset.clone(),
                source_duration_seconds: source.duration_seconds,
            };
            let rung_name = rung.name.clone();
            let on_progress = move |fraction: f64| {
                let percent = base + span * fraction.clamp(0.0, 1.0);
                ctx.update_progress(Stage::Transcode.as_str(), percent as u8, Some(rung_name.as_str()));
            };
            let mut stop = ctx.stop_signal();
            let artifacts = self.encoder.encode(&request, &on_progress, &mut stop).await?;
            info!(
                job_id = %job.job_id,
                rung = %artifacts.rung.name,
                segments = artifacts.segment_count,
                "rung encoded"
            );
        }
        ctx.update_progress(Stage::Transcode.as_str(), 85, None);
        self.mirror_progress(&job.asset_id, 85).await;

        // Master manifest (85-90%), highest bandwidth first.
        let manifest = build_master_manifest(&rungs);
        let manifest_path = work.output_dir.join(MASTER_MANIFEST_NAME);
        fs::write(&manifest_path, manifest)
            .await
            .map_err(|source| TranscodeError::Io {
                source,
                path: manifest_path.clone(),
            })?;
        ctx.update_progress(Stage::Manifest.as_str(), 90, None);
        self.ensure_live(ctx)?;

        // Publish (90-98%).
        self.publish(job, ctx, &work.output_dir).await?;
        ctx.update_progress(Stage::Publish.as_str(), 98, None);
        self.ensure_live(ctx)?;

        // Finalize (98-100%): the asset flips to ready before the job does.
        let manifest_key = format!("{}/{}", job.output_base_path, MASTER_MANIFEST_NAME);
        let qualities: Vec<String> = rungs.iter().map(|rung| rung.name.clone()).collect();
        self.catalog
            .mark_ready(&job.asset_id, &manifest_key, &qualities)
            .await?;
        ctx.update_progress(Stage::Finalize.as_str(), 100, None);

        Ok(JobSuccess {
            manifest_path: manifest_key,
            available_qualities: qualities,
        })
    }

    async fn publish(
        &self,
        job: &JobRecord,
        ctx: &JobContext,
        output_dir: &Path,
    ) -> TranscodeResult<()> {
        let files: Vec<PathBuf> = WalkDir::new(output_dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();
        let total = files.len().max(1);

        for (index, path) in files.iter().enumerate() {
            let relative = path
                .strip_prefix(output_dir)
                .map_err(|_| TranscodeError::Publish("artifact outside output tree".into()))?;
            let key = format!(
                "{}/{}",
                job.output_base_path,
                relative.to_string_lossy().replace('\\', "/")
            );
            let is_manifest = path
                .extension()
                .map(|ext| ext == "m3u8")
                .unwrap_or(false);
            let (content_type, cache) = if is_manifest {
                (MANIFEST_CONTENT_TYPE, CachePolicy::ShortManifest)
            } else {
                (SEGMENT_CONTENT_TYPE, CachePolicy::ImmutableSegment)
            };
            self.storage
                .put_object(&key, path, content_type, cache)
                .await
                .map_err(|err| TranscodeError::Publish(err.to_string()))?;

            let percent = 90.0 + 8.0 * (index + 1) as f64 / total as f64;
            ctx.update_progress(Stage::Publish.as_str(), percent as u8, None);
        }
        Ok(())
    }

    fn ensure_live(&self, ctx: &JobContext) -> TranscodeResult<()> {
        if ctx.is_cancelled() {
            return Err(TranscodeError::Cancelled);
        }
        Ok(())
    }

    /// Coarse stage progress mirrored onto the asset record for status
    /// polling; failures here never fail the job.
    async fn mirror_progress(&self, asset_id: &str, percent: i64) {
        if let Err(error) = self.catalog.update_progress(asset_id, percent).await {
            warn!(asset_id, %error, "failed to mirror progress to catalog");
        }
    }

    async fn cleanup(&self, work: &WorkDirs) {
        match fs::remove_dir_all(&work.root).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %work.root.display(), error = %err, "failed to remove working directory");
            }
        }
    }

    fn log_failure(&self, job: &JobRecord, error: &TranscodeError) {
        if let Some(parent) = self.failure_log.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.failure_log)
        {
            let _ = writeln!(
                file,
                "{} [{}] attempt={} {}",
                Utc::now().to_rfc3339(),
                job.job_id,
                job.attempt,
                error
            );
        }
    }
}

#[async_trait]
impl JobHandler for TranscodePipeline {
    async fn run(&self, job: &JobRecord, ctx: &JobContext) -> Result<JobSuccess, JobFailure> {
        let work = WorkDirs::new(
            self.work_root
                .join(format!("{}_a{}", job.job_id, job.attempt)),
        );
        let result = self.execute(job, ctx, &work).await;
        self.cleanup(&work).await;

        match result {
            Ok(success) => Ok(success),
            Err(TranscodeError::Cancelled) => Err(TranscodeError::Cancelled.into()),
            Err(error) => {
                self.log_failure(job, &error);
                let message = error.user_message();
                if let Err(catalog_error) =
                    self.catalog.mark_failed(&job.asset_id, &message).await
                {
                    warn!(
                        asset_id = %job.asset_id,
                        error = %catalog_error,
                        "failed to record processing error on asset"
                    );
                }
                Err(error.into())
            }
        }
    }
}

/// Master manifest referencing each rung's sub-manifest with bandwidth and
/// resolution metadata, ordered highest-bandwidth-first.
fn build_master_manifest(rungs: &[QualityRung]) -> String {
    let mut ordered: Vec<&QualityRung> = rungs.iter().collect();
    ordered.sort_by(|a, b| b.bandwidth_bits().cmp(&a.bandwidth_bits()));

    let mut manifest = String::new();
    manifest.push_str("#EXTM3U\n");
    manifest.push_str("#EXT-X-VERSION:3\n\n");
    for rung in ordered {
        manifest.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}\n",
            rung.bandwidth_bits(),
            rung.resolution()
        ));
        manifest.push_str(&format!("{}/{}\n\n", rung.name, RUNG_PLAYLIST_NAME));
    }
    manifest
}
