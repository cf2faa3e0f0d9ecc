use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use vod_core::config::{load_pipeline_config, QueueSection, TranscodeSection};
use vod_core::transcode::{
    EncodeRequest, MediaProber, RungArtifacts, SourceInfo, TranscodeError, TranscodeResult,
    SegmentEncoder,
};
use vod_core::{
    CancelOutcome, EnqueueOptions, FsObjectStore, JobErrorKind, JobQueue, JobSpec, JobState,
    JobTarget, MediaAsset, ProcessingStatus, SqliteAssetStore, SqliteJobStore, TranscodePipeline,
};

fn fixture_transcode_section() -> TranscodeSection {
    let config = load_pipeline_config(
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/pipeline.toml"),
    )
    .expect("pipeline config parses");
    config.transcode
}

fn queue_config() -> QueueSection {
    QueueSection {
        concurrency: 2,
        max_attempts: 3,
        backoff_base_seconds: 1,
        backoff_cap_seconds: 2,
        heartbeat_interval_seconds: 1,
        stall_timeout_seconds: 5,
        poll_interval_ms: 20,
    }
}

struct FakeProber {
    height: u32,
    fail: bool,
}

#[async_trait]
impl MediaProber for FakeProber {
    async fn probe(&self, _input: &Path) -> TranscodeResult<SourceInfo> {
        if self.fail {
            return Err(TranscodeError::InvalidSource(
                "moov atom not found".to_string(),
            ));
        }
        Ok(SourceInfo {
            duration_seconds: 120.0,
            width: self.height * 16 / 9,
            height: self.height,
            bitrate_kbps: Some(8000),
        })
    }
}

enum EncoderMode {
    /// Write a playlist plus segments, reporting progress along the way.
    Succeed { segments: usize },
    /// Fail the first N runs with a retryable error, then succeed.
    FlakyUntil { failures: usize },
    /// Block until the stop signal fires.
    WaitForCancel,
    /// Simulate a prior cleanup: remove the whole work tree, then fail hard.
    DestroyWorkdir,
}

struct FakeEncoder {
    mode: EncoderMode,
    runs: AtomicUsize,
}

impl FakeEncoder {
    fn new(mode: EncoderMode) -> Self {
        Self {
            mode,
            runs: AtomicUsize::new(0),
        }
    }

    fn write_outputs(request: &EncodeRequest, segments: usize) -> TranscodeResult<RungArtifacts> {
        std::fs::create_dir_all(&request.output_dir).map_err(|source| TranscodeError::Io {
            source,
            path: request.output_dir.clone(),
        })?;
        let mut playlist = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n");
        for index in 0..segments {
            let name = format!("segment_{index:03}.ts");
            std::fs::write(request.output_dir.join(&name), b"SEGMENT").map_err(|source| {
                TranscodeError::Io {
                    source,
                    path: request.output_dir.join(&name),
                }
            })?;
            playlist.push_str(&format!("#EXTINF:6.0,\n{name}\n"));
        }
        playlist.push_str("#EXT-X-ENDLIST\n");
        let playlist_path = request.output_dir.join("playlist.m3u8");
        std::fs::write(&playlist_path, playlist).map_err(|source| TranscodeError::Io {
            source,
            path: playlist_path.clone(),
        })?;
        Ok(RungArtifacts {
            rung: request.rung.clone(),
            playlist: playlist_path,
            segment_count: segments,
        })
    }
}

#[async_trait]
impl SegmentEncoder for FakeEncoder {
    async fn encode(
        &self,
        request: &EncodeRequest,
        on_progress: &(dyn Fn(f64) + Send + Sync),
        stop: &mut watch::Receiver<bool>,
    ) -> TranscodeResult<RungArtifacts> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            EncoderMode::Succeed { segments } => {
                on_progress(0.5);
                on_progress(1.0);
                Self::write_outputs(request, *segments)
            }
            EncoderMode::FlakyUntil { failures } => {
                if run < *failures {
                    return Err(TranscodeError::Encode {
                        rung: request.rung.name.clone(),
                        detail: "simulated encoder crash".to_string(),
                    });
                }
                Self::write_outputs(request, 3)
            }
            EncoderMode::WaitForCancel => loop {
                if stop.changed().await.is_err() {
                    return Err(TranscodeError::Encode {
                        rung: request.rung.name.clone(),
                        detail: "stop channel closed".to_string(),
                    });
                }
                if *stop.borrow() {
                    return Err(TranscodeError::Cancelled);
                }
            },
            EncoderMode::DestroyWorkdir => {
                let root = request
                    .output_dir
                    .parent()
                    .and_then(Path::parent)
                    .expect("work root");
                std::fs::remove_dir_all(root).ok();
                std::fs::remove_dir_all(root).ok();
                Err(TranscodeError::InvalidSource(
                    "work tree vanished mid-encode".to_string(),
                ))
            }
        }
    }
}

struct Harness {
    dir: TempDir,
    storage: Arc<FsObjectStore>,
    catalog: Arc<SqliteAssetStore>,
    jobs: SqliteJobStore,
    work_root: std::path::PathBuf,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(FsObjectStore::new(dir.path().join("bucket")));
        let catalog = Arc::new(
            SqliteAssetStore::builder()
                .path(dir.path().join("catalog.sqlite"))
                .build()
                .unwrap(),
        );
        catalog.initialize().unwrap();
        let jobs = SqliteJobStore::builder()
            .path(dir.path().join("jobs.sqlite"))
            .build()
            .unwrap();
        jobs.initialize().unwrap();
        let work_root = dir.path().join("work");
        Self {
            dir,
            storage,
            catalog,
            jobs,
            work_root,
        }
    }

    async fn seed_asset(&self, asset_id: &str) {
        let mut asset = MediaAsset::new(asset_id, 0);
        asset.source_key = Some(format!("videos/{asset_id}/original/source.mp4"));
        self.catalog.upsert_asset(&asset).unwrap();
        let source = self.dir.path().join("source.mp4");
        std::fs::write(&source, b"FAKE MP4 PAYLOAD").unwrap();
        use vod_core::{CachePolicy, ObjectStore};
        self.storage
            .put_object(
                &format!("videos/{asset_id}/original/source.mp4"),
                &source,
                "video/mp4",
                CachePolicy::Source,
            )
            .await
            .unwrap();
    }

    fn pipeline(&self, prober: FakeProber, encoder: FakeEncoder) -> Arc<TranscodePipeline> {
        Arc::new(
            TranscodePipeline::new(
                self.storage.clone(),
                self.catalog.clone(),
                fixture_transcode_section(),
                &self.work_root,
                self.dir.path().join("logs"),
            )
            .with_prober(Arc::new(prober))
            .with_encoder(Arc::new(encoder)),
        )
    }

    fn job_spec(&self, asset_id: &str, qualities: &[&str]) -> JobSpec {
        JobSpec {
            target: JobTarget::Content {
                content_id: asset_id.to_string(),
            },
            source_key: format!("videos/{asset_id}/original/source.mp4"),
            output_base_path: format!("videos/{asset_id}/hls"),
            requested_qualities: qualities.iter().map(|name| name.to_string()).collect(),
        }
    }
}

async fn wait_for_terminal(jobs: &SqliteJobStore, job_id: &str) -> vod_core::JobRecord {
    timeout(StdDuration::from_secs(20), async {
        loop {
            let record = jobs.fetch(job_id).unwrap().unwrap();
            if record.state.is_terminal() {
                return record;
            }
            sleep(StdDuration::from_millis(25)).await;
        }
    })
    .await
    .expect("job did not settle in time")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_ladder_for_a_1080p_source() {
    let harness = Harness::new();
    harness.seed_asset("movie-hd").await;
    let pipeline = harness.pipeline(
        FakeProber {
            height: 1080,
            fail: false,
        },
        FakeEncoder::new(EncoderMode::Succeed { segments: 3 }),
    );
    let queue = JobQueue::new(harness.jobs.clone(), queue_config(), "test", pipeline);
    let record = queue
        .enqueue(
            &harness.job_spec("movie-hd", &["1080p", "720p", "480p", "360p"]),
            &EnqueueOptions::default(),
        )
        .unwrap();
    queue.start();
    let done = wait_for_terminal(&harness.jobs, &record.job_id).await;
    queue.shutdown().await;

    assert_eq!(done.state, JobState::Completed);
    assert_eq!(
        done.produced_qualities,
        vec!["1080p", "720p", "480p", "360p"]
    );
    assert_eq!(done.progress.percent, 100);

    let asset = harness.catalog.fetch_asset("movie-hd").unwrap().unwrap();
    assert_eq!(asset.processing_status, ProcessingStatus::Ready);
    assert_eq!(
        asset.manifest_path.as_deref(),
        Some("videos/movie-hd/hls/master.m3u8")
    );

    // Published master manifest lists the rungs highest-bandwidth-first.
    let manifest_copy = harness.dir.path().join("master_check.m3u8");
    use vod_core::ObjectStore;
    harness
        .storage
        .get_object("videos/movie-hd/hls/master.m3u8", &manifest_copy)
        .await
        .unwrap();
    let manifest = std::fs::read_to_string(&manifest_copy).unwrap();
    let order: Vec<usize> = ["1080p", "720p", "480p", "360p"]
        .iter()
        .map(|name| manifest.find(&format!("{name}/playlist.m3u8")).unwrap())
        .collect();
    assert!(order.windows(2).all(|pair| pair[0] < pair[1]));

    // Segments publish immutable, manifests short-lived.
    let (_, segment_cache) = harness
        .storage
        .cached_meta("videos/movie-hd/hls/720p/segment_000.ts")
        .unwrap();
    assert!(segment_cache.contains("immutable"));
    let (_, manifest_cache) = harness
        .storage
        .cached_meta("videos/movie-hd/hls/master.m3u8")
        .unwrap();
    assert_eq!(manifest_cache, "max-age=60");

    // Working directory is gone on success.
    assert!(!harness.work_root.join(format!("{}_a0", record.job_id)).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn low_resolution_source_skips_upper_rungs() {
    let harness = Harness::new();
    harness.seed_asset("movie-sd").await;
    let pipeline = harness.pipeline(
        FakeProber {
            height: 480,
            fail: false,
        },
        FakeEncoder::new(EncoderMode::Succeed { segments: 2 }),
    );
    let queue = JobQueue::new(harness.jobs.clone(), queue_config(), "test", pipeline);
    let record = queue
        .enqueue(
            &harness.job_spec("movie-sd", &["1080p", "720p", "480p", "360p"]),
            &EnqueueOptions::default(),
        )
        .unwrap();
    queue.start();
    let done = wait_for_terminal(&harness.jobs, &record.job_id).await;
    queue.shutdown().await;

    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.produced_qualities, vec!["480p", "360p"]);

    let asset = harness.catalog.fetch_asset("movie-sd").unwrap().unwrap();
    assert_eq!(asset.available_qualities, vec!["480p", "360p"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupt_source_dies_without_retries() {
    let harness = Harness::new();
    harness.seed_asset("movie-corrupt").await;
    let pipeline = harness.pipeline(
        FakeProber {
            height: 1080,
            fail: true,
        },
        FakeEncoder::new(EncoderMode::Succeed { segments: 2 }),
    );
    let queue = JobQueue::new(harness.jobs.clone(), queue_config(), "test", pipeline);
    let record = queue
        .enqueue(
            &harness.job_spec("movie-corrupt", &[]),
            &EnqueueOptions::default(),
        )
        .unwrap();
    queue.start();
    let done = wait_for_terminal(&harness.jobs, &record.job_id).await;
    queue.shutdown().await;

    assert_eq!(done.state, JobState::Dead);
    assert_eq!(done.attempt, 1);
    assert_eq!(done.error_kind, Some(JobErrorKind::InvalidSource));

    // The asset carries a human-readable message, never raw tool output.
    let asset = harness.catalog.fetch_asset("movie-corrupt").unwrap().unwrap();
    assert_eq!(asset.processing_status, ProcessingStatus::Failed);
    let message = asset.processing_error.unwrap();
    assert!(!message.contains("moov"));
    assert!(!message.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flaky_encoder_succeeds_within_the_retry_budget() {
    let harness = Harness::new();
    harness.seed_asset("movie-flaky").await;
    let pipeline = harness.pipeline(
        FakeProber {
            height: 360,
            fail: false,
        },
        FakeEncoder::new(EncoderMode::FlakyUntil { failures: 2 }),
    );
    let queue = JobQueue::new(harness.jobs.clone(), queue_config(), "test", pipeline);
    let record = queue
        .enqueue(
            &harness.job_spec("movie-flaky", &["360p"]),
            &EnqueueOptions::default(),
        )
        .unwrap();
    queue.start();
    let done = wait_for_terminal(&harness.jobs, &record.job_id).await;
    queue.shutdown().await;

    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.attempt, 2);
    let asset = harness.catalog.fetch_asset("movie-flaky").unwrap().unwrap();
    assert_eq!(asset.processing_status, ProcessingStatus::Ready);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_interrupts_the_encode() {
    let harness = Harness::new();
    harness.seed_asset("movie-cancel").await;
    let pipeline = harness.pipeline(
        FakeProber {
            height: 720,
            fail: false,
        },
        FakeEncoder::new(EncoderMode::WaitForCancel),
    );
    let queue = JobQueue::new(harness.jobs.clone(), queue_config(), "test", pipeline);
    let record = queue
        .enqueue(
            &harness.job_spec("movie-cancel", &["720p"]),
            &EnqueueOptions::default(),
        )
        .unwrap();
    queue.start();

    // Wait until the encode stage is reached, then cancel.
    timeout(StdDuration::from_secs(10), async {
        loop {
            if let Some(progress) = queue.progress(&record.job_id).unwrap() {
                if progress.stage == "transcode" {
                    break;
                }
            }
            sleep(StdDuration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        queue.cancel(&record.job_id).unwrap(),
        CancelOutcome::Signalled
    );

    let done = wait_for_terminal(&harness.jobs, &record.job_id).await;
    queue.shutdown().await;
    assert_eq!(done.state, JobState::Cancelled);
    assert!(!harness.work_root.join(format!("{}_a0", record.job_id)).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cleanup_tolerates_an_already_removed_workdir() {
    let harness = Harness::new();
    harness.seed_asset("movie-gone").await;
    let pipeline = harness.pipeline(
        FakeProber {
            height: 720,
            fail: false,
        },
        FakeEncoder::new(EncoderMode::DestroyWorkdir),
    );
    let queue = JobQueue::new(harness.jobs.clone(), queue_config(), "test", pipeline);
    let record = queue
        .enqueue(
            &harness.job_spec("movie-gone", &["720p"]),
            &EnqueueOptions::default(),
        )
        .unwrap();
    queue.start();
    let done = wait_for_terminal(&harness.jobs, &record.job_id).await;
    queue.shutdown().await;

    // The double-removed work tree never turns cleanup into a failure of its
    // own; the job settles on the handler's error.
    assert_eq!(done.state, JobState::Dead);
    assert_eq!(done.error_kind, Some(JobErrorKind::InvalidSource));
}
