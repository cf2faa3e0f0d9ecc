use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

use vod_core::config::QueueSection;
use vod_core::{
    CancelOutcome, EnqueueOptions, JobContext, JobErrorKind, JobFailure, JobHandler, JobQueue,
    JobQueueError, JobRecord, JobSpec, JobState, JobSuccess, JobTarget, SqliteJobStore,
};

fn queue_config() -> QueueSection {
    QueueSection {
        concurrency: 2,
        max_attempts: 3,
        backoff_base_seconds: 1,
        backoff_cap_seconds: 2,
        heartbeat_interval_seconds: 1,
        stall_timeout_seconds: 2,
        poll_interval_ms: 20,
    }
}

fn job_store(dir: &TempDir) -> SqliteJobStore {
    let store = SqliteJobStore::builder()
        .path(dir.path().join("jobs.sqlite"))
        .build()
        .expect("create store");
    store.initialize().expect("initialize store");
    store
}

fn spec(asset: &str) -> JobSpec {
    JobSpec {
        target: JobTarget::Content {
            content_id: asset.to_string(),
        },
        source_key: format!("videos/{asset}/original/source.mp4"),
        output_base_path: format!("videos/{asset}/hls"),
        requested_qualities: vec!["720p".into(), "360p".into()],
    }
}

async fn wait_for_state(store: &SqliteJobStore, job_id: &str, state: JobState) -> JobRecord {
    timeout(StdDuration::from_secs(20), async {
        loop {
            let record = store.fetch(job_id).unwrap().unwrap();
            if record.state == state {
                return record;
            }
            sleep(StdDuration::from_millis(25)).await;
        }
    })
    .await
    .expect("job did not reach expected state in time")
}

struct RecordingHandler {
    running: Mutex<HashMap<String, usize>>,
    overlap: AtomicUsize,
    order: Mutex<Vec<String>>,
    runs: AtomicUsize,
}

impl RecordingHandler {
    fn new() -> Self {
        Self {
            running: Mutex::new(HashMap::new()),
            overlap: AtomicUsize::new(0),
            order: Mutex::new(Vec::new()),
            runs: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn run(&self, job: &JobRecord, _ctx: &JobContext) -> Result<JobSuccess, JobFailure> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.order.lock().unwrap().push(job.job_id.clone());
        {
            let mut running = self.running.lock().unwrap();
            let entry = running.entry(job.job_id.clone()).or_insert(0);
            *entry += 1;
            if *entry > 1 {
                self.overlap.fetch_add(1, Ordering::SeqCst);
            }
        }
        sleep(StdDuration::from_millis(60)).await;
        *self
            .running
            .lock()
            .unwrap()
            .get_mut(&job.job_id)
            .unwrap() -= 1;
        Ok(JobSuccess {
            manifest_path: format!("{}/master.m3u8", job.output_base_path),
            available_qualities: job.requested_qualities.clone(),
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatch_never_double_claims() {
    let dir = TempDir::new().unwrap();
    let store = job_store(&dir);
    let handler = Arc::new(RecordingHandler::new());
    let queue = JobQueue::new(store.clone(), queue_config(), "test-node", handler.clone());

    let mut ids = Vec::new();
    for index in 0..6 {
        let record = queue
            .enqueue(&spec(&format!("asset-{index}")), &EnqueueOptions::default())
            .unwrap();
        ids.push(record.job_id);
    }

    queue.start();
    for id in &ids {
        wait_for_state(&store, id, JobState::Completed).await;
    }
    queue.shutdown().await;

    assert_eq!(handler.overlap.load(Ordering::SeqCst), 0);
    assert_eq!(handler.runs.load(Ordering::SeqCst), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispatch_honors_priority_then_fifo() {
    let dir = TempDir::new().unwrap();
    let store = job_store(&dir);
    let handler = Arc::new(RecordingHandler::new());
    let mut config = queue_config();
    config.concurrency = 1;
    let queue = JobQueue::new(store.clone(), config, "test-node", handler.clone());

    let low_first = queue
        .enqueue(
            &spec("asset-low-a"),
            &EnqueueOptions {
                priority: 0,
                ..EnqueueOptions::default()
            },
        )
        .unwrap();
    let low_second = queue
        .enqueue(
            &spec("asset-low-b"),
            &EnqueueOptions {
                priority: 0,
                ..EnqueueOptions::default()
            },
        )
        .unwrap();
    let high = queue
        .enqueue(
            &spec("asset-high"),
            &EnqueueOptions {
                priority: 10,
                ..EnqueueOptions::default()
            },
        )
        .unwrap();

    queue.start();
    for id in [&low_first.job_id, &low_second.job_id, &high.job_id] {
        wait_for_state(&store, id, JobState::Completed).await;
    }
    queue.shutdown().await;

    let order = handler.order.lock().unwrap().clone();
    assert_eq!(
        order,
        vec![
            high.job_id.clone(),
            low_first.job_id.clone(),
            low_second.job_id.clone()
        ]
    );
}

struct FailingHandler {
    runs: AtomicUsize,
    kind: JobErrorKind,
}

#[async_trait]
impl JobHandler for FailingHandler {
    async fn run(&self, _job: &JobRecord, _ctx: &JobContext) -> Result<JobSuccess, JobFailure> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Err(JobFailure::new(self.kind, "synthetic failure"))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retryable_failures_end_dead_after_max_attempts() {
    let dir = TempDir::new().unwrap();
    let store = job_store(&dir);
    let handler = Arc::new(FailingHandler {
        runs: AtomicUsize::new(0),
        kind: JobErrorKind::TransientIo,
    });
    let queue = JobQueue::new(store.clone(), queue_config(), "test-node", handler.clone());

    let record = queue
        .enqueue(
            &spec("asset-flaky"),
            &EnqueueOptions {
                max_attempts: 3,
                ..EnqueueOptions::default()
            },
        )
        .unwrap();

    queue.start();
    let dead = wait_for_state(&store, &record.job_id, JobState::Dead).await;
    queue.shutdown().await;

    assert_eq!(handler.runs.load(Ordering::SeqCst), 3);
    assert_eq!(dead.attempt, 3);
    assert_eq!(dead.error_kind, Some(JobErrorKind::Exhausted));
    // Progress resets on retry, so the dead job never reports a stale value.
    assert_eq!(dead.progress.percent, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn permanent_failures_skip_the_retry_machinery() {
    let dir = TempDir::new().unwrap();
    let store = job_store(&dir);
    let handler = Arc::new(FailingHandler {
        runs: AtomicUsize::new(0),
        kind: JobErrorKind::InvalidSource,
    });
    let queue = JobQueue::new(store.clone(), queue_config(), "test-node", handler.clone());

    let record = queue
        .enqueue(&spec("asset-corrupt"), &EnqueueOptions::default())
        .unwrap();
    queue.start();
    let dead = wait_for_state(&store, &record.job_id, JobState::Dead).await;
    queue.shutdown().await;

    assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    assert_eq!(dead.attempt, 1);
    assert_eq!(dead.error_kind, Some(JobErrorKind::InvalidSource));
}

struct CancellableHandler;

#[async_trait]
impl JobHandler for CancellableHandler {
    async fn run(&self, _job: &JobRecord, ctx: &JobContext) -> Result<JobSuccess, JobFailure> {
        ctx.update_progress("transcode", 20, Some("720p"));
        for _ in 0..400 {
            if ctx.is_cancelled() {
                return Err(JobFailure::new(JobErrorKind::Cancelled, "stopped on request"));
            }
            sleep(StdDuration::from_millis(10)).await;
        }
        Err(JobFailure::new(JobErrorKind::Internal, "never cancelled"))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_active_job_is_cooperative() {
    let dir = TempDir::new().unwrap();
    let store = job_store(&dir);
    let queue = JobQueue::new(
        store.clone(),
        queue_config(),
        "test-node",
        Arc::new(CancellableHandler),
    );

    let record = queue
        .enqueue(&spec("asset-cancel"), &EnqueueOptions::default())
        .unwrap();
    queue.start();
    wait_for_state(&store, &record.job_id, JobState::Active).await;

    // Give the handler a moment to publish progress, then read it without
    // touching the worker's write path.
    let progress = timeout(StdDuration::from_secs(5), async {
        loop {
            if let Some(progress) = queue.progress(&record.job_id).unwrap() {
                if progress.stage == "transcode" {
                    return progress;
                }
            }
            sleep(StdDuration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(progress.percent, 20);
    assert_eq!(progress.current_quality.as_deref(), Some("720p"));

    let outcome = queue.cancel(&record.job_id).unwrap();
    assert_eq!(outcome, CancelOutcome::Signalled);
    let cancelled = wait_for_state(&store, &record.job_id, JobState::Cancelled).await;
    assert_eq!(cancelled.error_kind, Some(JobErrorKind::Cancelled));
    queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_queued_job_removes_it_immediately() {
    let dir = TempDir::new().unwrap();
    let store = job_store(&dir);
    let queue = JobQueue::new(
        store.clone(),
        queue_config(),
        "test-node",
        Arc::new(CancellableHandler),
    );

    // Queue never started, so the job stays pending.
    let record = queue
        .enqueue(&spec("asset-pending"), &EnqueueOptions::default())
        .unwrap();
    let outcome = queue.cancel(&record.job_id).unwrap();
    assert_eq!(outcome, CancelOutcome::Removed);
    let stored = store.fetch(&record.job_id).unwrap().unwrap();
    assert_eq!(stored.state, JobState::Cancelled);

    // Cancel of a settled job is an explicit error, not a silent success.
    assert!(matches!(
        queue.cancel(&record.job_id),
        Err(JobQueueError::InvalidState(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_jobs_are_recycled_by_visibility_timeout() {
    let dir = TempDir::new().unwrap();
    let store = job_store(&dir);

    let record = store
        .enqueue(&spec("asset-stalled"), &EnqueueOptions::default())
        .unwrap();
    // A worker that claims and then disappears: no further heartbeats.
    let claimed = store.claim_next("ghost-worker", Utc::now()).unwrap().unwrap();
    assert_eq!(claimed.job_id, record.job_id);

    let recycled = store
        .recycle_stalled(Duration::seconds(-1), Utc::now())
        .unwrap();
    assert_eq!(recycled, 1);

    let stored = store.fetch(&record.job_id).unwrap().unwrap();
    assert_eq!(stored.state, JobState::Queued);
    assert_eq!(stored.attempt, 1);
    assert!(stored.claimed_by.is_none());

    // Exhaust the budget: recycling counts against max_attempts.
    store.claim_next("ghost-worker", Utc::now()).unwrap().unwrap();
    store
        .recycle_stalled(Duration::seconds(-1), Utc::now())
        .unwrap();
    store.claim_next("ghost-worker", Utc::now()).unwrap().unwrap();
    store
        .recycle_stalled(Duration::seconds(-1), Utc::now())
        .unwrap();

    let dead = store.fetch(&record.job_id).unwrap().unwrap();
    assert_eq!(dead.state, JobState::Dead);
    assert_eq!(dead.error_kind, Some(JobErrorKind::Exhausted));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_in_flight_job_per_asset() {
    let dir = TempDir::new().unwrap();
    let store = job_store(&dir);

    store
        .enqueue(&spec("asset-shared"), &EnqueueOptions::default())
        .unwrap();
    let err = store
        .enqueue(&spec("asset-shared"), &EnqueueOptions::default())
        .unwrap_err();
    assert!(matches!(err, JobQueueError::AssetBusy(asset) if asset == "asset-shared"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delayed_jobs_wait_for_their_not_before() {
    let dir = TempDir::new().unwrap();
    let store = job_store(&dir);
    let record = store
        .enqueue(
            &spec("asset-delayed"),
            &EnqueueOptions {
                delay: Some(Duration::hours(1)),
                ..EnqueueOptions::default()
            },
        )
        .unwrap();

    assert!(store.claim_next("w0", Utc::now()).unwrap().is_none());
    let future = Utc::now() + Duration::hours(2);
    let claimed = store.claim_next("w0", future).unwrap().unwrap();
    assert_eq!(claimed.job_id, record.job_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stats_requeue_and_export() {
    let dir = TempDir::new().unwrap();
    let store = job_store(&dir);

    let dead_job = store
        .enqueue(&spec("asset-dead"), &EnqueueOptions::default())
        .unwrap();
    store.claim_next("w0", Utc::now()).unwrap().unwrap();
    store
        .mark_dead(&dead_job.job_id, JobErrorKind::Exhausted, "gave up")
        .unwrap();
    store
        .enqueue(&spec("asset-waiting"), &EnqueueOptions::default())
        .unwrap();

    let stats = store.stats().unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.waiting, 1);
    assert_eq!(stats.active, 0);

    store.requeue_dead(&dead_job.job_id).unwrap();
    let requeued = store.fetch(&dead_job.job_id).unwrap().unwrap();
    assert_eq!(requeued.state, JobState::Queued);
    assert_eq!(requeued.attempt, 0);
    assert!(requeued.error_kind.is_none());

    let export = dir.path().join("jobs.jsonl.gz");
    store.export_backup(&export).unwrap();
    assert!(export.exists());

    let backup = dir.path().join("jobs_backup.sqlite");
    store.backup_to(&backup).unwrap();
    assert!(backup.exists());
}
