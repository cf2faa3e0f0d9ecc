use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};

use crate::config::QueueSection;

use super::{
    EnqueueOptions, JobErrorKind, JobFailure, JobProgress, JobQueueError, JobQueueResult,
    JobRecord, JobSpec, JobSuccess, QueueStats, SqliteJobStore,
};

/// Work executed for each claimed job. The handler owns the whole attempt;
/// the queue only classifies its outcome.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &JobRecord, ctx: &JobContext) -> Result<JobSuccess, JobFailure>;
}

/// Single-writer progress channel for one job attempt. Readers never contend
/// with the writer; the persisted snapshot doubles as the worker heartbeat.
pub struct ProgressWriter {
    job_id: String,
    store: SqliteJobStore,
    tx: watch::Sender<JobProgress>,
}

impl ProgressWriter {
    pub fn update(&self, stage: &str, percent: u8, current_quality: Option<&str>) {
        let floor = self.tx.borrow().percent;
        let progress = JobProgress {
            stage: stage.to_string(),
            percent: percent.clamp(floor, 100),
            current_quality: current_quality.map(str::to_string),
        };
        let _ = self.tx.send(progress.clone());
        if let Err(error) = self.store.update_progress(&self.job_id, &progress) {
            warn!(job_id = %self.job_id, %error, "failed to persist job progress");
        }
    }
}

pub struct JobContext {
    progress: ProgressWriter,
    stop: watch::Receiver<bool>,
}

impl JobContext {
    pub fn update_progress(&self, stage: &str, percent: u8, current_quality: Option<&str>) {
        self.progress.update(stage, percent, current_quality);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.stop.borrow()
    }

    /// Receiver handlers can `select!` against long-running child work.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.clone()
    }
}

struct LiveJob {
    progress_rx: watch::Receiver<JobProgress>,
    stop_tx: watch::Sender<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was still pending and is now terminal.
    Removed,
    /// The running handler has been signalled; `cancelled` lands once it
    /// observes the flag and cleans up.
    Signalled,
}

/// Bounded worker pool over the durable job store. The store is the source
/// of truth; `live` is a read-through registry of in-flight progress only.
pub struct JobQueue {
    store: SqliteJobStore,
    config: QueueSection,
    node_name: String,
    handler: Arc<dyn JobHandler>,
    live: Arc<Mutex<HashMap<String, LiveJob>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn new(
        store: SqliteJobStore,
        config: QueueSection,
        node_name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            config,
            node_name: node_name.into(),
            handler,
            live: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &SqliteJobStore {
        &self.store
    }

    /// Spawns the worker pool and the stall reaper.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        if !tasks.is_empty() {
            return;
        }
        for index in 0..self.config.concurrency.max(1) {
            let worker = Worker {
                name: format!("{}-w{index}", self.node_name),
                store: self.store.clone(),
                config: self.config.clone(),
                handler: Arc::clone(&self.handler),
                live: Arc::clone(&self.live),
                shutdown_rx: self.shutdown_tx.subscribe(),
            };
            tasks.push(tokio::spawn(worker.run()));
        }
        tasks.push(tokio::spawn(reaper_loop(
            self.store.clone(),
            self.config.clone(),
            self.shutdown_tx.subscribe(),
        )));
        info!(workers = self.config.concurrency, "job queue started");
    }

    pub fn enqueue(&self, spec: &JobSpec, options: &EnqueueOptions) -> JobQueueResult<JobRecord> {
        let record = self.store.enqueue(spec, options)?;
        info!(
            job_id = %record.job_id,
            asset_id = %record.asset_id,
            priority = record.priority,
            "transcode job enqueued"
        );
        Ok(record)
    }

    pub fn cancel(&self, job_id: &str) -> JobQueueResult<CancelOutcome> {
        if let Some(live_job) = self.live.lock().unwrap().get(job_id) {
            let _ = live_job.stop_tx.send(true);
            info!(job_id, "cancel signalled to running worker");
            return Ok(CancelOutcome::Signalled);
        }
        if self.store.cancel_pending(job_id)? {
            info!(job_id, "pending job cancelled");
            return Ok(CancelOutcome::Removed);
        }
        match self.store.fetch(job_id)? {
            Some(record) => Err(JobQueueError::InvalidState(format!(
                "job {job_id} is {}",
                record.state
            ))),
            None => Err(JobQueueError::NotFound(job_id.to_string())),
        }
    }

    /// Latest progress without blocking the worker: live jobs are read from
    /// their watch channel, settled ones from the durable snapshot.
    pub fn progress(&self, job_id: &str) -> JobQueueResult<Option<JobProgress>> {
        if let Some(live_job) = self.live.lock().unwrap().get(job_id) {
            return Ok(Some(live_job.progress_rx.borrow().clone()));
        }
        Ok(self.store.fetch(job_id)?.map(|record| record.progress))
    }

    pub fn stats(&self) -> JobQueueResult<QueueStats> {
        self.store.stats()
    }

    /// Stops claiming new work and waits for in-flight jobs to settle.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<_> = {
            let mut guard = self.tasks.lock().unwrap();
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("job queue stopped");
    }
}

struct Worker {
    name: String,
    store: SqliteJobStore,
    config: QueueSection,
    handler: Arc<dyn JobHandler>,
    live: Arc<Mutex<HashMap<String, LiveJob>>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        let poll = StdDuration::from_millis(self.config.poll_interval_ms.max(10));
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            if let Err(error) = self.store.release_ready(Utc::now()) {
                warn!(worker = %self.name, %error, "failed to release retrying jobs");
            }
            match self.store.claim_next(&self.name, Utc::now()) {
                Ok(Some(job)) => self.run_job(job).await,
                Ok(None) => {
                    tokio::select! {
                        _ = sleep(poll) => {}
                        _ = self.shutdown_rx.changed() => {}
                    }
                }
                Err(error) => {
                    warn!(worker = %self.name, %error, "claim failed");
                    sleep(poll).await;
                }
            }
        }
        debug!(worker = %self.name, "worker stopped");
    }

    async fn run_job(&self, job: JobRecord) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (progress_tx, progress_rx) = watch::channel(JobProgress::default());
        self.live.lock().unwrap().insert(
            job.job_id.clone(),
            LiveJob {
                progress_rx,
                stop_tx,
            },
        );

        let ctx = JobContext {
            progress: ProgressWriter {
                job_id: job.job_id.clone(),
                store: self.store.clone(),
                tx: progress_tx,
            },
            stop: stop_rx,
        };

        let heartbeat_store = self.store.clone();
        let heartbeat_id = job.job_id.clone();
        let heartbeat_period = StdDuration::from_secs(self.config.heartbeat_interval_seconds.max(1));
        let heartbeat = tokio::spawn(async move {
            let mut ticker = interval(heartbeat_period);
            loop {
                ticker.tick().await;
                if let Err(error) = heartbeat_store.heartbeat(&heartbeat_id) {
                    warn!(job_id = %heartbeat_id, %error, "heartbeat write failed");
                }
            }
        });

        info!(worker = %self.name, job_id = %job.job_id, attempt = job.attempt, "job claimed");
        let outcome = self.handler.run(&job, &ctx).await;
        heartbeat.abort();
        self.live.lock().unwrap().remove(&job.job_id);
        self.settle(&job, outcome);
    }

    fn settle(&self, job: &JobRecord, outcome: Result<JobSuccess, JobFailure>) {
        let result = match outcome {
            Ok(success) => {
                info!(job_id = %job.job_id, manifest = %success.manifest_path, "job completed");
                self.store.mark_completed(&job.job_id, &success)
            }
            Err(failure) if failure.kind == JobErrorKind::Cancelled => {
                info!(job_id = %job.job_id, "job cancelled by request");
                self.store.mark_cancelled(&job.job_id)
            }
            Err(failure) if failure.kind.is_retryable() && job.attempt + 1 < job.max_attempts => {
                let delay = self.backoff(job.attempt);
                warn!(
                    job_id = %job.job_id,
                    attempt = job.attempt,
                    kind = failure.kind.as_str(),
                    delay_s = delay.num_seconds(),
                    "job failed, retrying"
                );
                self.store
                    .mark_retrying(&job.job_id, delay, failure.kind, &failure.detail)
            }
            Err(failure) => {
                let kind = if failure.kind.is_retryable() {
                    JobErrorKind::Exhausted
                } else {
                    failure.kind
                };
                warn!(
                    job_id = %job.job_id,
                    kind = kind.as_str(),
                    "job dead"
                );
                self.store.mark_dead(&job.job_id, kind, &failure.detail)
            }
        };
        if let Err(error) = result {
            warn!(job_id = %job.job_id, %error, "failed to persist job outcome");
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base_seconds.max(1);
        let cap = self.config.backoff_cap_seconds.max(base);
        let exp = base.saturating_mul(1u64 << attempt.min(16)).min(cap);
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::seconds((exp + jitter) as i64)
    }
}

async fn reaper_loop(
    store: SqliteJobStore,
    config: QueueSection,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let period = StdDuration::from_secs(config.heartbeat_interval_seconds.max(1));
    let stall = Duration::seconds(config.stall_timeout_seconds.max(1) as i64);
    let mut ticker = interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => break,
        }
        if *shutdown_rx.borrow() {
            break;
        }
        match store.recycle_stalled(stall, Utc::now()) {
            Ok(0) => {}
            Ok(recycled) => warn!(recycled, "stalled jobs returned to queue"),
            Err(error) => warn!(%error, "stall sweep failed"),
        }
    }
}
