use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use flate2::{write::GzEncoder, Compression};
use rusqlite::backup::Backup;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use crate::sqlite::configure_connection;

use super::{
    EnqueueOptions, JobErrorKind, JobProgress, JobQueueError, JobQueueResult, JobRecord, JobSpec,
    JobState, JobSuccess, QueueStats,
};

const JOB_SCHEMA: &str = include_str!("../../../sql/jobs.sql");

#[derive(Debug, Clone)]
pub struct SqliteJobStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteJobStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteJobStoreBuilder {
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

    pub fn build(self) -> JobQueueResult<SqliteJobStore> {
        let path = self.path.ok_or(JobQueueError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteJobStore { path, flags })
    }
}

/// Durable store for transcode jobs. The table is the source of truth for
/// every state transition; the queue runtime only caches live progress.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteJobStore {
    pub fn builder() -> SqliteJobStoreBuilder {
        SqliteJobStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> JobQueueResult<Self> {
        SqliteJobStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> JobQueueResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            JobQueueError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| JobQueueError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> JobQueueResult<()> {
        let conn = self.open()?;
        conn.execute_batch(JOB_SCHEMA)?;
        Ok(())
    }

    /// Inserts a job in `queued`. At most one non-terminal job per asset is
    /// allowed; the check and the insert share one transaction.
    pub fn enqueue(&self, spec: &JobSpec, options: &EnqueueOptions) -> JobQueueResult<JobRecord> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let asset_id = spec.target.asset_id().to_string();

        let in_flight: i64 = tx.query_row(
            "SELECT COUNT(*) FROM transcode_jobs
             WHERE asset_id = ?1 AND state IN ('queued', 'active', 'retrying')",
            [&asset_id],
            |row| row.get(0),
        )?;
        if in_flight > 0 {
            return Err(JobQueueError::AssetBusy(asset_id));
        }

        let job_id = format!("tj-{}", Uuid::new_v4().simple());
        let target = serde_json::to_string(&spec.target)
            .map_err(|err| JobQueueError::Payload(err.to_string()))?;
        let qualities = serde_json::to_string(&spec.requested_qualities)
            .map_err(|err| JobQueueError::Payload(err.to_string()))?;
        let not_before = options
            .delay
            .map(|delay| (Utc::now() + delay).naive_utc());

        tx.execute(
            "INSERT INTO transcode_jobs (
                job_id, asset_id, target, source_key, output_base_path,
                requested_qualities, priority, state, attempt, max_attempts,
                not_before
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'queued', 0, ?8, ?9)",
            params![
                &job_id,
                &asset_id,
                target,
                &spec.source_key,
                &spec.output_base_path,
                qualities,
                options.priority,
                options.max_attempts.max(1),
                not_before,
            ],
        )?;
        tx.commit()?;

        self.fetch(&job_id)?
            .ok_or_else(|| JobQueueError::NotFound(job_id))
    }

    pub fn fetch(&self, job_id: &str) -> JobQueueResult<Option<JobRecord>> {
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT * FROM transcode_jobs WHERE job_id = ?1",
                [job_id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Promotes retrying jobs whose backoff delay has elapsed back to queued.
    pub fn release_ready(&self, now: DateTime<Utc>) -> JobQueueResult<usize> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE transcode_jobs SET state = 'queued', updated_at = CURRENT_TIMESTAMP
             WHERE state = 'retrying' AND not_before IS NOT NULL AND not_before <= ?1",
            [now.naive_utc()],
        )?;
        Ok(affected)
    }

    /// Claims the highest-priority ready job for `worker`. The guarded UPDATE
    /// inside an immediate transaction keeps the claim atomic: a job can only
    /// move queued -> active once, whatever the number of concurrent callers.
    pub fn claim_next(
        &self,
        worker: &str,
        now: DateTime<Utc>,
    ) -> JobQueueResult<Option<JobRecord>> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate: Option<String> = tx
            .query_row(
                "SELECT job_id FROM transcode_jobs
                 WHERE state = 'queued' AND (not_before IS NULL OR not_before <= ?1)
                 ORDER BY priority DESC, rowid ASC
                 LIMIT 1",
                [now.naive_utc()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(job_id) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        let affected = tx.execute(
            "UPDATE transcode_jobs SET
                state = 'active',
                claimed_by = ?1,
                heartbeat_at = ?2,
                progress_stage = NULL,
                progress_percent = 0,
                progress_quality = NULL,
                updated_at = CURRENT_TIMESTAMP
             WHERE job_id = ?3 AND state = 'queued'",
            params![worker, now.naive_utc(), &job_id],
        )?;
        tx.commit()?;

        if affected == 0 {
            return Ok(None);
        }
        self.fetch(&job_id)
    }

    pub fn heartbeat(&self, job_id: &str) -> JobQueueResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE transcode_jobs SET heartbeat_at = ?1 WHERE job_id = ?2 AND state = 'active'",
            params![Utc::now().naive_utc(), job_id],
        )?;
        Ok(())
    }

    /// Persists a progress snapshot. The percent is clamped monotonically
    /// non-decreasing within the attempt; the write doubles as a heartbeat.
    pub fn update_progress(&self, job_id: &str, progress: &JobProgress) -> JobQueueResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE transcode_jobs SET
                progress_stage = ?1,
                progress_percent = MAX(progress_percent, ?2),
                progress_quality = ?3,
                heartbeat_at = ?4,
                updated_at = CURRENT_TIMESTAMP
             WHERE job_id = ?5 AND state = 'active'",
            params![
                &progress.stage,
                progress.percent as i64,
                &progress.current_quality,
                Utc::now().naive_utc(),
                job_id
            ],
        )?;
        Ok(())
    }

    pub fn mark_completed(&self, job_id: &str, success: &JobSuccess) -> JobQueueResult<()> {
        let conn = self.open()?;
        let qualities = serde_json::to_string(&success.available_qualities)
            .map_err(|err| JobQueueError::Payload(err.to_string()))?;
        let affected = conn.execute(
            "UPDATE transcode_jobs SET
                state = 'completed',
                progress_stage = 'done',
                progress_percent = 100,
                progress_quality = NULL,
                manifest_path = ?1,
                produced_qualities = ?2,
                finished_at = CURRENT_TIMESTAMP,
                updated_at = CURRENT_TIMESTAMP
             WHERE job_id = ?3 AND state = 'active'",
            params![&success.manifest_path, qualities, job_id],
        )?;
        if affected == 0 {
            return Err(JobQueueError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    /// Schedules a retry: attempt advances, progress resets, the job waits out
    /// its backoff in `retrying` until `release_ready` promotes it.
    pub fn mark_retrying(
        &self,
        job_id: &str,
        delay: Duration,
        kind: JobErrorKind,
        detail: &str,
    ) -> JobQueueResult<()> {
        let conn = self.open()?;
        let not_before = (Utc::now() + delay).naive_utc();
        let affected = conn.execute(
            "UPDATE transcode_jobs SET
                state = 'retrying',
                attempt = attempt + 1,
                not_before = ?1,
                claimed_by = NULL,
                heartbeat_at = NULL,
                progress_stage = NULL,
                progress_percent = 0,
                progress_quality = NULL,
                error_kind = ?2,
                error_detail = ?3,
                updated_at = CURRENT_TIMESTAMP
             WHERE job_id = ?4 AND state = 'active'",
            params![not_before, kind.as_str(), detail, job_id],
        )?;
        if affected == 0 {
            return Err(JobQueueError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    pub fn mark_dead(
        &self,
        job_id: &str,
        kind: JobErrorKind,
        detail: &str,
    ) -> JobQueueResult<()> {
        let conn = self.open()?;
        // A death out of `active` consumed that attempt; keep the counter in
        // step so a dead job reports how many attempts were actually spent.
        let affected = conn.execute(
            "UPDATE transcode_jobs SET
                state = 'dead',
                attempt = CASE WHEN state = 'active' THEN attempt + 1 ELSE attempt END,
                error_kind = ?1,
                error_detail = ?2,
                claimed_by = NULL,
                finished_at = CURRENT_TIMESTAMP,
                updated_at = CURRENT_TIMESTAMP
             WHERE job_id = ?3 AND state IN ('active', 'queued', 'retrying')",
            params![kind.as_str(), detail, job_id],
        )?;
        if affected == 0 {
            return Err(JobQueueError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    /// Removes a pending job. Returns false when the job was not in a
    /// pending state (the runtime then signals the active handler instead).
    pub fn cancel_pending(&self, job_id: &str) -> JobQueueResult<bool> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE transcode_jobs SET
                state = 'cancelled',
                error_kind = 'cancelled',
                claimed_by = NULL,
                finished_at = CURRENT_TIMESTAMP,
                updated_at = CURRENT_TIMESTAMP
             WHERE job_id = ?1 AND state IN ('queued', 'retrying')",
            [job_id],
        )?;
        Ok(affected > 0)
    }

    pub fn mark_cancelled(&self, job_id: &str) -> JobQueueResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE transcode_jobs SET
                state = 'cancelled',
                error_kind = 'cancelled',
                claimed_by = NULL,
                finished_at = CURRENT_TIMESTAMP,
                updated_at = CURRENT_TIMESTAMP
             WHERE job_id = ?1 AND state = 'active'",
            [job_id],
        )?;
        if affected == 0 {
            return Err(JobQueueError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    /// Returns stalled active jobs to the queue (visibility timeout). Each
    /// recycle consumes an attempt; exhausted jobs die instead of looping.
    pub fn recycle_stalled(
        &self,
        stall_timeout: Duration,
        now: DateTime<Utc>,
    ) -> JobQueueResult<usize> {
        let mut conn = self.open()?;
        let cutoff = (now - stall_timeout).naive_utc();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let recycled = tx.execute(
            "UPDATE transcode_jobs SET
                state = 'queued',
                attempt = attempt + 1,
                claimed_by = NULL,
                heartbeat_at = NULL,
                not_before = NULL,
                progress_stage = NULL,
                progress_percent = 0,
                progress_quality = NULL,
                updated_at = CURRENT_TIMESTAMP
             WHERE state = 'active' AND heartbeat_at IS NOT NULL AND heartbeat_at < ?1
               AND attempt + 1 < max_attempts",
            [cutoff],
        )?;

        tx.execute(
            "UPDATE transcode_jobs SET
                state = 'dead',
                attempt = attempt + 1,
                error_kind = 'exhausted',
                error_detail = 'worker stopped heartbeating',
                claimed_by = NULL,
                finished_at = CURRENT_TIMESTAMP,
                updated_at = CURRENT_TIMESTAMP
             WHERE state = 'active' AND heartbeat_at IS NOT NULL AND heartbeat_at < ?1",
            [cutoff],
        )?;
        tx.commit()?;
        Ok(recycled)
    }

    /// Manual operator requeue of a dead job; the attempt budget starts over.
    pub fn requeue_dead(&self, job_id: &str) -> JobQueueResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE transcode_jobs SET
                state = 'queued',
                attempt = 0,
                not_before = NULL,
                claimed_by = NULL,
                heartbeat_at = NULL,
                progress_stage = NULL,
                progress_percent = 0,
                progress_quality = NULL,
                error_kind = NULL,
                error_detail = NULL,
                finished_at = NULL,
                updated_at = CURRENT_TIMESTAMP
             WHERE job_id = ?1 AND state = 'dead'",
            [job_id],
        )?;
        if affected == 0 {
            return Err(JobQueueError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    pub fn stats(&self) -> JobQueueResult<QueueStats> {
        let conn = self.open()?;
        let mut stats = QueueStats::default();
        let mut stmt =
            conn.prepare("SELECT state, COUNT(*) FROM transcode_jobs GROUP BY state")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let state: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            match state.parse().unwrap_or(JobState::Queued) {
                JobState::Queued | JobState::Retrying => stats.waiting += count,
                JobState::Active => stats.active += count,
                JobState::Completed => stats.completed += count,
                JobState::Dead => stats.failed += count,
                JobState::Cancelled => stats.cancelled += count,
            }
        }
        Ok(stats)
    }

    pub fn list_recent(&self, limit: usize) -> JobQueueResult<Vec<JobRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM transcode_jobs ORDER BY rowid DESC LIMIT ?1",
        )?;
        let mut rows = stmt.query([limit as i64])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(record_from_row(row)?);
        }
        Ok(records)
    }

    pub fn list_by_asset(&self, asset_id: &str) -> JobQueueResult<Vec<JobRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM transcode_jobs WHERE asset_id = ?1 ORDER BY created_at ASC",
        )?;
        let mut rows = stmt.query([asset_id])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(record_from_row(row)?);
        }
        Ok(records)
    }

    /// Gzipped JSON-lines dump of every job record, newest first.
    pub fn export_backup(&self, output: impl AsRef<Path>) -> JobQueueResult<()> {
        let output = output.as_ref();
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT * FROM transcode_jobs ORDER BY rowid DESC")?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(record_from_row(row)?);
        }
        let file = std::fs::File::create(output)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        for record in records {
            let line = serde_json::to_string(&record)
                .map_err(|err| JobQueueError::Payload(err.to_string()))?;
            writeln!(encoder, "{line}")?;
        }
        encoder.finish()?;
        Ok(())
    }

    pub fn backup_to(&self, destination: impl AsRef<Path>) -> JobQueueResult<()> {
        let destination_path = destination.as_ref();
        let source = self.open()?;
        let mut dest = Connection::open(destination_path)?;
        configure_connection(&dest).map_err(|source| JobQueueError::Open {
            source,
            path: destination_path.to_path_buf(),
        })?;
        let backup = Backup::new(&source, &mut dest)?;
        backup.run_to_completion(10, StdDuration::from_millis(50), None)?;
        Ok(())
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let target_raw: String = row.get("target")?;
    let target = serde_json::from_str(&target_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
    })?;
    let requested: String = row.get("requested_qualities")?;
    let produced: Option<String> = row.get("produced_qualities")?;
    Ok(JobRecord {
        job_id: row.get("job_id")?,
        asset_id: row.get("asset_id")?,
        target,
        source_key: row.get("source_key")?,
        output_base_path: row.get("output_base_path")?,
        requested_qualities: serde_json::from_str(&requested).unwrap_or_default(),
        priority: row.get("priority")?,
        state: row
            .get::<_, String>("state")?
            .parse()
            .unwrap_or(JobState::Queued),
        attempt: row.get::<_, i64>("attempt")? as u32,
        max_attempts: row.get::<_, i64>("max_attempts")? as u32,
        not_before: parse_timestamp(row.get("not_before")?),
        claimed_by: row.get("claimed_by")?,
        heartbeat_at: parse_timestamp(row.get("heartbeat_at")?),
        progress: JobProgress {
            stage: row
                .get::<_, Option<String>>("progress_stage")?
                .unwrap_or_default(),
            percent: row.get::<_, i64>("progress_percent")? as u8,
            current_quality: row.get("progress_quality")?,
        },
        manifest_path: row.get("manifest_path")?,
        produced_qualities: produced
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default(),
        error_kind: row
            .get::<_, Option<String>>("error_kind")?
            .as_deref()
            .and_then(JobErrorKind::parse),
        error_detail: row.get("error_detail")?,
        created_at: parse_timestamp(row.get("created_at")?),
        finished_at: parse_timestamp(row.get("finished_at")?),
    })
}

fn parse_timestamp(value: Option<NaiveDateTime>) -> Option<DateTime<Utc>> {
    value.map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
}
