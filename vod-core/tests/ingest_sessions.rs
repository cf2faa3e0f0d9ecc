use std::path::Path;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

use vod_core::config::load_pipeline_config;
use vod_core::{
    FsObjectStore, IngestCoordinator, IngestError, JobState, JobTarget, ObjectStore,
    PipelineConfig, SessionStatus, SqliteJobStore, SqliteSessionStore,
};

fn fixture_pipeline_config() -> PipelineConfig {
    load_pipeline_config(Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/pipeline.toml"))
        .expect("pipeline config parses")
}

struct Harness {
    dir: TempDir,
    storage: Arc<FsObjectStore>,
    jobs: SqliteJobStore,
    coordinator: IngestCoordinator,
}

fn limits() -> vod_core::config::LimitsSection {
    vod_core::config::LimitsSection {
        max_upload_bytes: 1024 * 1024,
        min_part_bytes: 4,
        max_part_bytes: 64,
        session_ttl_hours: 24,
    }
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(FsObjectStore::new(dir.path().join("bucket")));
        let sessions = SqliteSessionStore::builder()
            .path(dir.path().join("sessions.sqlite"))
            .build()
            .unwrap();
        sessions.initialize().unwrap();
        let jobs = SqliteJobStore::builder()
            .path(dir.path().join("jobs.sqlite"))
            .build()
            .unwrap();
        jobs.initialize().unwrap();
        let mut pipeline = fixture_pipeline_config();
        pipeline.ingest.default_part_bytes = 16;
        let coordinator = IngestCoordinator::new(
            sessions,
            storage.clone(),
            jobs.clone(),
            limits(),
            pipeline,
        );
        Self {
            dir,
            storage,
            jobs,
            coordinator,
        }
    }

    fn target(asset: &str) -> JobTarget {
        JobTarget::Content {
            content_id: asset.to_string(),
        }
    }

    /// Pushes `data` split into the session's parts and acknowledges each
    /// storage receipt, the way a client drives the part handles.
    async fn upload_parts(&self, session: &vod_core::UploadSession, data: &[u8]) {
        for (index, chunk) in data.chunks(session.part_size as usize).enumerate() {
            let part_number = index as u32 + 1;
            let receipt = self
                .storage
                .put_part(&session.upload_ref, part_number, chunk)
                .await
                .unwrap();
            self.coordinator
                .acknowledge_part(&session.session_id, part_number, &receipt.checksum)
                .await
                .unwrap();
        }
    }
}

#[tokio::test]
async fn chunked_upload_finalizes_and_queues_a_transcode() {
    let harness = Harness::new();
    let payload = b"0123456789abcdef0123456789abcdef01234567";
    let begin = harness
        .coordinator
        .begin_upload(
            Harness::target("movie-1"),
            "videos/movie-1/original/source.mp4",
            payload.len() as u64,
            "video/mp4",
            None,
        )
        .await
        .unwrap();

    assert_eq!(begin.session.expected_parts, 3);
    assert_eq!(begin.part_handles.len(), 3);
    assert_eq!(begin.session.status, SessionStatus::Uploading);

    harness.upload_parts(&begin.session, payload).await;
    let object_key = harness
        .coordinator
        .finalize_upload(&begin.session.session_id)
        .await
        .unwrap();
    assert_eq!(object_key, "videos/movie-1/original/source.mp4");

    // Object composed byte-for-byte.
    let check = harness.dir.path().join("composed.bin");
    harness.storage.get_object(&object_key, &check).await.unwrap();
    assert_eq!(std::fs::read(&check).unwrap(), payload);

    // Session terminal, transcode job queued for the asset.
    let session = harness
        .coordinator
        .session_status(&begin.session.session_id)
        .unwrap();
    assert_eq!(session.status, SessionStatus::Completed);

    let jobs = harness.jobs.list_by_asset("movie-1").unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Queued);
    assert_eq!(jobs[0].source_key, object_key);
    assert_eq!(jobs[0].output_base_path, "videos/movie-1/hls");
    assert!(!jobs[0].requested_qualities.is_empty());

    // Finalize is idempotent once completed.
    let again = harness
        .coordinator
        .finalize_upload(&begin.session.session_id)
        .await
        .unwrap();
    assert_eq!(again, object_key);
    assert_eq!(harness.jobs.list_by_asset("movie-1").unwrap().len(), 1);
}

#[tokio::test]
async fn finalize_with_missing_parts_lists_them_and_stays_resumable() {
    let harness = Harness::new();
    let payload = b"0123456789abcdef0123456789abcdef";
    let begin = harness
        .coordinator
        .begin_upload(
            Harness::target("movie-2"),
            "videos/movie-2/original/source.mp4",
            payload.len() as u64,
            "video/mp4",
            None,
        )
        .await
        .unwrap();
    assert_eq!(begin.session.expected_parts, 2);

    // Only the first part arrives.
    let receipt = harness
        .storage
        .put_part(&begin.session.upload_ref, 1, &payload[..16])
        .await
        .unwrap();
    harness
        .coordinator
        .acknowledge_part(&begin.session.session_id, 1, &receipt.checksum)
        .await
        .unwrap();

    let err = harness
        .coordinator
        .finalize_upload(&begin.session.session_id)
        .await
        .unwrap_err();
    match err {
        IngestError::IncompleteParts { missing } => assert_eq!(missing, vec![2]),
        other => panic!("unexpected error: {other}"),
    }

    // Nothing finalized partially; the client resumes with the missing part.
    let session = harness
        .coordinator
        .session_status(&begin.session.session_id)
        .unwrap();
    assert_eq!(session.status, SessionStatus::Uploading);

    let receipt = harness
        .storage
        .put_part(&begin.session.upload_ref, 2, &payload[16..])
        .await
        .unwrap();
    harness
        .coordinator
        .acknowledge_part(&begin.session.session_id, 2, &receipt.checksum)
        .await
        .unwrap();
    harness
        .coordinator
        .finalize_upload(&begin.session.session_id)
        .await
        .unwrap();
}

#[tokio::test]
async fn re_acknowledging_a_part_replaces_its_checksum() {
    let harness = Harness::new();
    let begin = harness
        .coordinator
        .begin_upload(
            Harness::target("movie-3"),
            "videos/movie-3/original/source.mp4",
            16,
            "video/mp4",
            None,
        )
        .await
        .unwrap();

    let stale = harness
        .storage
        .put_part(&begin.session.upload_ref, 1, b"old part contents")
        .await
        .unwrap();
    harness
        .coordinator
        .acknowledge_part(&begin.session.session_id, 1, &stale.checksum)
        .await
        .unwrap();

    // Client retries the part with fresh bytes.
    let fresh = harness
        .storage
        .put_part(&begin.session.upload_ref, 1, b"new part contents")
        .await
        .unwrap();
    harness
        .coordinator
        .acknowledge_part(&begin.session.session_id, 1, &fresh.checksum)
        .await
        .unwrap();

    let session = harness
        .coordinator
        .session_status(&begin.session.session_id)
        .unwrap();
    assert_eq!(session.uploaded_parts.len(), 1);
    assert_eq!(session.uploaded_parts[0].checksum, fresh.checksum);

    harness
        .coordinator
        .finalize_upload(&begin.session.session_id)
        .await
        .unwrap();
}

#[tokio::test]
async fn upload_validation_rejects_bad_requests() {
    let harness = Harness::new();

    let oversize = harness
        .coordinator
        .begin_upload(
            Harness::target("movie-4"),
            "videos/movie-4/original/huge.mp4",
            limits().max_upload_bytes + 1,
            "video/mp4",
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(oversize, IngestError::Validation(_)));

    let bad_type = harness
        .coordinator
        .begin_upload(
            Harness::target("movie-4"),
            "videos/movie-4/original/poster.png",
            64,
            "image/png",
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(bad_type, IngestError::Validation(_)));

    let unknown = harness
        .coordinator
        .acknowledge_part("up-missing", 1, "abc")
        .await
        .unwrap_err();
    assert!(matches!(unknown, IngestError::NotFound(_)));
}

#[tokio::test]
async fn abort_is_terminal_but_repeatable() {
    let harness = Harness::new();
    let begin = harness
        .coordinator
        .begin_upload(
            Harness::target("movie-5"),
            "videos/movie-5/original/source.mp4",
            32,
            "video/mp4",
            None,
        )
        .await
        .unwrap();

    harness
        .coordinator
        .abort_upload(&begin.session.session_id)
        .await
        .unwrap();
    let session = harness
        .coordinator
        .session_status(&begin.session.session_id)
        .unwrap();
    assert_eq!(session.status, SessionStatus::Aborted);

    // Safe to call again, and parts are refused afterwards.
    harness
        .coordinator
        .abort_upload(&begin.session.session_id)
        .await
        .unwrap();
    let refused = harness
        .coordinator
        .acknowledge_part(&begin.session.session_id, 1, "abc")
        .await
        .unwrap_err();
    assert!(matches!(refused, IngestError::Validation(_)));
}

#[tokio::test]
async fn stale_sessions_are_reclaimed_by_the_sweep() {
    let harness = Harness::new();
    let begin = harness
        .coordinator
        .begin_upload(
            Harness::target("movie-6"),
            "videos/movie-6/original/source.mp4",
            32,
            "video/mp4",
            None,
        )
        .await
        .unwrap();

    // CURRENT_TIMESTAMP has second precision; let the session age past it.
    sleep(StdDuration::from_millis(1100)).await;
    let reclaimed = harness
        .coordinator
        .sweep_expired(Duration::zero())
        .await
        .unwrap();
    assert_eq!(reclaimed, 1);

    let session = harness
        .coordinator
        .session_status(&begin.session.session_id)
        .unwrap();
    assert_eq!(session.status, SessionStatus::Failed);

    // Terminal sessions are not swept twice.
    let reclaimed = harness
        .coordinator
        .sweep_expired(Duration::zero())
        .await
        .unwrap();
    assert_eq!(reclaimed, 0);
}
