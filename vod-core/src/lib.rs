pub mod catalog;
pub mod config;
pub mod delivery;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod sqlite;
pub mod storage;
pub mod transcode;

pub use catalog::{
    AssetCatalog, CatalogError, Entitlement, EntitlementOracle, MediaAsset, ProcessingStatus,
    SqliteAssetStore, SqliteAssetStoreBuilder,
};
pub use config::{
    load_delivery_config, load_pipeline_config, load_vod_config, ConfigBundle, DeliveryConfig,
    PipelineConfig, VodConfig,
};
pub use delivery::{
    AccessClaims, CdnPurger, DeliveryError, DeliveryGate, SegmentAccess, StreamAccess, UrlSigner,
};
pub use error::{ConfigError, Result};
pub use ingest::{
    BeginUploadOutcome, IngestCoordinator, IngestError, SessionStatus, SqliteSessionStore,
    UploadPartHandle, UploadSession, UploadedPart,
};
pub use jobs::{
    CancelOutcome, EnqueueOptions, JobContext, JobErrorKind, JobFailure, JobHandler, JobProgress,
    JobQueue, JobQueueError, JobRecord, JobSpec, JobState, JobSuccess, JobTarget, QueueStats,
    SqliteJobStore,
};
pub use storage::{CachePolicy, FsObjectStore, ObjectMeta, ObjectStore, PartReceipt, StorageError};
pub use transcode::{
    FfmpegEncoder, FfprobeProber, MediaProber, QualityLadder, QualityRung, SegmentEncoder,
    SourceInfo, TranscodeError, TranscodePipeline,
};
