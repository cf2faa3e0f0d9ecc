use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Duration;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use vod_core::{
    load_delivery_config, load_pipeline_config, load_vod_config, DeliveryConfig, EnqueueOptions,
    FsObjectStore, IngestCoordinator, JobSpec, JobTarget, PipelineConfig, SqliteJobStore,
    SqliteSessionStore, UrlSigner, VodConfig,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] vod_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("queue error: {0}")]
    Queue(#[from] vod_core::JobQueueError),
    #[error("ingest error: {0}")]
    Ingest(#[from] vod_core::IngestError),
    #[error("delivery error: {0}")]
    Delivery(#[from] vod_core::DeliveryError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "VOD pipeline command-line control interface", long_about = None)]
pub struct Cli {
    /// Directory holding vod.toml, pipeline.toml and delivery.toml
    #[arg(long, default_value = "configs")]
    pub config_dir: PathBuf,
    /// Override for the data directory (defaults to paths.data_dir)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Alternative path for jobs.sqlite
    #[arg(long)]
    pub jobs_db: Option<PathBuf>,
    /// Alternative path for sessions.sqlite
    #[arg(long)]
    pub sessions_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show queue statistics and recent activity
    Status,
    /// Transcode job operations
    #[command(subcommand)]
    Job(JobCommands),
    /// Upload session operations
    #[command(subcommand)]
    Session(SessionCommands),
    /// Access-token utilities
    #[command(subcommand)]
    Token(TokenCommands),
    /// Generate shell completions
    Completions { shell: clap_complete::Shell },
}

#[derive(Subcommand, Debug)]
pub enum JobCommands {
    /// List recent jobs
    List(JobListArgs),
    /// Enqueue a transcode job for an already-stored source object
    Enqueue(JobEnqueueArgs),
    /// Cancel a pending job
    Cancel { job_id: String },
    /// Requeue a dead job with a fresh attempt budget
    Requeue { job_id: String },
    /// Show the latest progress snapshot for a job
    Progress { job_id: String },
    /// Write a gzipped JSON-lines dump of the job table
    Export { output: PathBuf },
}

#[derive(Args, Debug)]
pub struct JobListArgs {
    /// Maximum records returned
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct JobEnqueueArgs {
    /// Asset the job produces output for
    #[arg(long)]
    pub asset_id: String,
    /// Source object key in storage
    #[arg(long)]
    pub source_key: String,
    /// Dispatch priority, higher first
    #[arg(long, default_value_t = 0)]
    pub priority: i64,
    /// Quality rungs to request (defaults to the configured ladder)
    #[arg(long)]
    pub quality: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// List recent upload sessions
    List(SessionListArgs),
    /// Reclaim upload sessions idle past the TTL
    Sweep(SessionSweepArgs),
}

#[derive(Args, Debug)]
pub struct SessionListArgs {
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct SessionSweepArgs {
    /// Idle TTL in hours (defaults to limits.session_ttl_hours)
    #[arg(long)]
    pub ttl_hours: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum TokenCommands {
    /// Verify an access token offline and print its claims
    Verify { token: String },
}

struct AppContext {
    vod: VodConfig,
    pipeline: PipelineConfig,
    delivery: DeliveryConfig,
    jobs_db: PathBuf,
    sessions_db: PathBuf,
    format: OutputFormat,
}

impl AppContext {
    fn load(cli: &Cli) -> Result<Self> {
        let vod = load_vod_config(cli.config_dir.join("vod.toml"))?;
        let pipeline = load_pipeline_config(cli.config_dir.join("pipeline.toml"))?;
        let delivery = load_delivery_config(cli.config_dir.join("delivery.toml"))?;
        let data_dir = cli
            .data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(&vod.paths.data_dir));
        let jobs_db = cli.jobs_db.clone().unwrap_or_else(|| data_dir.join("jobs.sqlite"));
        let sessions_db = cli
            .sessions_db
            .clone()
            .unwrap_or_else(|| data_dir.join("sessions.sqlite"));
        Ok(Self {
            vod,
            pipeline,
            delivery,
            jobs_db,
            sessions_db,
            format: cli.format,
        })
    }

    fn job_store(&self) -> Result<SqliteJobStore> {
        if !self.jobs_db.exists() {
            return Err(AppError::MissingResource(format!(
                "job database not found at {}",
                self.jobs_db.display()
            )));
        }
        Ok(SqliteJobStore::new(&self.jobs_db)?)
    }

    fn session_store(&self) -> Result<SqliteSessionStore> {
        if !self.sessions_db.exists() {
            return Err(AppError::MissingResource(format!(
                "session database not found at {}",
                self.sessions_db.display()
            )));
        }
        Ok(SqliteSessionStore::new(&self.sessions_db)?)
    }

    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T) -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
            OutputFormat::Text => println!("{}", text(value)),
        }
        Ok(())
    }
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = &cli.command {
        use clap::CommandFactory;
        let mut command = Cli::command();
        let name = command.get_name().to_string();
        clap_complete::generate(*shell, &mut command, name, &mut std::io::stdout());
        return Ok(());
    }
    let ctx = AppContext::load(&cli)?;
    match &cli.command {
        Commands::Status => status(&ctx),
        Commands::Job(command) => job(&ctx, command),
        Commands::Session(command) => session(&ctx, command),
        Commands::Token(command) => token(&ctx, command),
        Commands::Completions { .. } => Ok(()),
    }
}

fn status(ctx: &AppContext) -> Result<()> {
    let jobs = ctx.job_store()?;
    let stats = jobs.stats()?;
    let recent = jobs.list_recent(5)?;

    #[derive(Serialize)]
    struct StatusView {
        node: String,
        stats: vod_core::QueueStats,
        recent: Vec<JobLine>,
    }
    let view = StatusView {
        node: ctx.vod.system.node_name.clone(),
        stats,
        recent: recent.iter().map(JobLine::from).collect(),
    };
    ctx.emit(&view, |view| {
        let mut out = format!(
            "node {} | waiting {} active {} completed {} failed {} cancelled {}\n",
            view.node,
            view.stats.waiting,
            view.stats.active,
            view.stats.completed,
            view.stats.failed,
            view.stats.cancelled
        );
        for line in &view.recent {
            out.push_str(&format!("{line}\n"));
        }
        out.trim_end().to_string()
    })
}

#[derive(Serialize)]
struct JobLine {
    job_id: String,
    asset_id: String,
    state: String,
    attempt: u32,
    percent: u8,
    stage: String,
    error_kind: Option<String>,
}

impl From<&vod_core::JobRecord> for JobLine {
    fn from(record: &vod_core::JobRecord) -> Self {
        Self {
            job_id: record.job_id.clone(),
            asset_id: record.asset_id.clone(),
            state: record.state.to_string(),
            attempt: record.attempt,
            percent: record.progress.percent,
            stage: record.progress.stage.clone(),
            error_kind: record.error_kind.map(|kind| kind.as_str().to_string()),
        }
    }
}

impl std::fmt::Display for JobLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} attempt={} {}% {}",
            self.job_id, self.asset_id, self.state, self.attempt, self.percent, self.stage
        )?;
        if let Some(kind) = &self.error_kind {
            write!(f, " [{kind}]")?;
        }
        Ok(())
    }
}

fn job(ctx: &AppContext, command: &JobCommands) -> Result<()> {
    let store = match command {
        // Enqueue may run before any worker initialized the database.
        JobCommands::Enqueue(_) => {
            let store = SqliteJobStore::new(&ctx.jobs_db)?;
            store.initialize()?;
            store
        }
        _ => ctx.job_store()?,
    };
    match command {
        JobCommands::List(args) => {
            let records = store.list_recent(args.limit)?;
            let lines: Vec<JobLine> = records.iter().map(JobLine::from).collect();
            ctx.emit(&lines, |lines| {
                lines
                    .iter()
                    .map(|line| line.to_string())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        JobCommands::Enqueue(args) => {
            let qualities = if args.quality.is_empty() {
                ctx.pipeline
                    .transcode
                    .rungs
                    .iter()
                    .map(|rung| rung.name.clone())
                    .collect()
            } else {
                args.quality.clone()
            };
            let spec = JobSpec {
                target: JobTarget::Content {
                    content_id: args.asset_id.clone(),
                },
                source_key: args.source_key.clone(),
                output_base_path: format!("videos/{}/hls", args.asset_id),
                requested_qualities: qualities,
            };
            let options = EnqueueOptions {
                priority: args.priority,
                max_attempts: ctx.pipeline.queue.max_attempts,
                ..EnqueueOptions::default()
            };
            let record = store.enqueue(&spec, &options)?;
            ctx.emit(&JobLine::from(&record), |line| line.to_string())
        }
        JobCommands::Cancel { job_id } => {
            if store.cancel_pending(job_id)? {
                println!("job {job_id} cancelled");
                Ok(())
            } else {
                Err(AppError::MissingResource(format!(
                    "job {job_id} is not pending; a running job must be cancelled through its worker"
                )))
            }
        }
        JobCommands::Requeue { job_id } => {
            store.requeue_dead(job_id)?;
            println!("job {job_id} requeued");
            Ok(())
        }
        JobCommands::Progress { job_id } => {
            let record = store
                .fetch(job_id)?
                .ok_or_else(|| AppError::MissingResource(format!("job {job_id} not found")))?;
            ctx.emit(&JobLine::from(&record), |line| line.to_string())
        }
        JobCommands::Export { output } => {
            store.export_backup(output)?;
            println!("job table exported to {}", output.display());
            Ok(())
        }
    }
}

fn session(ctx: &AppContext, command: &SessionCommands) -> Result<()> {
    let store = ctx.session_store()?;
    match command {
        SessionCommands::List(args) => {
            let sessions = store.list_recent(args.limit)?;
            ctx.emit(&sessions, |sessions| {
                sessions
                    .iter()
                    .map(|session| {
                        format!(
                            "{} {} {} {}/{} parts",
                            session.session_id,
                            session.object_key,
                            session.status,
                            session.uploaded_parts.len(),
                            session.expected_parts
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        SessionCommands::Sweep(args) => {
            let jobs = SqliteJobStore::new(&ctx.jobs_db)?;
            jobs.initialize()?;
            let storage = Arc::new(FsObjectStore::new(Path::new(&ctx.vod.paths.storage_dir)));
            let coordinator = IngestCoordinator::new(
                store,
                storage,
                jobs,
                ctx.vod.limits.clone(),
                ctx.pipeline.clone(),
            );
            let ttl_hours = args.ttl_hours.unwrap_or(ctx.vod.limits.session_ttl_hours);
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let reclaimed =
                runtime.block_on(coordinator.sweep_expired(Duration::hours(ttl_hours as i64)))?;
            println!("{reclaimed} stale sessions reclaimed");
            Ok(())
        }
    }
}

fn token(ctx: &AppContext, command: &TokenCommands) -> Result<()> {
    match command {
        TokenCommands::Verify { token } => {
            let signer = UrlSigner::from_secret_file(&ctx.delivery.signing.token_secret_path)
                .map_err(|_| {
                    AppError::MissingResource(format!(
                        "token secret not readable at {}",
                        ctx.delivery.signing.token_secret_path
                    ))
                })?;
            match signer.verify(token) {
                Ok(claims) => ctx.emit(&claims, |claims| {
                    format!(
                        "asset {} viewer {} expires {}",
                        claims.asset_id,
                        claims.viewer_id.as_deref().unwrap_or("-"),
                        claims.expires_at
                    )
                }),
                Err(err) => {
                    println!("token rejected: {err}");
                    Ok(())
                }
            }
        }
    }
}
