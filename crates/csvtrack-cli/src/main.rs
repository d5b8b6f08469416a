//! csvtrack CLI: runs the ingestion pipeline against a local bucket directory
//! and inspects upload records.
//!
//! Configuration comes from the environment (see `PipelineConfig::from_env`).
//! Without DATABASE_URL records live in memory and vanish when the command exits.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use csvtrack_cli::{
    format_upload_row, notification_for, print_json, OutputFormat, RunSummary, StatsSummary,
    UPLOAD_TABLE_HEADER,
};
use csvtrack_core::models::{UploadNotification, UploadRecord, UploadStatus};
use csvtrack_core::PipelineConfig;
use csvtrack_db::{connect_pool, InMemoryRecordStore, PgRecordStore, RecordStore};
use csvtrack_infra::{init_telemetry, shutdown_telemetry, LogFormat};
use csvtrack_services::{
    DispatchOutcome, LocalStorage, Pipeline, StatusError, StatusService, Storage,
};

#[derive(Parser)]
#[command(name = "csvtrack", about = "Idempotent CSV ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch every object of a bucket and process until the queue drains
    Process {
        /// Bucket directory under CSVTRACK_STORAGE_ROOT
        bucket: String,
        /// Maximum number of dead letters to include in the summary
        #[arg(long, default_value = "100")]
        dead_letter_limit: usize,
    },
    /// Dispatch a single upload notification (JSON) and process it
    Event {
        /// File holding the notification; reads stdin when omitted
        file: Option<PathBuf>,
    },
    /// Show the processing record of one upload
    Status {
        /// Upload fingerprint
        fingerprint: String,
    },
    /// List uploads, most recently updated first
    List {
        /// Filter by status: pending, processing, done, failed
        #[arg(long)]
        status: Option<UploadStatus>,
        /// Maximum number of records
        #[arg(long)]
        limit: Option<usize>,
        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
    /// Republish stale Pending records once and process them
    Reconcile,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = PipelineConfig::from_env().context("Invalid configuration")?;

    let log_format: LogFormat = config
        .log_format
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    init_telemetry("csvtrack", log_format)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;

    let store = open_store(&config).await?;

    let result = match cli.command {
        Commands::Process {
            bucket,
            dead_letter_limit,
        } => process_bucket(store, &config, &bucket, dead_letter_limit).await,
        Commands::Event { file } => process_event(store, &config, file).await,
        Commands::Status { fingerprint } => {
            let service = StatusService::new(store);
            match service.get_status(&fingerprint).await {
                Ok(record) => print_json(&record),
                Err(StatusError::NotFound(fp)) => {
                    Err(anyhow::anyhow!("No upload with fingerprint {}", fp))
                }
                Err(e) => Err(e.into()),
            }
        }
        Commands::List {
            status,
            limit,
            format,
        } => {
            let service = StatusService::new(store);
            let records = service.list_uploads(status, limit).await?;
            match format {
                OutputFormat::Json => print_json(&records),
                OutputFormat::Table => {
                    print_upload_table(&records);
                    Ok(())
                }
            }
        }
        Commands::Reconcile => reconcile(store, &config).await,
    };

    shutdown_telemetry().await;
    result
}

async fn open_store(config: &PipelineConfig) -> anyhow::Result<Arc<dyn RecordStore>> {
    match &config.database_url {
        Some(url) => {
            let pool = connect_pool(url, config).await?;
            Ok(Arc::new(PgRecordStore::new(pool)))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; records are kept in memory for this run only");
            Ok(Arc::new(InMemoryRecordStore::new()))
        }
    }
}

async fn open_storage(config: &PipelineConfig) -> anyhow::Result<Arc<LocalStorage>> {
    let storage = LocalStorage::new(&config.storage_root)
        .await
        .with_context(|| format!("Failed to open storage root {}", config.storage_root))?;
    Ok(Arc::new(storage))
}

async fn process_bucket(
    store: Arc<dyn RecordStore>,
    config: &PipelineConfig,
    bucket: &str,
    dead_letter_limit: usize,
) -> anyhow::Result<()> {
    let storage = open_storage(config).await?;
    let objects = storage
        .list(bucket)
        .await
        .with_context(|| format!("Failed to list bucket {}", bucket))?;

    let mut notifications = Vec::with_capacity(objects.len());
    for name in &objects {
        let meta = storage.head(bucket, name).await?;
        notifications.push(notification_for(bucket, name, &meta));
    }

    let pipeline = Pipeline::start(store, storage, config);
    let dispatched = dispatch_all(&pipeline, &notifications).await;
    drain(&pipeline).await;

    let mut uploads = Vec::new();
    for fingerprint in dispatched.iter().filter_map(DispatchOutcome::fingerprint) {
        uploads.push(pipeline.status().get_status(fingerprint).await?);
    }

    let summary = RunSummary {
        bucket: bucket.to_string(),
        dispatched,
        uploads,
        dead_letters: pipeline.dead_letters().list(dead_letter_limit),
        stats: StatsSummary::from(pipeline.stats()),
    };
    pipeline.shutdown().await;
    print_json(&summary)
}

async fn process_event(
    store: Arc<dyn RecordStore>,
    config: &PipelineConfig,
    file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let raw = match file {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .context("Failed to read notification from stdin")?;
            buf
        }
    };
    let notification: UploadNotification =
        serde_json::from_str(&raw).context("Invalid upload notification")?;

    let storage = open_storage(config).await?;
    let pipeline = Pipeline::start(store, storage, config);
    let outcome = pipeline.dispatcher().on_upload(&notification).await?;
    drain(&pipeline).await;

    let record = match outcome.fingerprint() {
        Some(fingerprint) => Some(pipeline.status().get_status(fingerprint).await?),
        None => None,
    };
    let dead_letters = pipeline.dead_letters().list(usize::MAX);
    pipeline.shutdown().await;

    print_json(&serde_json::json!({
        "dispatch": outcome,
        "upload": record,
        "dead_letters": dead_letters,
    }))
}

async fn reconcile(store: Arc<dyn RecordStore>, config: &PipelineConfig) -> anyhow::Result<()> {
    let storage = open_storage(config).await?;
    let pipeline = Pipeline::start(store, storage, config);
    let republished = pipeline.reconcile_once().await?;
    drain(&pipeline).await;

    let stats = StatsSummary::from(pipeline.stats());
    pipeline.shutdown().await;
    print_json(&serde_json::json!({
        "republished": republished,
        "stats": stats,
    }))
}

/// Dispatch failures are logged and skipped; the record stays Pending for a
/// later reconcile.
async fn dispatch_all(
    pipeline: &Pipeline,
    notifications: &[UploadNotification],
) -> Vec<DispatchOutcome> {
    let mut outcomes = Vec::with_capacity(notifications.len());
    for notification in notifications {
        match pipeline.dispatcher().on_upload(notification).await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => tracing::error!(
                object_name = %notification.name,
                error = %e,
                "Failed to dispatch upload"
            ),
        }
    }
    outcomes
}

async fn drain(pipeline: &Pipeline) {
    tokio::select! {
        _ = pipeline.wait_until_drained() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted before the queue drained");
        }
    }
}

fn print_upload_table(records: &[UploadRecord]) {
    if records.is_empty() {
        println!("No uploads found.");
        return;
    }

    println!("{}", UPLOAD_TABLE_HEADER);
    println!("{}", "-".repeat(UPLOAD_TABLE_HEADER.len() + 20));
    for record in records {
        println!("{}", format_upload_row(record));
    }
}
