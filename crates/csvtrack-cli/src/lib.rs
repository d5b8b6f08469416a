use anyhow::Context;
use clap::ValueEnum;
use serde::Serialize;

use csvtrack_core::models::{DeadLetter, UploadNotification, UploadRecord};
use csvtrack_services::{DispatchOutcome, QueueStats};
use csvtrack_storage::ObjectMetadata;

/// Truncate a string to max_len characters, appending "..." if truncated.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

pub fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Serialize output")?;
    println!("{}", out);
    Ok(())
}

/// The notification a storage event would carry for an existing object.
pub fn notification_for(bucket: &str, name: &str, meta: &ObjectMetadata) -> UploadNotification {
    UploadNotification {
        bucket: bucket.to_string(),
        name: name.to_string(),
        size: meta.size,
        created_at: meta.created_at,
    }
}

#[derive(Debug, Serialize)]
pub struct StatsSummary {
    pub ready: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

impl From<QueueStats> for StatsSummary {
    fn from(stats: QueueStats) -> Self {
        Self {
            ready: stats.ready,
            delayed: stats.delayed,
            in_flight: stats.in_flight,
            dead_lettered: stats.dead_lettered,
        }
    }
}

/// Everything `csvtrack process` reports once the queue has drained.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub bucket: String,
    pub dispatched: Vec<DispatchOutcome>,
    pub uploads: Vec<UploadRecord>,
    pub dead_letters: Vec<DeadLetter>,
    pub stats: StatsSummary,
}

/// How listings are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
}

pub const UPLOAD_TABLE_HEADER: &str = "FINGERPRINT      STATUS      LINES     UPDATED AT           OBJECT";

/// One row of the `list --format table` output.
pub fn format_upload_row(record: &UploadRecord) -> String {
    let lines = record
        .lines_processed
        .map(|n| n.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:<16} {:<11} {:>5}     {:<20} {}",
        record.fingerprint,
        record.status.as_str(),
        lines,
        record.updated_at.format("%Y-%m-%d %H:%M:%S"),
        truncate_string(
            &format!("{}/{}", record.source.bucket, record.source.object_name),
            48
        )
    )
}
