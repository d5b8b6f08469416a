use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use crate::fingerprint::{compute_fingerprint, Fingerprint};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "text", rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl UploadStatus {
    pub const ALL: [UploadStatus; 4] = [
        UploadStatus::Pending,
        UploadStatus::Processing,
        UploadStatus::Done,
        UploadStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Processing => "processing",
            UploadStatus::Done => "done",
            UploadStatus::Failed => "failed",
        }
    }
}

impl Display for UploadStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UploadStatus::Pending),
            "processing" => Ok(UploadStatus::Processing),
            "done" => Ok(UploadStatus::Done),
            "failed" => Ok(UploadStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid upload status: {}", s)),
        }
    }
}

/// Where an uploaded object lives. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    pub bucket: String,
    pub object_name: String,
    pub size: u64,
}

/// Storage notification for a newly created object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadNotification {
    pub bucket: String,
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl UploadNotification {
    pub fn fingerprint(&self) -> Fingerprint {
        compute_fingerprint(&self.bucket, &self.name, self.size, self.created_at)
    }

    pub fn source(&self) -> SourceLocation {
        SourceLocation {
            bucket: self.bucket.clone(),
            object_name: self.name.clone(),
            size: self.size,
        }
    }

    pub fn is_csv(&self) -> bool {
        self.name.to_lowercase().ends_with(".csv")
    }
}

/// Processing record of one upload, keyed by fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadRecord {
    pub fingerprint: Fingerprint,
    pub status: UploadStatus,
    pub source: SourceLocation,
    pub created_time: Option<DateTime<Utc>>,
    pub queued_at: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub lines_processed: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

impl UploadRecord {
    /// A fresh Pending record for a notification, queued at `now`.
    pub fn pending(notification: &UploadNotification, now: DateTime<Utc>) -> Self {
        Self {
            fingerprint: notification.fingerprint(),
            status: UploadStatus::Pending,
            source: notification.source(),
            created_time: notification.created_at,
            queued_at: Some(now),
            processing_started_at: None,
            processing_completed_at: None,
            failed_at: None,
            error_message: None,
            lines_processed: None,
            updated_at: now,
        }
    }

    /// Apply a status update in place. Callers are responsible for checking the
    /// expected prior status; this only encodes how each field changes.
    pub fn apply(&mut self, update: &StatusUpdate) {
        match update {
            StatusUpdate::Requeue { at } => {
                self.status = UploadStatus::Pending;
                self.queued_at = Some(*at);
                self.processing_started_at = None;
                self.processing_completed_at = None;
                self.failed_at = None;
                self.error_message = None;
                self.lines_processed = None;
            }
            StatusUpdate::Start { at } => {
                self.status = UploadStatus::Processing;
                self.processing_started_at.get_or_insert(*at);
                self.failed_at = None;
                self.error_message = None;
            }
            StatusUpdate::Complete {
                at,
                lines_processed,
            } => {
                self.status = UploadStatus::Done;
                self.processing_completed_at.get_or_insert(*at);
                self.lines_processed = Some(*lines_processed);
                self.failed_at = None;
                self.error_message = None;
            }
            StatusUpdate::Fail { at, error_message } => {
                self.status = UploadStatus::Failed;
                self.failed_at.get_or_insert(*at);
                self.error_message = Some(error_message.clone());
            }
        }
        self.updated_at = update.at();
    }
}

/// A single-record status change, applied by the record store only when the
/// current status matches the caller's expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    /// Back to Pending for a new processing cycle; clears cycle timestamps.
    Requeue { at: DateTime<Utc> },
    /// Processing; `processing_started_at` is only set the first time.
    Start { at: DateTime<Utc> },
    Complete {
        at: DateTime<Utc>,
        lines_processed: u64,
    },
    Fail {
        at: DateTime<Utc>,
        error_message: String,
    },
}

impl StatusUpdate {
    pub fn target(&self) -> UploadStatus {
        match self {
            StatusUpdate::Requeue { .. } => UploadStatus::Pending,
            StatusUpdate::Start { .. } => UploadStatus::Processing,
            StatusUpdate::Complete { .. } => UploadStatus::Done,
            StatusUpdate::Fail { .. } => UploadStatus::Failed,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            StatusUpdate::Requeue { at }
            | StatusUpdate::Start { at }
            | StatusUpdate::Complete { at, .. }
            | StatusUpdate::Fail { at, .. } => *at,
        }
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for UploadRecord {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(UploadRecord {
            fingerprint: row.get("fingerprint"),
            status: row.get::<String, _>("status").parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse status: {}", e).into())
            })?,
            source: SourceLocation {
                bucket: row.get("bucket"),
                object_name: row.get("object_name"),
                size: row.get::<i64, _>("size") as u64,
            },
            created_time: row.get("created_time"),
            queued_at: row.get("queued_at"),
            processing_started_at: row.get("processing_started_at"),
            processing_completed_at: row.get("processing_completed_at"),
            failed_at: row.get("failed_at"),
            error_message: row.get("error_message"),
            lines_processed: row
                .get::<Option<i64>, _>("lines_processed")
                .map(|n| n as u64),
            updated_at: row.get("updated_at"),
        })
    }
}
