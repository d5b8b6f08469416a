use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres};
use std::time::Duration;

use csvtrack_core::models::{StatusUpdate, UploadRecord, UploadStatus};
use csvtrack_core::{PipelineConfig, StoreError, StoreResult};

use crate::store::{RecordStore, MAX_LIST_LIMIT};

const UPLOAD_COLUMNS: &str = r#"
    fingerprint,
    status,
    bucket,
    object_name,
    size,
    created_time,
    queued_at,
    processing_started_at,
    processing_completed_at,
    failed_at,
    error_message,
    lines_processed,
    updated_at
"#;

/// Connect to Postgres and apply pending migrations.
pub async fn connect_pool(database_url: &str, config: &PipelineConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(config.db_timeout_seconds))
        .connect(database_url)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    tracing::info!(
        max_connections = config.db_max_connections,
        "Database pool ready"
    );

    Ok(pool)
}

/// Postgres-backed record store.
///
/// Conditional writes are a single `UPDATE ... WHERE status = ANY($2)`, so the
/// database row lock serializes concurrent transitions of the same record.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn set_clause(update: &StatusUpdate) -> &'static str {
    match update {
        StatusUpdate::Requeue { .. } => {
            r#"status = 'pending',
               queued_at = $3,
               processing_started_at = NULL,
               processing_completed_at = NULL,
               failed_at = NULL,
               error_message = NULL,
               lines_processed = NULL,
               updated_at = $3"#
        }
        StatusUpdate::Start { .. } => {
            r#"status = 'processing',
               processing_started_at = COALESCE(processing_started_at, $3),
               failed_at = NULL,
               error_message = NULL,
               updated_at = $3"#
        }
        StatusUpdate::Complete { .. } => {
            r#"status = 'done',
               processing_completed_at = COALESCE(processing_completed_at, $3),
               lines_processed = $4,
               failed_at = NULL,
               error_message = NULL,
               updated_at = $3"#
        }
        StatusUpdate::Fail { .. } => {
            r#"status = 'failed',
               failed_at = COALESCE(failed_at, $3),
               error_message = $4,
               updated_at = $3"#
        }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[tracing::instrument(skip(self))]
    async fn get(&self, fingerprint: &str) -> StoreResult<Option<UploadRecord>> {
        let sql = format!(
            "SELECT {} FROM uploads WHERE fingerprint = $1",
            UPLOAD_COLUMNS
        );
        let record = sqlx::query_as::<Postgres, UploadRecord>(&sql)
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    #[tracing::instrument(skip(self, record), fields(fingerprint = %record.fingerprint))]
    async fn create_if_absent(&self, record: &UploadRecord) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO uploads (
                fingerprint, status, bucket, object_name, size, created_time,
                queued_at, processing_started_at, processing_completed_at, failed_at,
                error_message, lines_processed, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (fingerprint) DO NOTHING
            "#,
        )
        .bind(&record.fingerprint)
        .bind(record.status.as_str())
        .bind(&record.source.bucket)
        .bind(&record.source.object_name)
        .bind(record.source.size as i64)
        .bind(record.created_time)
        .bind(record.queued_at)
        .bind(record.processing_started_at)
        .bind(record.processing_completed_at)
        .bind(record.failed_at)
        .bind(&record.error_message)
        .bind(record.lines_processed.map(|n| n as i64))
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() == 1;
        tracing::debug!(created, "Upload record insert");
        Ok(created)
    }

    #[tracing::instrument(skip(self, update), fields(target = %update.target()))]
    async fn transition(
        &self,
        fingerprint: &str,
        expected: &[UploadStatus],
        update: StatusUpdate,
    ) -> StoreResult<UploadRecord> {
        let sql = format!(
            "UPDATE uploads SET {} WHERE fingerprint = $1 AND status = ANY($2) AND status <> 'done' RETURNING {}",
            set_clause(&update),
            UPLOAD_COLUMNS
        );
        let expected_names: Vec<String> = expected.iter().map(|s| s.as_str().to_string()).collect();

        let query = sqlx::query_as::<Postgres, UploadRecord>(&sql)
            .bind(fingerprint)
            .bind(expected_names)
            .bind(update.at());
        let query = match &update {
            StatusUpdate::Complete {
                lines_processed, ..
            } => query.bind(*lines_processed as i64),
            StatusUpdate::Fail { error_message, .. } => query.bind(error_message.clone()),
            StatusUpdate::Requeue { .. } | StatusUpdate::Start { .. } => query,
        };

        if let Some(record) = query.fetch_optional(&self.pool).await? {
            tracing::debug!(status = %record.status, "Upload record transitioned");
            return Ok(record);
        }

        // Nothing matched: tell apart a missing record from a lost conditional write.
        match self.get(fingerprint).await? {
            None => Err(StoreError::NotFound(fingerprint.to_string())),
            Some(current) => Err(StoreError::Conflict {
                fingerprint: fingerprint.to_string(),
                expected: expected.to_vec(),
                actual: current.status,
            }),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn list(
        &self,
        status: Option<UploadStatus>,
        limit: usize,
    ) -> StoreResult<Vec<UploadRecord>> {
        let limit = limit.min(MAX_LIST_LIMIT) as i64;
        let records = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {} FROM uploads WHERE status = $1 ORDER BY updated_at DESC, fingerprint LIMIT $2",
                    UPLOAD_COLUMNS
                );
                sqlx::query_as::<Postgres, UploadRecord>(&sql)
                    .bind(status.as_str())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM uploads ORDER BY updated_at DESC, fingerprint LIMIT $1",
                    UPLOAD_COLUMNS
                );
                sqlx::query_as::<Postgres, UploadRecord>(&sql)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(records)
    }

    #[tracing::instrument(skip(self))]
    async fn list_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<UploadRecord>> {
        let sql = format!(
            "SELECT {} FROM uploads WHERE status = 'pending' AND updated_at < $1 ORDER BY updated_at ASC LIMIT $2",
            UPLOAD_COLUMNS
        );
        let records = sqlx::query_as::<Postgres, UploadRecord>(&sql)
            .bind(older_than)
            .bind(limit.min(MAX_LIST_LIMIT) as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }
}
