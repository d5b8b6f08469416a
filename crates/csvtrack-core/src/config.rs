//! Configuration module
//!
//! `PipelineConfig` is built once at startup from `CSVTRACK_*` environment
//! variables (a `.env` file is honoured) and handed to each component when it is
//! constructed. Components derive their own settings from it.

use std::env;
use std::time::Duration;

const DB_MAX_CONNECTIONS: u32 = 10;
const DB_TIMEOUT_SECS: u64 = 30;
const STORAGE_ROOT: &str = "./data";
const WORKER_COUNT: usize = 4;
const MAX_DELIVERY_ATTEMPTS: u32 = 5;
const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_MAX_MS: u64 = 60_000;
const ACK_DEADLINE_SECS: u64 = 60;
const PROCESSING_TIMEOUT_SECS: u64 = 50;
const PUBLISH_TIMEOUT_MS: u64 = 5_000;
const QUEUE_CAPACITY: usize = 10_000;
const LEASE_REAP_INTERVAL_MS: u64 = 1_000;
const RECONCILE_INTERVAL_SECS: u64 = 60;
const RECONCILE_GRACE_SECS: u64 = 300;

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub environment: String,
    /// Postgres record store; the in-memory store is used when unset.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    /// Root directory of the local storage backend; buckets are subdirectories.
    pub storage_root: String,
    /// "text" or "json"
    pub log_format: String,
    pub worker_count: usize,
    pub max_delivery_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub ack_deadline_secs: u64,
    /// Internal handler timeout, must stay below the ack deadline.
    pub processing_timeout_secs: u64,
    pub publish_timeout_ms: u64,
    pub queue_capacity: usize,
    pub lease_reap_interval_ms: u64,
    /// Interval between reconciliation sweeps of stale Pending records. 0 = disabled.
    pub reconcile_interval_secs: u64,
    /// Age after which a Pending record is considered to have lost its message.
    pub reconcile_grace_secs: u64,
    /// Ignore notifications for objects that are not `.csv` files.
    pub csv_only: bool,
    pub redispatch_failed: bool,
    pub redispatch_processing: bool,
    /// Redeliver content validation failures like transient ones instead of
    /// dead-lettering them on the first attempt.
    pub validation_errors_retryable: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            database_url: None,
            db_max_connections: DB_MAX_CONNECTIONS,
            db_timeout_seconds: DB_TIMEOUT_SECS,
            storage_root: STORAGE_ROOT.to_string(),
            log_format: "text".to_string(),
            worker_count: WORKER_COUNT,
            max_delivery_attempts: MAX_DELIVERY_ATTEMPTS,
            backoff_base_ms: BACKOFF_BASE_MS,
            backoff_max_ms: BACKOFF_MAX_MS,
            ack_deadline_secs: ACK_DEADLINE_SECS,
            processing_timeout_secs: PROCESSING_TIMEOUT_SECS,
            publish_timeout_ms: PUBLISH_TIMEOUT_MS,
            queue_capacity: QUEUE_CAPACITY,
            lease_reap_interval_ms: LEASE_REAP_INTERVAL_MS,
            reconcile_interval_secs: RECONCILE_INTERVAL_SECS,
            reconcile_grace_secs: RECONCILE_GRACE_SECS,
            csv_only: true,
            redispatch_failed: true,
            redispatch_processing: false,
            validation_errors_retryable: true,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();
        Self::from_source(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup. Missing keys fall
    /// back to defaults; present but unparsable keys are an error.
    pub fn from_source<F>(lookup: F) -> Result<Self, anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            environment: lookup("CSVTRACK_ENV")
                .or_else(|| lookup("ENVIRONMENT"))
                .unwrap_or(defaults.environment),
            database_url: lookup("DATABASE_URL").filter(|s| !s.trim().is_empty()),
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            db_timeout_seconds: parse_or(&lookup, "DB_TIMEOUT_SECONDS", defaults.db_timeout_seconds)?,
            storage_root: lookup("CSVTRACK_STORAGE_ROOT").unwrap_or(defaults.storage_root),
            log_format: lookup("CSVTRACK_LOG_FORMAT")
                .map(|s| s.trim().to_lowercase())
                .unwrap_or(defaults.log_format),
            worker_count: parse_or(&lookup, "CSVTRACK_WORKER_COUNT", defaults.worker_count)?,
            max_delivery_attempts: parse_or(
                &lookup,
                "CSVTRACK_MAX_DELIVERY_ATTEMPTS",
                defaults.max_delivery_attempts,
            )?,
            backoff_base_ms: parse_or(&lookup, "CSVTRACK_BACKOFF_BASE_MS", defaults.backoff_base_ms)?,
            backoff_max_ms: parse_or(&lookup, "CSVTRACK_BACKOFF_MAX_MS", defaults.backoff_max_ms)?,
            ack_deadline_secs: parse_or(
                &lookup,
                "CSVTRACK_ACK_DEADLINE_SECS",
                defaults.ack_deadline_secs,
            )?,
            processing_timeout_secs: parse_or(
                &lookup,
                "CSVTRACK_PROCESSING_TIMEOUT_SECS",
                defaults.processing_timeout_secs,
            )?,
            publish_timeout_ms: parse_or(
                &lookup,
                "CSVTRACK_PUBLISH_TIMEOUT_MS",
                defaults.publish_timeout_ms,
            )?,
            queue_capacity: parse_or(&lookup, "CSVTRACK_QUEUE_CAPACITY", defaults.queue_capacity)?,
            lease_reap_interval_ms: parse_or(
                &lookup,
                "CSVTRACK_LEASE_REAP_INTERVAL_MS",
                defaults.lease_reap_interval_ms,
            )?,
            reconcile_interval_secs: parse_or(
                &lookup,
                "CSVTRACK_RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval_secs,
            )?,
            reconcile_grace_secs: parse_or(
                &lookup,
                "CSVTRACK_RECONCILE_GRACE_SECS",
                defaults.reconcile_grace_secs,
            )?,
            csv_only: parse_bool_or(&lookup, "CSVTRACK_CSV_ONLY", defaults.csv_only)?,
            redispatch_failed: parse_bool_or(
                &lookup,
                "CSVTRACK_REDISPATCH_FAILED",
                defaults.redispatch_failed,
            )?,
            redispatch_processing: parse_bool_or(
                &lookup,
                "CSVTRACK_REDISPATCH_PROCESSING",
                defaults.redispatch_processing,
            )?,
            validation_errors_retryable: parse_bool_or(
                &lookup,
                "CSVTRACK_VALIDATION_ERRORS_RETRYABLE",
                defaults.validation_errors_retryable,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.max_delivery_attempts == 0 {
            return Err(anyhow::anyhow!(
                "CSVTRACK_MAX_DELIVERY_ATTEMPTS must be at least 1"
            ));
        }

        if self.worker_count == 0 {
            return Err(anyhow::anyhow!("CSVTRACK_WORKER_COUNT must be at least 1"));
        }

        if self.queue_capacity == 0 {
            return Err(anyhow::anyhow!("CSVTRACK_QUEUE_CAPACITY must be at least 1"));
        }

        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(anyhow::anyhow!(
                "CSVTRACK_BACKOFF_BASE_MS ({}) must not exceed CSVTRACK_BACKOFF_MAX_MS ({})",
                self.backoff_base_ms,
                self.backoff_max_ms
            ));
        }

        if self.processing_timeout_secs >= self.ack_deadline_secs {
            return Err(anyhow::anyhow!(
                "CSVTRACK_PROCESSING_TIMEOUT_SECS ({}) must be shorter than CSVTRACK_ACK_DEADLINE_SECS ({})",
                self.processing_timeout_secs,
                self.ack_deadline_secs
            ));
        }

        if !matches!(self.log_format.as_str(), "text" | "json") {
            return Err(anyhow::anyhow!(
                "CSVTRACK_LOG_FORMAT must be 'text' or 'json', got '{}'",
                self.log_format
            ));
        }

        if let Some(url) = &self.database_url {
            if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
                return Err(anyhow::anyhow!(
                    "DATABASE_URL must be a valid PostgreSQL connection string"
                ));
            }
        }

        Ok(())
    }

    pub fn is_production(&self) -> bool {
        let env = self.environment.to_lowercase();
        env == "production" || env == "prod"
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn ack_deadline(&self) -> Duration {
        Duration::from_secs(self.ack_deadline_secs)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn lease_reap_interval(&self) -> Duration {
        Duration::from_millis(self.lease_reap_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_secs > 0).then(|| Duration::from_secs(self.reconcile_interval_secs))
    }

    pub fn reconcile_grace(&self) -> Duration {
        Duration::from_secs(self.reconcile_grace_secs)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, anyhow::Error>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid number, got '{}'", key, raw)),
        None => Ok(default),
    }
}

fn parse_bool_or<F>(lookup: &F, key: &str, default: bool) -> Result<bool, anyhow::Error>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(anyhow::anyhow!("{} must be true or false, got '{}'", key, raw)),
        },
        None => Ok(default),
    }
}
