//! Process configuration read from the environment.

use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Artifact store backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactBackend {
    Fs,
    Db,
    S3,
}

impl ArtifactBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fs" => Some(Self::Fs),
            "db" => Some(Self::Db),
            "s3" => Some(Self::S3),
            _ => None,
        }
    }
}

/// Engine configuration.
///
/// Every key has a default except the database URL. Durations are given in
/// seconds in the environment.
#[derive(Debug, Clone)]
pub struct IngesterConfig {
    /// Persistence target (required)
    pub database_url: String,

    /// Artifact store backend
    pub artifact_backend: ArtifactBackend,

    /// Root directory for the fs backend
    pub artifact_root: String,

    /// Storage-root label selecting where artifacts land within a backend
    pub storage_root: String,

    /// Vector store root handed to `store` steps
    pub vector_store_root: String,

    /// Directory of built-in workflow definitions
    pub workflow_dir: String,

    /// Directory of built-in parameter sets
    pub param_dir: String,

    /// Workflow used when the caller names none
    pub default_workflow: String,

    /// Parameter set used when the caller names none
    pub default_params: String,

    /// Task pool size per worker process
    pub worker_concurrency: usize,

    /// Steps claimed per poll
    pub claim_batch_size: usize,

    /// Worker check-in interval
    pub heartbeat_interval: Duration,

    /// Check-in age beyond which a worker counts as stale
    pub stale_worker_timeout: Duration,

    /// Backoff policy for transient step failures
    pub retry: RetryPolicy,

    /// Sleep between empty polls
    pub poll_interval: Duration,

    /// Grace period for in-flight steps at shutdown
    pub drain_deadline: Duration,
}

impl IngesterConfig {
    /// Load configuration from the environment, applying defaults.
    ///
    /// Reads `.env` if present (development convenience; missing file is
    /// fine).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let artifact_backend = match optional("ARTIFACT_BACKEND") {
            None => ArtifactBackend::Fs,
            Some(v) => ArtifactBackend::parse(&v)
                .ok_or_else(|| ConfigError::invalid("ARTIFACT_BACKEND", &v, "expected fs|db|s3"))?,
        };

        Ok(Self {
            database_url,
            artifact_backend,
            artifact_root: optional("ARTIFACT_ROOT").unwrap_or_else(|| "file_store".into()),
            storage_root: optional("STORAGE_ROOT").unwrap_or_else(|| "default".into()),
            vector_store_root: optional("VECTOR_STORE_ROOT").unwrap_or_else(|| "lancedb".into()),
            workflow_dir: optional("WORKFLOW_DIR").unwrap_or_else(|| "config/workflows".into()),
            param_dir: optional("PARAM_DIR").unwrap_or_else(|| "config/params".into()),
            default_workflow: optional("DEFAULT_WORKFLOW").unwrap_or_else(|| "batch_split".into()),
            default_params: optional("DEFAULT_PARAMS").unwrap_or_else(|| "default".into()),
            worker_concurrency: parsed("INGEST_WORKER_CONCURRENCY", 10)?,
            claim_batch_size: parsed("WORKER_TASK_COUNT", 5)?,
            heartbeat_interval: seconds("WORKER_CHECKIN_INTERVAL", 120)?,
            stale_worker_timeout: seconds("WORKER_CHECKIN_TIMEOUT", 600)?,
            retry: RetryPolicy::new(
                seconds("RETRY_BASE_SECONDS", 5)?,
                seconds("RETRY_CAP_SECONDS", 600)?,
            ),
            poll_interval: seconds("POLL_INTERVAL_SECONDS", 1)?,
            drain_deadline: seconds("DRAIN_DEADLINE_SECONDS", 30)?,
        })
    }

    /// Defaults with an explicit database URL; used by tests and embedders.
    pub fn with_database_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            artifact_backend: ArtifactBackend::Fs,
            artifact_root: "file_store".into(),
            storage_root: "default".into(),
            vector_store_root: "lancedb".into(),
            workflow_dir: "config/workflows".into(),
            param_dir: "config/params".into(),
            default_workflow: "batch_split".into(),
            default_params: "default".into(),
            worker_concurrency: 10,
            claim_batch_size: 5,
            heartbeat_interval: Duration::from_secs(120),
            stale_worker_timeout: Duration::from_secs(600),
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(1),
            drain_deadline: Duration::from_secs(30),
        }
    }
}

fn optional(key: &'static str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match optional(key) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, &v, e.to_string())),
    }
}

fn seconds(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parsed(key, default)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IngesterConfig::with_database_url("postgres://localhost/soliplex");
        assert_eq!(config.artifact_backend, ArtifactBackend::Fs);
        assert_eq!(config.artifact_root, "file_store");
        assert_eq!(config.default_workflow, "batch_split");
        assert_eq!(config.worker_concurrency, 10);
        assert_eq!(config.claim_batch_size, 5);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(120));
        assert_eq!(config.stale_worker_timeout, Duration::from_secs(600));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.drain_deadline, Duration::from_secs(30));
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!(ArtifactBackend::parse("fs"), Some(ArtifactBackend::Fs));
        assert_eq!(ArtifactBackend::parse("s3"), Some(ArtifactBackend::S3));
        assert_eq!(ArtifactBackend::parse("minio"), None);
    }
}
