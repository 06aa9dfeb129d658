//! Engine configuration.
//!
//! This module provides connection settings and the tuning knobs for the
//! worker loop, retry pipeline, reaper, and retention windows, plus the
//! fixed loop constants shared by every engine instance.

use std::time::Duration;

use thiserror::Error;

/// Interval between worker heartbeat refreshes.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Age after which a worker registry entry is considered stale and evicted.
pub const PRUNE_TIMEOUT: u64 = 300;

/// Interval between reaper runs inside the worker loop.
pub const PRUNE_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Retention window for terminal task records scanned by the reaper.
pub const TASK_RESULT_RETENTION: u64 = 86_400;

/// Default wait budget for result and stream consumers.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(300);

/// Blocking-pop wait on the main queue per loop iteration.
pub const QUEUE_POP_TIMEOUT: Duration = Duration::from_secs(1);

/// Minimum interval between delayed-task promotion ticks.
pub const PROMOTE_INTERVAL: Duration = Duration::from_secs(1);

/// Poll interval of the result getter.
pub const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-batch blocking wait of the stream reader, in milliseconds.
pub const STREAM_BLOCK_MS: u64 = 1_000;

/// Maximum entries fetched per stream read batch.
pub const STREAM_READ_COUNT: usize = 10;

/// TTL applied to a task's stream key once the task completes.
pub const STREAM_TTL_AFTER_COMPLETE: u64 = 3_600;

/// TTL of the terminal-state (`task_result`) record.
pub const RESULT_TTL: u64 = 3_600;

/// Pause after pushing back a task whose name no local handler serves.
pub const UNKNOWN_TASK_BACKOFF: Duration = Duration::from_millis(100);

/// Errors that can occur while building a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Configuration for a queue engine instance.
///
/// Connection fields address the Redis backing store; the remaining fields
/// tune retry delays, stuck-task detection, and retention windows.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis host.
    pub host: String,
    /// Redis port.
    pub port: u16,
    /// Redis logical database index.
    pub db: i64,
    /// Optional Redis password.
    pub password: Option<String>,
    /// Stable worker identity; defaults to the host name when unset.
    pub worker_id: Option<String>,
    /// Optional error sink POSTed on task failures.
    pub webhook_url: Option<String>,
    /// Seconds before a `processing` task is considered stuck.
    pub requeue_threshold: u64,
    /// Default delay when scheduling retries, in seconds.
    pub delay_seconds: u64,
    /// Retention window for history records, in seconds.
    pub task_history_retention: u64,
    /// TTL of live task records, in seconds.
    pub task_ttl: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            password: None,
            worker_id: None,
            webhook_url: None,
            requeue_threshold: 180,
            delay_seconds: 30,
            task_history_retention: 86_400,
            task_ttl: 86_400,
        }
    }
}

impl QueueConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from `TASKFORGE_*` environment variables,
    /// falling back to defaults for anything unset.
    ///
    /// Recognized variables: `TASKFORGE_REDIS_HOST`, `TASKFORGE_REDIS_PORT`,
    /// `TASKFORGE_REDIS_DB`, `TASKFORGE_REDIS_PASSWORD`,
    /// `TASKFORGE_WORKER_ID`, `TASKFORGE_WEBHOOK_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("TASKFORGE_REDIS_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("TASKFORGE_REDIS_PORT") {
            config.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: "TASKFORGE_REDIS_PORT".to_string(),
                message: format!("'{port}' is not a valid port"),
            })?;
        }
        if let Ok(db) = std::env::var("TASKFORGE_REDIS_DB") {
            config.db = db.parse().map_err(|_| ConfigError::InvalidValue {
                key: "TASKFORGE_REDIS_DB".to_string(),
                message: format!("'{db}' is not a valid database index"),
            })?;
        }
        if let Ok(password) = std::env::var("TASKFORGE_REDIS_PASSWORD") {
            config.password = Some(password);
        }
        if let Ok(worker_id) = std::env::var("TASKFORGE_WORKER_ID") {
            config.worker_id = Some(worker_id);
        }
        if let Ok(url) = std::env::var("TASKFORGE_WEBHOOK_URL") {
            config.webhook_url = Some(url);
        }

        Ok(config)
    }

    /// Sets the Redis host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the Redis port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the Redis logical database.
    pub fn with_db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    /// Sets the Redis password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the worker identity.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Sets the failure webhook URL.
    pub fn with_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    /// Sets the stuck-task threshold in seconds.
    pub fn with_requeue_threshold(mut self, seconds: u64) -> Self {
        self.requeue_threshold = seconds;
        self
    }

    /// Sets the retry delay in seconds.
    pub fn with_delay_seconds(mut self, seconds: u64) -> Self {
        self.delay_seconds = seconds;
        self
    }

    /// Sets the history retention window in seconds.
    pub fn with_task_history_retention(mut self, seconds: u64) -> Self {
        self.task_history_retention = seconds;
        self
    }

    /// Sets the live task record TTL in seconds.
    pub fn with_task_ttl(mut self, seconds: u64) -> Self {
        self.task_ttl = seconds;
        self
    }

    /// Renders the Redis connection URL for this configuration.
    pub fn redis_url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = QueueConfig::default();

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 6379);
        assert_eq!(config.db, 0);
        assert!(config.password.is_none());
        assert!(config.worker_id.is_none());
        assert!(config.webhook_url.is_none());
        assert_eq!(config.requeue_threshold, 180);
        assert_eq!(config.delay_seconds, 30);
        assert_eq!(config.task_history_retention, 86_400);
        assert_eq!(config.task_ttl, 86_400);
    }

    #[test]
    fn test_config_builder() {
        let config = QueueConfig::new()
            .with_host("redis.internal")
            .with_port(6380)
            .with_db(2)
            .with_password("secret")
            .with_worker_id("inference-7")
            .with_webhook_url("https://ops.example/hook")
            .with_requeue_threshold(60)
            .with_delay_seconds(5)
            .with_task_history_retention(3_600)
            .with_task_ttl(7_200);

        assert_eq!(config.host, "redis.internal");
        assert_eq!(config.port, 6380);
        assert_eq!(config.db, 2);
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.worker_id.as_deref(), Some("inference-7"));
        assert_eq!(config.webhook_url.as_deref(), Some("https://ops.example/hook"));
        assert_eq!(config.requeue_threshold, 60);
        assert_eq!(config.delay_seconds, 5);
        assert_eq!(config.task_history_retention, 3_600);
        assert_eq!(config.task_ttl, 7_200);
    }

    #[test]
    fn test_redis_url_rendering() {
        let plain = QueueConfig::default();
        assert_eq!(plain.redis_url(), "redis://127.0.0.1:6379/0");

        let secured = QueueConfig::default().with_password("hunter2").with_db(3);
        assert_eq!(secured.redis_url(), "redis://:hunter2@127.0.0.1:6379/3");
    }
}
