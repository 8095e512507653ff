//! Runtime settings for brokers, workers and the scheduler.
//!
//! Settings come from environment variables with defaults suited to a small
//! deployment; CLI flags may override the worker sizing afterwards.

use std::time::Duration;

use regex::Regex;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Settings shared by every component.
#[derive(Debug, Clone)]
pub struct Settings {
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Maximum pooled connections per process.
    pub db_max_connections: u32,
    /// Prefix of notification channels and advisory lock names.
    pub channel_prefix: String,

    // Worker sizing
    /// Worker OS processes started by the supervisor.
    pub processes: usize,
    /// Worker tasks per process.
    pub threads: usize,
    /// Queues consumed by workers; empty means every registered queue.
    pub queues: Vec<String>,

    // Timing
    /// Longest a worker waits for a notification before re-sweeping.
    pub consumer_listen_timeout: Duration,
    /// Default handler time limit when the actor declares none.
    pub task_default_time_limit: Duration,
    /// Default retry budget when the actor declares none.
    pub task_max_retries: u32,
    /// How often housekeeping purges finished tasks.
    pub task_purge_interval: Duration,
    /// Age after which finished tasks are purged and unclaimed tasks expire.
    pub task_expiration: Duration,
    /// How often the scheduler attempts a tick.
    pub scheduler_interval: Duration,
    /// Grace period for in-flight tasks on shutdown.
    pub shutdown_timeout: Duration,

    /// Directory for Prometheus textfile exports, if any.
    pub metrics_dir: Option<std::path::PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/pgtask".to_string(),
            db_max_connections: 10,
            channel_prefix: "pgtask".to_string(),

            processes: 2,
            threads: 1,
            queues: Vec::new(),

            consumer_listen_timeout: Duration::from_secs(30),
            task_default_time_limit: Duration::from_secs(600), // 10 minutes
            task_max_retries: 5,
            task_purge_interval: Duration::from_secs(86_400), // 1 day
            task_expiration: Duration::from_secs(30 * 86_400), // 30 days
            scheduler_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(60),

            metrics_dir: None,
        }
    }
}

impl Settings {
    /// Creates settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates settings from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: PostgreSQL connection URL (required)
    /// - `PGTASK_DB_MAX_CONNECTIONS`: pool size per process (default: 10)
    /// - `PGTASK_CHANNEL_PREFIX`: channel/lock prefix (default: pgtask)
    /// - `PGTASK_WORKER_PROCESSES`: worker processes (default: 2)
    /// - `PGTASK_WORKER_THREADS`: worker tasks per process (default: 1)
    /// - `PGTASK_QUEUES`: comma-separated queues to consume
    /// - `PGTASK_CONSUMER_LISTEN_TIMEOUT`: (default: 30s)
    /// - `PGTASK_TASK_DEFAULT_TIME_LIMIT`: (default: 10 minutes)
    /// - `PGTASK_TASK_MAX_RETRIES`: (default: 5)
    /// - `PGTASK_TASK_PURGE_INTERVAL`: (default: 1 day)
    /// - `PGTASK_TASK_EXPIRATION`: (default: 30 days)
    /// - `PGTASK_SCHEDULER_INTERVAL`: (default: 60s)
    /// - `PGTASK_SHUTDOWN_TIMEOUT`: (default: 60s)
    /// - `PGTASK_METRICS_DIR`: textfile collector directory (default: unset)
    ///
    /// Durations accept plain seconds or `days=1;hours=2;minutes=3;seconds=4`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        if let Ok(val) = std::env::var("PGTASK_DB_MAX_CONNECTIONS") {
            config.db_max_connections = parse_env_value(&val, "PGTASK_DB_MAX_CONNECTIONS")?;
        }

        if let Ok(val) = std::env::var("PGTASK_CHANNEL_PREFIX") {
            config.channel_prefix = val;
        }

        if let Ok(val) = std::env::var("PGTASK_WORKER_PROCESSES") {
            config.processes = parse_env_value(&val, "PGTASK_WORKER_PROCESSES")?;
        }

        if let Ok(val) = std::env::var("PGTASK_WORKER_THREADS") {
            config.threads = parse_env_value(&val, "PGTASK_WORKER_THREADS")?;
        }

        if let Ok(val) = std::env::var("PGTASK_QUEUES") {
            config.queues = parse_list(&val);
        }

        let durations: [(&str, &mut Duration); 6] = [
            (
                "PGTASK_CONSUMER_LISTEN_TIMEOUT",
                &mut config.consumer_listen_timeout,
            ),
            (
                "PGTASK_TASK_DEFAULT_TIME_LIMIT",
                &mut config.task_default_time_limit,
            ),
            ("PGTASK_TASK_PURGE_INTERVAL", &mut config.task_purge_interval),
            ("PGTASK_TASK_EXPIRATION", &mut config.task_expiration),
            ("PGTASK_SCHEDULER_INTERVAL", &mut config.scheduler_interval),
            ("PGTASK_SHUTDOWN_TIMEOUT", &mut config.shutdown_timeout),
        ];
        for (key, slot) in durations {
            if let Ok(val) = std::env::var(key) {
                *slot = parse_duration(&val, key)?;
            }
        }

        if let Ok(val) = std::env::var("PGTASK_TASK_MAX_RETRIES") {
            config.task_max_retries = parse_env_value(&val, "PGTASK_TASK_MAX_RETRIES")?;
        }

        if let Ok(val) = std::env::var("PGTASK_METRICS_DIR") {
            if !val.is_empty() {
                config.metrics_dir = Some(val.into());
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.db_max_connections < 2 {
            // One connection is pinned by the notification listener.
            return Err(ConfigError::ValidationFailed(
                "db_max_connections must be at least 2".to_string(),
            ));
        }

        let prefix_re = Regex::new(r"^[a-z][a-z0-9_]{0,31}$").expect("Invalid prefix regex");
        if !prefix_re.is_match(&self.channel_prefix) {
            return Err(ConfigError::ValidationFailed(format!(
                "channel_prefix '{}' must be lowercase alphanumeric/underscore, at most 32 chars",
                self.channel_prefix
            )));
        }

        if self.processes == 0 {
            return Err(ConfigError::ValidationFailed(
                "processes must be greater than 0".to_string(),
            ));
        }

        if self.threads == 0 {
            return Err(ConfigError::ValidationFailed(
                "threads must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("consumer_listen_timeout", self.consumer_listen_timeout),
            ("task_default_time_limit", self.task_default_time_limit),
            ("task_purge_interval", self.task_purge_interval),
            ("task_expiration", self.task_expiration),
            ("scheduler_interval", self.scheduler_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Builder method to set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set the channel prefix.
    pub fn with_channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.channel_prefix = prefix.into();
        self
    }

    /// Builder method to set the number of worker processes.
    pub fn with_processes(mut self, processes: usize) -> Self {
        self.processes = processes;
        self
    }

    /// Builder method to set worker tasks per process.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Builder method to restrict consumed queues.
    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    /// Builder method to set the listen timeout.
    pub fn with_consumer_listen_timeout(mut self, timeout: Duration) -> Self {
        self.consumer_listen_timeout = timeout;
        self
    }

    /// Builder method to set the scheduler interval.
    pub fn with_scheduler_interval(mut self, interval: Duration) -> Self {
        self.scheduler_interval = interval;
        self
    }

    /// Builder method to set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Parses an environment variable value into the specified type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parses `"90"` or `"days=1;hours=2;minutes=3;seconds=4"` into a duration.
pub fn parse_duration(value: &str, key: &str) -> Result<Duration, ConfigError> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Ok(Duration::from_secs_f64(secs));
        }
    }

    let invalid = |message: String| ConfigError::InvalidValue {
        key: key.to_string(),
        message,
    };

    let mut total = 0f64;
    for part in value.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (unit, amount) = part
            .split_once('=')
            .ok_or_else(|| invalid(format!("expected unit=value, got '{}'", part)))?;
        let amount: f64 = amount
            .trim()
            .parse()
            .map_err(|_| invalid(format!("'{}' is not a number", amount.trim())))?;
        if !amount.is_finite() || amount < 0.0 {
            return Err(invalid(format!("'{}' must be a non-negative number", part)));
        }
        let factor = match unit.trim() {
            "weeks" => 604_800.0,
            "days" => 86_400.0,
            "hours" => 3_600.0,
            "minutes" => 60.0,
            "seconds" => 1.0,
            "milliseconds" => 0.001,
            other => return Err(invalid(format!("unknown unit '{}'", other))),
        };
        total += amount * factor;
    }

    if value.is_empty() {
        return Err(invalid("empty duration".to_string()));
    }
    Ok(Duration::from_secs_f64(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let config = Settings::default();
        assert_eq!(config.processes, 2);
        assert_eq!(config.threads, 1);
        assert_eq!(config.consumer_listen_timeout, Duration::from_secs(30));
        assert_eq!(config.task_max_retries, 5);
        assert_eq!(config.task_default_time_limit, Duration::from_secs(600));
        assert_eq!(config.task_expiration, Duration::from_secs(2_592_000));
        assert_eq!(config.channel_prefix, "pgtask");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = Settings::new()
            .with_database_url("postgres://db/app")
            .with_channel_prefix("app")
            .with_processes(4)
            .with_threads(8)
            .with_queues(vec!["mail".into()])
            .with_scheduler_interval(Duration::from_secs(5));

        assert_eq!(config.database_url, "postgres://db/app");
        assert_eq!(config.channel_prefix, "app");
        assert_eq!(config.processes, 4);
        assert_eq!(config.threads, 8);
        assert_eq!(config.queues, vec!["mail".to_string()]);
        assert_eq!(config.scheduler_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_validation_rejects_zero_processes() {
        let config = Settings::new().with_processes(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(msg)) if msg.contains("processes")
        ));
    }

    #[test]
    fn test_validation_rejects_bad_prefix() {
        for prefix in ["", "Has-Dash", "1abc", "with.dot"] {
            let config = Settings::new().with_channel_prefix(prefix);
            assert!(config.validate().is_err(), "prefix {:?} accepted", prefix);
        }
    }

    #[test]
    fn test_parse_duration_seconds() {
        assert_eq!(
            parse_duration("90", "K").expect("seconds"),
            Duration::from_secs(90)
        );
        assert_eq!(
            parse_duration("0.5", "K").expect("fraction"),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(
            parse_duration("minutes=10", "K").expect("minutes"),
            Duration::from_secs(600)
        );
        assert_eq!(
            parse_duration("days=1;hours=2;seconds=3", "K").expect("mixed"),
            Duration::from_secs(86_400 + 7_200 + 3)
        );
    }

    #[test]
    fn test_parse_duration_errors() {
        assert!(parse_duration("", "K").is_err());
        assert!(parse_duration("fortnights=1", "K").is_err());
        assert!(parse_duration("minutes", "K").is_err());
        assert!(parse_duration("minutes=-1", "K").is_err());
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(
            parse_list(" default, mail ,,"),
            vec!["default".to_string(), "mail".to_string()]
        );
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingEnvVar("DATABASE_URL".to_string());
        assert!(err.to_string().contains("DATABASE_URL"));

        let err = ConfigError::InvalidValue {
            key: "PGTASK_WORKER_THREADS".to_string(),
            message: "invalid digit".to_string(),
        };
        assert!(err.to_string().contains("PGTASK_WORKER_THREADS"));
    }
}
