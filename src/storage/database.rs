//! PostgreSQL connection pool and shared database error type.

use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, PgPool};
use thiserror::Error;
use tracing::info;

use super::migrations::MigrationRunner;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// The task is currently claimed by a worker and cannot be re-queued.
    #[error("Task {0} is in flight")]
    InFlight(uuid::Uuid),

    /// A stored value could not be interpreted.
    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),
}

impl DatabaseError {
    /// Whether the error comes from the connection rather than the query.
    ///
    /// Transient errors are retried by callers and never recorded as task
    /// failures.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionFailed(_) => true,
            Self::QueryFailed(e) => is_transient_sqlx(e),
            _ => false,
        }
    }
}

/// Classifies a raw sqlx error as a connection-level failure.
pub fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Tls(_) => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| {
                // 08: connection exception, 57P01..03: admin/crash shutdown,
                // 40001/40P01: serialization failure and deadlock
                code.starts_with("08")
                    || matches!(code.as_ref(), "57P01" | "57P02" | "57P03" | "40001" | "40P01")
            })
            .unwrap_or(false),
        _ => false,
    }
}

/// Pool sizing for [`Database::connect`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// PostgreSQL database client.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connects to the database with default pool options.
    pub async fn connect(database_url: &str) -> Result<Self, DatabaseError> {
        Self::connect_with(database_url, &PoolOptions::default()).await
    }

    /// Connects to the database with explicit pool sizing.
    pub async fn connect_with(
        database_url: &str,
        options: &PoolOptions,
    ) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .min_connections(options.min_connections)
            .acquire_timeout(options.acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        info!(
            max_connections = options.max_connections,
            "Connected to database"
        );

        Ok(Self { pool })
    }

    /// Creates a new database client from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs database migrations for the given channel prefix.
    pub async fn run_migrations(&self, channel_prefix: &str) -> Result<usize, DatabaseError> {
        let runner = MigrationRunner::new(self.pool.clone(), channel_prefix);
        Ok(runner.run_migrations().await?)
    }

    /// Closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_error_display() {
        let err = DatabaseError::ConnectionFailed("refused".to_string());
        assert_eq!(err.to_string(), "Connection failed: refused");

        let err = DatabaseError::NotFound("task 42".to_string());
        assert!(err.to_string().contains("task 42"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(DatabaseError::ConnectionFailed("x".into()).is_transient());
        assert!(DatabaseError::QueryFailed(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!DatabaseError::QueryFailed(sqlx::Error::RowNotFound).is_transient());
        assert!(!DatabaseError::NotFound("x".into()).is_transient());
        assert!(!DatabaseError::InFlight(uuid::Uuid::nil()).is_transient());
        assert!(!DatabaseError::QueryFailed(sqlx::Error::PoolClosed).is_transient());
    }

    #[test]
    fn test_io_error_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(is_transient_sqlx(&sqlx::Error::Io(io)));
    }

    #[test]
    fn test_pool_options_default() {
        let options = PoolOptions::default();
        assert_eq!(options.max_connections, 10);
        assert_eq!(options.min_connections, 1);
        assert_eq!(options.acquire_timeout, Duration::from_secs(30));
    }
}
