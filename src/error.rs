//! Error types for pgtask operations.
//!
//! Storage errors live next to the storage code ([`crate::storage::DatabaseError`]);
//! this module defines the errors of the layers built on top of it:
//! - Broker enqueue, subscription and result fetch
//! - Actor registry construction and actor execution
//! - Schedule management
//! - Process supervision

use std::time::Duration;

use thiserror::Error;

use crate::broker::message::MessageError;
use crate::scheduler::cron::CronError;
use crate::storage::DatabaseError;

/// Errors raised by the broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Invalid queue name '{0}': use letters, digits, '_', '-' or ':'")]
    InvalidQueueName(String),

    #[error("Invalid actor name '{0}'")]
    InvalidActorName(String),

    #[error("Channel '{channel}' is {len} bytes, PostgreSQL allows at most 63")]
    ChannelTooLong { channel: String, len: usize },

    #[error("Queue '{queue}' still has {remaining} unfinished tasks after {timeout:?}")]
    JoinTimeout {
        queue: String,
        remaining: i64,
        timeout: Duration,
    },

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<sqlx::Error> for BrokerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(DatabaseError::from(err))
    }
}

impl BrokerError {
    /// Connection-level failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(e) if e.is_transient())
    }
}

/// Errors that can occur while building the actor registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Actor '{0}' is already registered")]
    DuplicateActor(String),

    #[error("Actor '{0}' not found in registry")]
    ActorNotFound(String),

    #[error("Invalid actor spec for '{actor}': {reason}")]
    InvalidSpec { actor: String, reason: String },

    #[error("Registry has no actors")]
    Empty,
}

/// Outcome of a failed actor invocation.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Failed; the retry policy decides whether to try again.
    #[error("{0}")]
    Failed(String),

    /// Failed in a way retrying cannot fix; rejected immediately.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("exceeded time limit of {0:?}")]
    TimeLimitExceeded(Duration),

    #[error("panicked: {0}")]
    Panicked(String),

    #[error("could not decode arguments: {0}")]
    BadArguments(String),
}

impl ActorError {
    /// Whether the retry policy may requeue after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_) | Self::BadArguments(_))
    }
}

/// Errors raised by schedule management.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Schedule '{0}' not found")]
    NotFound(String),

    #[error("Invalid crontab: {0}")]
    InvalidCrontab(#[from] CronError),

    #[error("Invalid schedule: {0}")]
    Invalid(String),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<sqlx::Error> for ScheduleError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(DatabaseError::from(err))
    }
}

/// Errors raised by the process supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn worker {worker}: {source}")]
    Spawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker {worker} exited before becoming ready (exit code {code:?})")]
    NotReady { worker: usize, code: Option<i32> },

    #[error("Worker {worker} did not become ready within {timeout:?}")]
    ReadyTimeout { worker: usize, timeout: Duration },

    #[error("PID file {path} is held by running process {pid}")]
    PidFileHeld { path: String, pid: i32 },

    #[error("PID file error: {0}")]
    PidFile(String),

    #[error("Signal handler setup failed: {0}")]
    Signal(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_display() {
        let err = BrokerError::ChannelTooLong {
            channel: "x".repeat(70),
            len: 70,
        };
        assert!(err.to_string().contains("70 bytes"));

        let err = BrokerError::InvalidQueueName("a b".into());
        assert!(err.to_string().contains("'a b'"));
    }

    #[test]
    fn test_broker_error_transient() {
        let err = BrokerError::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());

        let err = BrokerError::InvalidActorName(String::new());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_actor_error_retryable() {
        assert!(ActorError::Failed("boom".into()).is_retryable());
        assert!(ActorError::TimeLimitExceeded(Duration::from_secs(1)).is_retryable());
        assert!(ActorError::Panicked("oops".into()).is_retryable());
        assert!(!ActorError::Fatal("bad input".into()).is_retryable());
        assert!(!ActorError::BadArguments("eof".into()).is_retryable());
    }

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::DuplicateActor("echo".into());
        assert_eq!(err.to_string(), "Actor 'echo' is already registered");
    }

    #[test]
    fn test_supervisor_error_display() {
        let err = SupervisorError::PidFileHeld {
            path: "/run/pgtask.pid".into(),
            pid: 42,
        };
        assert!(err.to_string().contains("42"));
    }
}
