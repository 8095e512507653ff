//! PostgreSQL persistent storage.
//!
//! # Overview
//!
//! - **Database**: connection pool and the shared [`DatabaseError`]
//! - **Migrations**: schema application, including the enqueue trigger
//! - **Tasks**: the task table and its state machine
//! - **Results**: result payloads stored on task rows
//!
//! # Usage
//!
//! ```rust,ignore
//! use pgtask::storage::{Database, TaskStore, ResultStore};
//!
//! let db = Database::connect("postgres://localhost/pgtask").await?;
//! db.run_migrations("pgtask").await?;
//!
//! let tasks = TaskStore::new(db.pool().clone());
//! if let Some(task) = tasks.claim("default", &["echo".to_string()]).await? {
//!     tasks.complete(task.message_id, Some(b"done"), None).await?;
//! }
//! ```

pub mod database;
pub mod migrations;
pub mod results;
pub mod schema;
pub mod tasks;

use std::time::Duration;

pub use database::{is_transient_sqlx, Database, DatabaseError, PoolOptions};
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};
pub use results::{ResultStore, TaskResult};
pub use tasks::{NewTask, QueueStats, Task, TaskState, TaskStore};

/// Milliseconds as a Postgres `bigint` bind value.
pub(crate) fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
