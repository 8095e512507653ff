//! Durable task rows and their state machine.
//!
//! ```text
//! queued ──claim──▶ consumed ──complete──▶ done
//!   ▲                  │
//!   └──reject(requeue)─┴──reject──▶ rejected
//! ```
//!
//! Every write that leaves a row `queued` fires the deferred enqueue
//! notification trigger, so listeners only hear about committed work.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::database::DatabaseError;
use super::millis;

const TASK_COLUMNS: &str = "message_id, seq, queue_name, actor_name, message, state, mtime, \
                            eta, retries, result_expiry";

/// Lifecycle state of a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Consumed,
    Done,
    Rejected,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Consumed => "consumed",
            Self::Done => "done",
            Self::Rejected => "rejected",
        }
    }

    /// Done and rejected rows never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Rejected)
    }

    pub fn all() -> [TaskState; 4] {
        [Self::Queued, Self::Consumed, Self::Done, Self::Rejected]
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "consumed" => Ok(Self::Consumed),
            "done" => Ok(Self::Done),
            "rejected" => Ok(Self::Rejected),
            other => Err(DatabaseError::CorruptRow(format!(
                "unknown task state '{}'",
                other
            ))),
        }
    }
}

/// A task row, without its result payload.
#[derive(Debug, Clone)]
pub struct Task {
    pub message_id: Uuid,
    pub seq: i64,
    pub queue_name: String,
    pub actor_name: String,
    /// Encoded message envelope; `None` once the message was discarded.
    pub message: Option<Vec<u8>>,
    pub state: TaskState,
    pub mtime: DateTime<Utc>,
    pub eta: Option<DateTime<Utc>>,
    pub retries: i32,
    pub result_expiry: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    message_id: Uuid,
    seq: i64,
    queue_name: String,
    actor_name: String,
    message: Option<Vec<u8>>,
    state: String,
    mtime: DateTime<Utc>,
    eta: Option<DateTime<Utc>>,
    retries: i32,
    result_expiry: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for Task {
    type Error = DatabaseError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Self {
            message_id: row.message_id,
            seq: row.seq,
            queue_name: row.queue_name,
            actor_name: row.actor_name,
            message: row.message,
            state: row.state.parse()?,
            mtime: row.mtime,
            eta: row.eta,
            retries: row.retries,
            result_expiry: row.result_expiry,
        })
    }
}

/// Input for [`TaskStore::create`].
#[derive(Debug, Clone)]
pub struct NewTask {
    pub message_id: Uuid,
    pub queue_name: String,
    pub actor_name: String,
    pub message: Vec<u8>,
    /// Earliest claim time; `None` means immediately.
    pub eta: Option<DateTime<Utc>>,
}

/// Row counts per state for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: i64,
    pub consumed: i64,
    pub done: i64,
    pub rejected: i64,
}

impl QueueStats {
    /// Rows that are not yet finished.
    pub fn unfinished(&self) -> i64 {
        self.queued + self.consumed
    }
}

/// Access to the `tasks` table.
#[derive(Clone)]
pub struct TaskStore {
    pool: PgPool,
}

impl TaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Inserts or re-queues a task on the caller's connection.
    ///
    /// A row that is currently consumed is left alone and
    /// [`DatabaseError::InFlight`] is returned. Run inside a transaction to tie the enqueue to other writes; the
    /// notification is only sent if that transaction commits.
    pub async fn create_in(
        conn: &mut PgConnection,
        task: &NewTask,
    ) -> Result<Uuid, DatabaseError> {
        let (message_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO tasks (message_id, queue_name, actor_name, message, state, mtime, eta)
            VALUES ($1, $2, $3, $4, 'queued', NOW(), $5)
            ON CONFLICT (message_id) DO UPDATE SET
                queue_name = EXCLUDED.queue_name,
                actor_name = EXCLUDED.actor_name,
                message = EXCLUDED.message,
                state = 'queued',
                mtime = NOW(),
                eta = EXCLUDED.eta
            WHERE tasks.state <> 'consumed'
            RETURNING message_id
            "#,
        )
        .bind(task.message_id)
        .bind(&task.queue_name)
        .bind(&task.actor_name)
        .bind(&task.message)
        .bind(task.eta)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(DatabaseError::InFlight(task.message_id))?;

        Ok(message_id)
    }

    /// Pool-level [`TaskStore::create_in`] in its own transaction.
    pub async fn create(&self, task: &NewTask) -> Result<Uuid, DatabaseError> {
        let mut tx = self.pool.begin().await?;
        let id = Self::create_in(&mut *tx, task).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Claims the oldest eligible queued task of `queue_name`.
    ///
    /// Only rows whose actor is in `actors` are considered. Concurrent
    /// claimers skip each other's locked rows, so a row is handed out once.
    pub async fn claim(
        &self,
        queue_name: &str,
        actors: &[String],
    ) -> Result<Option<Task>, DatabaseError> {
        let sql = format!(
            r#"
            WITH next_task AS (
                SELECT message_id
                FROM tasks
                WHERE state = 'queued'
                  AND queue_name = $1
                  AND actor_name = ANY($2)
                  AND (eta IS NULL OR eta <= NOW())
                ORDER BY seq ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE tasks
            SET state = 'consumed', mtime = NOW()
            WHERE message_id IN (SELECT message_id FROM next_task)
              AND state = 'queued'
            RETURNING {}
            "#,
            TASK_COLUMNS
        );

        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(queue_name)
            .bind(actors)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Task::try_from).transpose()
    }

    /// Marks a consumed task done, optionally storing its result.
    pub async fn complete(
        &self,
        message_id: Uuid,
        result: Option<&[u8]>,
        result_ttl: Option<Duration>,
    ) -> Result<(), DatabaseError> {
        let ttl_ms = result_ttl.map(millis);
        let updated = sqlx::query(
            r#"
            UPDATE tasks
            SET state = 'done',
                mtime = NOW(),
                eta = NULL,
                result = $2,
                result_expiry = CASE
                    WHEN $2::bytea IS NULL THEN NULL
                    WHEN $3::bigint IS NULL THEN NULL
                    ELSE NOW() + ($3::bigint * INTERVAL '1 millisecond')
                END
            WHERE message_id = $1 AND state = 'consumed'
            "#,
        )
        .bind(message_id)
        .bind(result)
        .bind(ttl_ms)
        .execute(&self.pool)
        .await?
        .rows_affected();

        self.expect_transition(message_id, updated, TaskState::Done)
            .await
    }

    /// Rejects a consumed task, or puts it back in the queue when `requeue`.
    ///
    /// A requeue counts as a retry and may delay the next claim with `eta`.
    pub async fn reject(
        &self,
        message_id: Uuid,
        requeue: bool,
        eta: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let updated = if requeue {
            sqlx::query(
                r#"
                UPDATE tasks
                SET state = 'queued', mtime = NOW(), eta = $2, retries = retries + 1
                WHERE message_id = $1 AND state = 'consumed'
                "#,
            )
            .bind(message_id)
            .bind(eta)
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                r#"
                UPDATE tasks
                SET state = 'rejected', mtime = NOW(), eta = NULL
                WHERE message_id = $1 AND state = 'consumed'
                "#,
            )
            .bind(message_id)
            .execute(&self.pool)
            .await?
            .rows_affected()
        };

        let target = if requeue {
            TaskState::Queued
        } else {
            TaskState::Rejected
        };
        self.expect_transition(message_id, updated, target).await
    }

    /// Returns a consumed task to the queue without counting a retry.
    pub async fn release(&self, message_id: Uuid) -> Result<(), DatabaseError> {
        let updated = sqlx::query(
            "UPDATE tasks SET state = 'queued', mtime = NOW() \
             WHERE message_id = $1 AND state = 'consumed'",
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        self.expect_transition(message_id, updated, TaskState::Queued)
            .await
    }

    async fn expect_transition(
        &self,
        message_id: Uuid,
        updated: u64,
        target: TaskState,
    ) -> Result<(), DatabaseError> {
        if updated == 1 {
            debug!(message_id = %message_id, state = %target, "Task transitioned");
            return Ok(());
        }
        match self.get(message_id).await? {
            None => Err(DatabaseError::NotFound(format!("task {}", message_id))),
            Some(task) => {
                // Someone else (operator sweep, purge) moved it first.
                warn!(
                    message_id = %message_id,
                    current = %task.state,
                    target = %target,
                    "Task was not in consumed state; transition skipped"
                );
                Ok(())
            }
        }
    }

    /// Deletes terminal rows last touched before `older_than` ago whose
    /// result has expired or was never stored.
    ///
    /// Non-terminal states in `states` are ignored.
    pub async fn purge(
        &self,
        older_than: Duration,
        states: &[TaskState],
    ) -> Result<u64, DatabaseError> {
        let states: Vec<String> = states
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| s.as_str().to_string())
            .collect();
        if states.is_empty() {
            return Ok(0);
        }

        let deleted = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE state = ANY($1)
              AND mtime <= NOW() - ($2::bigint * INTERVAL '1 millisecond')
              AND (result_expiry IS NULL OR result_expiry <= NOW())
            "#,
        )
        .bind(&states)
        .bind(millis(older_than))
        .execute(&self.pool)
        .await?
        .rows_affected();

        info!(count = deleted, "Purged tasks in all queues");
        Ok(deleted)
    }

    /// Fetches a task row by id.
    pub async fn get(&self, message_id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let sql = format!("SELECT {} FROM tasks WHERE message_id = $1", TASK_COLUMNS);
        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }

    /// Counts rows per state in a queue.
    pub async fn queue_stats(&self, queue_name: &str) -> Result<QueueStats, DatabaseError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT state, COUNT(*) FROM tasks WHERE queue_name = $1 GROUP BY state",
        )
        .bind(queue_name)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            match state.parse::<TaskState>()? {
                TaskState::Queued => stats.queued = count,
                TaskState::Consumed => stats.consumed = count,
                TaskState::Done => stats.done = count,
                TaskState::Rejected => stats.rejected = count,
            }
        }
        Ok(stats)
    }

    /// Moves consumed rows untouched for `older_than` back to queued.
    ///
    /// Operator tool for rows left behind by killed workers. It cannot tell a
    /// dead worker from a slow one, so it is never run automatically.
    pub async fn requeue_stale(&self, older_than: Duration) -> Result<u64, DatabaseError> {
        let requeued = sqlx::query(
            r#"
            UPDATE tasks
            SET state = 'queued', mtime = NOW()
            WHERE state = 'consumed'
              AND mtime <= NOW() - ($1::bigint * INTERVAL '1 millisecond')
            "#,
        )
        .bind(millis(older_than))
        .execute(&self.pool)
        .await?
        .rows_affected();

        info!(count = requeued, "Requeued stale consumed tasks");
        Ok(requeued)
    }

    /// Rejects queued rows nobody claimed for `older_than`.
    ///
    /// Catches tasks whose actor no running worker registers, which would
    /// otherwise stay queued forever and never become purgeable.
    pub async fn expire_orphans(&self, older_than: Duration) -> Result<u64, DatabaseError> {
        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            UPDATE tasks
            SET state = 'rejected', mtime = NOW(), eta = NULL
            WHERE state = 'queued'
              AND mtime <= NOW() - ($1::bigint * INTERVAL '1 millisecond')
              AND (eta IS NULL OR eta <= NOW())
            RETURNING message_id, actor_name
            "#,
        )
        .bind(millis(older_than))
        .fetch_all(&self.pool)
        .await?;

        for (message_id, actor_name) in &rows {
            warn!(
                message_id = %message_id,
                actor = %actor_name,
                "Expired task that was never claimed"
            );
        }
        Ok(rows.len() as u64)
    }

    /// Deletes every row of a queue regardless of state.
    pub async fn flush(&self, queue_name: &str) -> Result<u64, DatabaseError> {
        let deleted = sqlx::query("DELETE FROM tasks WHERE queue_name = $1")
            .bind(queue_name)
            .execute(&self.pool)
            .await?
            .rows_affected();

        info!(queue = %queue_name, count = deleted, "Flushed queue");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_round_trip_names() {
        for state in TaskState::all() {
            let parsed: TaskState = state.as_str().parse().expect("known state");
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn test_unknown_state_is_corrupt_row() {
        let err = "running".parse::<TaskState>().unwrap_err();
        assert!(matches!(err, DatabaseError::CorruptRow(_)));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Consumed.is_terminal());
        assert!(TaskState::Done.is_terminal());
        assert!(TaskState::Rejected.is_terminal());
    }

    #[test]
    fn test_task_state_serde() {
        let json = serde_json::to_string(&TaskState::Consumed).expect("serialize");
        assert_eq!(json, "\"consumed\"");
    }

    #[test]
    fn test_queue_stats_unfinished() {
        let stats = QueueStats {
            queued: 3,
            consumed: 2,
            done: 10,
            rejected: 1,
        };
        assert_eq!(stats.unfinished(), 5);
    }

    #[test]
    fn test_row_conversion_rejects_bad_state() {
        let row = TaskRow {
            message_id: Uuid::new_v4(),
            seq: 1,
            queue_name: "default".into(),
            actor_name: "echo".into(),
            message: None,
            state: "bogus".into(),
            mtime: Utc::now(),
            eta: None,
            retries: 0,
            result_expiry: None,
        };
        assert!(Task::try_from(row).is_err());
    }
}
