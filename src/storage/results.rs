//! Task results, stored on the task row with an expiry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::database::DatabaseError;
use super::millis;

/// A stored result payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub payload: Vec<u8>,
    pub expiry: Option<DateTime<Utc>>,
}

impl TaskResult {
    /// Whether the result is past its expiry at `now`.
    ///
    /// Expired results stay readable until housekeeping removes the row.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.map(|expiry| expiry <= now).unwrap_or(false)
    }
}

/// Store/fetch of task results.
#[derive(Clone)]
pub struct ResultStore {
    pool: PgPool,
}

impl ResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Writes a result for an existing task, expiring `ttl` from now.
    pub async fn store(
        &self,
        message_id: Uuid,
        result: &[u8],
        ttl: Duration,
    ) -> Result<(), DatabaseError> {
        let updated = sqlx::query(
            r#"
            UPDATE tasks
            SET result = $2,
                result_expiry = NOW() + ($3::bigint * INTERVAL '1 millisecond'),
                mtime = NOW()
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .bind(result)
        .bind(millis(ttl))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(DatabaseError::NotFound(format!("task {}", message_id)));
        }
        Ok(())
    }

    /// Reads a result. `None` when the task is unknown or has no result yet.
    pub async fn fetch(&self, message_id: Uuid) -> Result<Option<TaskResult>, DatabaseError> {
        let row: Option<(Option<Vec<u8>>, Option<DateTime<Utc>>)> =
            sqlx::query_as("SELECT result, result_expiry FROM tasks WHERE message_id = $1")
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.and_then(|(payload, expiry)| payload.map(|payload| TaskResult { payload, expiry })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_expiry() {
        let now = Utc::now();
        let result = TaskResult {
            payload: b"ok".to_vec(),
            expiry: Some(now - chrono::Duration::seconds(1)),
        };
        assert!(result.is_expired(now));

        let result = TaskResult {
            payload: b"ok".to_vec(),
            expiry: Some(now + chrono::Duration::seconds(60)),
        };
        assert!(!result.is_expired(now));
    }

    #[test]
    fn test_result_without_expiry_never_expires() {
        let result = TaskResult {
            payload: Vec::new(),
            expiry: None,
        };
        assert!(!result.is_expired(Utc::now()));
    }
}
