//! Schedule records and their CRUD store.
//!
//! Write operations validate the crontab and keep `next_run` consistent:
//! a crontab change recomputes it, pausing parks it at the Unix epoch and
//! resuming recomputes it forward from now.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use tracing::info;
use uuid::Uuid;

use crate::error::ScheduleError;

use super::cron::{compute_next_run, CronSchedule};

const SCHEDULE_COLUMNS: &str = "id, uid, actor_name, queue_name, args, kwargs, options, crontab, \
                                paused, next_run, rel_obj_type, rel_obj_id, description, \
                                created_at, updated_at";

/// `next_run` of a paused schedule.
pub fn paused_next_run() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Weak reference to the object that owns a schedule.
///
/// Never dereferenced here; it only lets owners find their schedules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelatedObject {
    pub kind: String,
    pub id: String,
}

/// A recurring task definition.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Schedule {
    pub id: Uuid,
    /// Natural key chosen by the owner, unique across schedules.
    pub uid: String,
    pub actor_name: String,
    /// Explicit queue; falls back to the actor's queue when `None`.
    pub queue_name: Option<String>,
    #[serde(skip)]
    pub args: Vec<u8>,
    #[serde(skip)]
    pub kwargs: Vec<u8>,
    #[serde(skip)]
    pub options: Vec<u8>,
    pub crontab: String,
    pub paused: bool,
    pub next_run: DateTime<Utc>,
    pub rel_obj_type: Option<String>,
    pub rel_obj_id: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn related_object(&self) -> Option<RelatedObject> {
        match (&self.rel_obj_type, &self.rel_obj_id) {
            (Some(kind), Some(id)) => Some(RelatedObject {
                kind: kind.clone(),
                id: id.clone(),
            }),
            _ => None,
        }
    }
}

/// Input for [`ScheduleStore::create`].
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub uid: String,
    pub actor_name: String,
    pub queue_name: Option<String>,
    pub args: Vec<u8>,
    pub kwargs: Vec<u8>,
    pub options: Vec<u8>,
    pub crontab: String,
    pub paused: bool,
    pub rel_obj: Option<RelatedObject>,
    pub description: Option<String>,
}

impl NewSchedule {
    pub fn new(
        uid: impl Into<String>,
        actor_name: impl Into<String>,
        crontab: impl Into<String>,
    ) -> Self {
        Self {
            uid: uid.into(),
            actor_name: actor_name.into(),
            queue_name: None,
            args: Vec::new(),
            kwargs: Vec::new(),
            options: Vec::new(),
            crontab: crontab.into(),
            paused: false,
            rel_obj: None,
            description: None,
        }
    }

    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn with_args(mut self, args: Vec<u8>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Vec<u8>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_options(mut self, options: Vec<u8>) -> Self {
        self.options = options;
        self
    }

    pub fn paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    pub fn with_rel_obj(mut self, kind: impl Into<String>, id: impl Into<String>) -> Self {
        self.rel_obj = Some(RelatedObject {
            kind: kind.into(),
            id: id.into(),
        });
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Partial update for [`ScheduleStore::update`]. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct ScheduleUpdate {
    pub crontab: Option<String>,
    pub args: Option<Vec<u8>>,
    pub kwargs: Option<Vec<u8>>,
    pub options: Option<Vec<u8>>,
    pub queue_name: Option<Option<String>>,
    pub paused: Option<bool>,
    pub description: Option<Option<String>>,
}

/// Resolves the `next_run` a schedule should have after a write.
///
/// Recomputes when the crontab changed or the schedule was resumed; keeps the
/// stored value otherwise so edits do not shift an upcoming run.
fn resolve_next_run(
    current: &Schedule,
    crontab: &str,
    paused: bool,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    if paused {
        return Ok(paused_next_run());
    }
    if crontab != current.crontab || current.paused {
        return Ok(compute_next_run(crontab, now, now)?);
    }
    Ok(current.next_run)
}

/// CRUD access to the `schedules` table.
#[derive(Clone)]
pub struct ScheduleStore {
    pool: PgPool,
}

impl ScheduleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates a schedule, or replaces the definition of the one with the
    /// same `uid`.
    pub async fn create(&self, new: NewSchedule) -> Result<Schedule, ScheduleError> {
        CronSchedule::parse(&new.crontab)?;
        if new.uid.trim().is_empty() {
            return Err(ScheduleError::Invalid("uid cannot be empty".to_string()));
        }
        crate::broker::channel::validate_actor_name(&new.actor_name)?;

        let now = Utc::now();
        let next_run = if new.paused {
            paused_next_run()
        } else {
            compute_next_run(&new.crontab, now, now)?
        };
        let (rel_type, rel_id) = match new.rel_obj {
            Some(obj) => (Some(obj.kind), Some(obj.id)),
            None => (None, None),
        };

        let sql = format!(
            r#"
            INSERT INTO schedules (
                id, uid, actor_name, queue_name, args, kwargs, options, crontab,
                paused, next_run, rel_obj_type, rel_obj_id, description
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (uid) DO UPDATE SET
                actor_name = EXCLUDED.actor_name,
                queue_name = EXCLUDED.queue_name,
                args = EXCLUDED.args,
                kwargs = EXCLUDED.kwargs,
                options = EXCLUDED.options,
                crontab = EXCLUDED.crontab,
                paused = EXCLUDED.paused,
                next_run = CASE
                    WHEN schedules.crontab = EXCLUDED.crontab
                         AND schedules.paused = EXCLUDED.paused
                    THEN schedules.next_run
                    ELSE EXCLUDED.next_run
                END,
                rel_obj_type = EXCLUDED.rel_obj_type,
                rel_obj_id = EXCLUDED.rel_obj_id,
                description = EXCLUDED.description,
                updated_at = NOW()
            RETURNING {}
            "#,
            SCHEDULE_COLUMNS
        );

        let schedule: Schedule = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(&new.uid)
            .bind(&new.actor_name)
            .bind(&new.queue_name)
            .bind(&new.args)
            .bind(&new.kwargs)
            .bind(&new.options)
            .bind(&new.crontab)
            .bind(new.paused)
            .bind(next_run)
            .bind(rel_type)
            .bind(rel_id)
            .bind(&new.description)
            .fetch_one(&self.pool)
            .await?;

        info!(
            schedule_id = %schedule.id,
            uid = %schedule.uid,
            crontab = %schedule.crontab,
            next_run = %schedule.next_run,
            "Saved schedule"
        );
        Ok(schedule)
    }

    /// Applies a partial update under a row lock.
    pub async fn update(&self, id: Uuid, update: ScheduleUpdate) -> Result<Schedule, ScheduleError> {
        if let Some(crontab) = &update.crontab {
            CronSchedule::parse(crontab)?;
        }

        let mut tx = self.pool.begin().await?;
        let current = Self::get_for_update(&mut *tx, id)
            .await?
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))?;

        let crontab = update.crontab.unwrap_or_else(|| current.crontab.clone());
        let paused = update.paused.unwrap_or(current.paused);
        let next_run = resolve_next_run(&current, &crontab, paused, Utc::now())?;

        let sql = format!(
            r#"
            UPDATE schedules SET
                crontab = $2,
                paused = $3,
                next_run = $4,
                args = $5,
                kwargs = $6,
                options = $7,
                queue_name = $8,
                description = $9,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            SCHEDULE_COLUMNS
        );

        let schedule: Schedule = sqlx::query_as(&sql)
            .bind(id)
            .bind(&crontab)
            .bind(paused)
            .bind(next_run)
            .bind(update.args.unwrap_or(current.args))
            .bind(update.kwargs.unwrap_or(current.kwargs))
            .bind(update.options.unwrap_or(current.options))
            .bind(update.queue_name.unwrap_or(current.queue_name))
            .bind(update.description.unwrap_or(current.description))
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(schedule)
    }

    /// Pauses or resumes a schedule. Repeating the current state is a no-op.
    pub async fn set_paused(&self, id: Uuid, paused: bool) -> Result<Schedule, ScheduleError> {
        self.update(
            id,
            ScheduleUpdate {
                paused: Some(paused),
                ..Default::default()
            },
        )
        .await
    }

    /// Deletes a schedule. Returns whether it existed.
    pub async fn delete(&self, id: Uuid) -> Result<bool, ScheduleError> {
        let deleted = sqlx::query("DELETE FROM schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Schedule>, ScheduleError> {
        let sql = format!("SELECT {} FROM schedules WHERE id = $1", SCHEDULE_COLUMNS);
        Ok(sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn find_by_uid(&self, uid: &str) -> Result<Option<Schedule>, ScheduleError> {
        let sql = format!("SELECT {} FROM schedules WHERE uid = $1", SCHEDULE_COLUMNS);
        Ok(sqlx::query_as(&sql)
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Lists schedules, optionally only those owned by `rel_obj`.
    pub async fn list(&self, rel_obj: Option<&RelatedObject>) -> Result<Vec<Schedule>, ScheduleError> {
        let schedules = match rel_obj {
            Some(obj) => {
                let sql = format!(
                    "SELECT {} FROM schedules WHERE rel_obj_type = $1 AND rel_obj_id = $2 \
                     ORDER BY uid",
                    SCHEDULE_COLUMNS
                );
                sqlx::query_as(&sql)
                    .bind(&obj.kind)
                    .bind(&obj.id)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("SELECT {} FROM schedules ORDER BY uid", SCHEDULE_COLUMNS);
                sqlx::query_as(&sql).fetch_all(&self.pool).await?
            }
        };
        Ok(schedules)
    }

    async fn get_for_update(
        conn: &mut PgConnection,
        id: Uuid,
    ) -> Result<Option<Schedule>, ScheduleError> {
        let sql = format!(
            "SELECT {} FROM schedules WHERE id = $1 FOR UPDATE",
            SCHEDULE_COLUMNS
        );
        Ok(sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?)
    }

    /// Locks and returns every unpaused schedule due before `now`.
    ///
    /// Rows locked by a concurrent writer are skipped and picked up on a
    /// later tick.
    pub(crate) async fn lock_due(
        conn: &mut PgConnection,
        now: DateTime<Utc>,
    ) -> Result<Vec<Schedule>, ScheduleError> {
        let sql = format!(
            "SELECT {} FROM schedules WHERE paused = FALSE AND next_run < $1 \
             ORDER BY next_run FOR UPDATE SKIP LOCKED",
            SCHEDULE_COLUMNS
        );
        Ok(sqlx::query_as(&sql)
            .bind(now)
            .fetch_all(&mut *conn)
            .await?)
    }

    pub(crate) async fn set_next_run(
        conn: &mut PgConnection,
        id: Uuid,
        next_run: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        sqlx::query("UPDATE schedules SET next_run = $2 WHERE id = $1")
            .bind(id)
            .bind(next_run)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(crontab: &str, paused: bool, next_run: DateTime<Utc>) -> Schedule {
        Schedule {
            id: Uuid::new_v4(),
            uid: "cleanup".into(),
            actor_name: "cleanup".into(),
            queue_name: None,
            args: Vec::new(),
            kwargs: Vec::new(),
            options: Vec::new(),
            crontab: crontab.into(),
            paused,
            next_run,
            rel_obj_type: None,
            rel_obj_id: None,
            description: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_pause_parks_next_run_at_epoch() {
        let now = Utc::now();
        let current = schedule("*/5 * * * *", false, now + chrono::Duration::minutes(3));
        let next = resolve_next_run(&current, "*/5 * * * *", true, now).expect("next");
        assert_eq!(next, paused_next_run());
    }

    #[test]
    fn test_pause_is_idempotent() {
        let now = Utc::now();
        let current = schedule("*/5 * * * *", true, paused_next_run());
        let next = resolve_next_run(&current, "*/5 * * * *", true, now).expect("next");
        assert_eq!(next, current.next_run);
    }

    #[test]
    fn test_resume_recomputes_forward() {
        let now = Utc::now();
        let current = schedule("*/5 * * * *", true, paused_next_run());
        let next = resolve_next_run(&current, "*/5 * * * *", false, now).expect("next");
        assert!(next > now);
        assert!(next <= now + chrono::Duration::minutes(5));
    }

    #[test]
    fn test_unchanged_crontab_keeps_next_run() {
        let now = Utc::now();
        let planned = now + chrono::Duration::minutes(4);
        let current = schedule("*/5 * * * *", false, planned);
        let next = resolve_next_run(&current, "*/5 * * * *", false, now).expect("next");
        assert_eq!(next, planned);
    }

    #[test]
    fn test_crontab_change_recomputes() {
        let now = Utc::now();
        let current = schedule("0 0 1 1 *", false, now + chrono::Duration::days(200));
        let next = resolve_next_run(&current, "* * * * *", false, now).expect("next");
        assert!(next <= now + chrono::Duration::minutes(1));
    }

    #[test]
    fn test_related_object() {
        let mut s = schedule("@daily", false, Utc::now());
        assert!(s.related_object().is_none());
        s.rel_obj_type = Some("source".into());
        s.rel_obj_id = Some("42".into());
        assert_eq!(
            s.related_object(),
            Some(RelatedObject {
                kind: "source".into(),
                id: "42".into()
            })
        );
    }

    #[test]
    fn test_new_schedule_builder() {
        let new = NewSchedule::new("nightly", "reports.build", "@daily")
            .with_queue("reports")
            .with_rel_obj("tenant", "7")
            .paused(true);
        assert_eq!(new.queue_name.as_deref(), Some("reports"));
        assert!(new.paused);
        assert_eq!(new.rel_obj.expect("rel obj").id, "7");
    }
}
