//! Database schema constants and SQL statements.
//!
//! Tables and indexes are plain constants. The enqueue notification trigger
//! depends on the configured channel prefix, so it is rendered at migration
//! time by [`notify_trigger_statement`].

/// Task rows: one per enqueued message, carrying its state and result.
pub const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    message_id UUID PRIMARY KEY,
    seq BIGINT GENERATED ALWAYS AS IDENTITY,
    queue_name TEXT NOT NULL DEFAULT 'default',
    actor_name TEXT NOT NULL,
    message BYTEA,
    state TEXT NOT NULL DEFAULT 'queued'
        CHECK (state IN ('queued', 'consumed', 'done', 'rejected')),
    mtime TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    eta TIMESTAMPTZ,
    retries INTEGER NOT NULL DEFAULT 0,
    result BYTEA,
    result_expiry TIMESTAMPTZ
)
"#;

/// Recurring schedules dispatched by the scheduler.
pub const CREATE_SCHEDULES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schedules (
    id UUID PRIMARY KEY,
    uid TEXT NOT NULL UNIQUE,
    actor_name TEXT NOT NULL,
    queue_name TEXT,
    args BYTEA NOT NULL DEFAULT ''::bytea,
    kwargs BYTEA NOT NULL DEFAULT ''::bytea,
    options BYTEA NOT NULL DEFAULT ''::bytea,
    crontab TEXT NOT NULL,
    paused BOOLEAN NOT NULL DEFAULT FALSE,
    next_run TIMESTAMPTZ NOT NULL,
    rel_obj_type TEXT,
    rel_obj_id TEXT,
    description TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Indexes for claims, housekeeping and dispatch.
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_tasks_state_mtime ON tasks(state, mtime);
CREATE INDEX IF NOT EXISTS idx_tasks_queue_state_seq ON tasks(queue_name, state, seq);
CREATE INDEX IF NOT EXISTS idx_schedules_paused_next_run ON schedules(paused, next_run);
CREATE INDEX IF NOT EXISTS idx_schedules_rel_obj ON schedules(rel_obj_type, rel_obj_id)
"#;

/// Trigger function sending the enqueue notification.
///
/// `TG_ARGV[0]` is the channel base (`{prefix}.tasks`). `pg_notify` is only
/// delivered when the surrounding transaction commits.
pub const CREATE_NOTIFY_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION pgtask_notify_enqueue() RETURNS trigger AS $$
BEGIN
    IF NEW.state = 'queued' THEN
        PERFORM pg_notify(TG_ARGV[0] || '.' || NEW.queue_name || '.enqueue', NEW.message_id::text);
    END IF;
    RETURN NULL;
END;
$$ LANGUAGE plpgsql
"#;

/// Renders the deferred constraint trigger for a channel prefix.
///
/// The prefix must already be validated (see `Settings::validate`), as it is
/// interpolated into the statement.
pub fn notify_trigger_statement(channel_prefix: &str) -> String {
    format!(
        r#"
DROP TRIGGER IF EXISTS tasks_notify_enqueue ON tasks;
CREATE CONSTRAINT TRIGGER tasks_notify_enqueue
    AFTER INSERT OR UPDATE ON tasks
    DEFERRABLE INITIALLY DEFERRED
    FOR EACH ROW EXECUTE FUNCTION pgtask_notify_enqueue('{}.tasks')
"#,
        channel_prefix
    )
}

/// Returns every migration as `(name, sql)` in apply order.
///
/// The trigger migration name embeds the prefix so that changing the prefix
/// re-creates the trigger on the next run.
pub fn all_schema_statements(channel_prefix: &str) -> Vec<(String, String)> {
    let mut statements: Vec<(String, String)> = [
        CREATE_TASKS_TABLE,
        CREATE_SCHEDULES_TABLE,
        CREATE_INDEXES,
        CREATE_NOTIFY_FUNCTION,
    ]
    .iter()
    .enumerate()
    .map(|(idx, sql)| (format!("schema_v1_part_{}", idx), sql.to_string()))
    .collect();

    statements.push((
        format!("notify_trigger_{}", channel_prefix),
        notify_trigger_statement(channel_prefix),
    ));
    statements
}

/// Table names in the schema.
pub mod tables {
    /// Tasks table name.
    pub const TASKS: &str = "tasks";
    /// Schedules table name.
    pub const SCHEDULES: &str = "schedules";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements("pgtask");
        assert_eq!(statements.len(), 5);
        assert!(statements[0].1.contains("CREATE TABLE IF NOT EXISTS tasks"));
        assert!(statements[2].1.contains("CREATE INDEX"));
        // Trigger goes last, after its function exists
        assert_eq!(statements[4].0, "notify_trigger_pgtask");
        assert!(statements[4].1.contains("'pgtask.tasks'"));
    }

    #[test]
    fn test_notify_trigger_is_deferred() {
        let sql = notify_trigger_statement("app");
        assert!(sql.contains("DEFERRABLE INITIALLY DEFERRED"));
        assert!(sql.contains("DROP TRIGGER IF EXISTS"));
    }

    #[test]
    fn test_state_check_constraint() {
        assert!(CREATE_TASKS_TABLE.contains("'queued', 'consumed', 'done', 'rejected'"));
    }

    #[test]
    fn test_table_constants() {
        assert_eq!(tables::TASKS, "tasks");
        assert_eq!(tables::SCHEDULES, "schedules");
    }
}
