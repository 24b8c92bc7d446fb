use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `tasks`, `logs` and `log_items` tables (idempotent) plus the
/// indexes used by the monitor poll and by log rotation.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            name                TEXT    NOT NULL,
            function            TEXT    NOT NULL UNIQUE,
            pid                 INTEGER,            -- owning worker, NULL when unowned
            shutdown_command    TEXT,               -- RFC 3339 or NULL
            next_execution_time TEXT,               -- RFC 3339 or NULL
            last_checked        TEXT,               -- RFC 3339 or NULL
            interval_us         INTEGER NOT NULL,
            disabled            INTEGER NOT NULL DEFAULT 0,
            current_run_id      TEXT,               -- UUID or NULL
            environment         TEXT    NOT NULL
        );

        -- Monitor poll: SELECT … WHERE disabled = 0 AND environment = ?
        CREATE INDEX IF NOT EXISTS idx_tasks_env ON tasks (environment, disabled);

        CREATE TABLE IF NOT EXISTS logs (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_time  TEXT    NOT NULL,
            task_id         INTEGER NOT NULL REFERENCES tasks (id) ON DELETE CASCADE,
            run_id          TEXT    NOT NULL
        );

        -- Rotation: SELECT id FROM logs WHERE task_id = ? ORDER BY id DESC
        CREATE INDEX IF NOT EXISTS idx_logs_task ON logs (task_id, id);

        CREATE TABLE IF NOT EXISTS log_items (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            log_id  INTEGER NOT NULL REFERENCES logs (id) ON DELETE CASCADE,
            data    TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_log_items_log ON log_items (log_id, id);
        ",
    )?;
    Ok(())
}

/// Fixed-width UTC rendering, so stored timestamps also sort as text.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub fn parse_opt_ts(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}
