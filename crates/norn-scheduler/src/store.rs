//! SQLite-backed task store: connection management, task CRUD, and the
//! individual lease-field writes used by [`crate::lease::TaskHandle`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use norn_core::config::DatabaseConfig;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row};
use tracing::info;
use uuid::Uuid;

use crate::{
    db::{format_ts, init_db, parse_opt_ts, parse_ts},
    error::{Result, SchedulerError},
    types::{Log, LogItem, NewTask, Task},
};

const TASK_COLUMNS: &str = "id, name, function, pid, shutdown_command, next_execution_time,
     last_checked, interval_us, disabled, current_run_id, environment";

/// Owns the process's main connection and knows how to open side
/// connections to the same database (the logger writes through one).
pub struct Store {
    conn: Connection,
    location: Location,
    busy_timeout: Duration,
    wrap_executions: bool,
}

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    /// Shared-cache in-memory database, alive while `conn` is open.
    Memory(String),
}

impl Store {
    /// Open the database described by `config`, creating the schema if needed.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let mut store = Self::open_path(&config.path)?;
        store.busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        store.conn.busy_timeout(store.busy_timeout)?;
        store.wrap_executions = config.wrap_executions;
        Ok(store)
    }

    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let location = Location::File(path.as_ref().to_path_buf());
        Self::open_location(location)
    }

    /// A private in-memory database. Side connections share it, but task
    /// executions are never wrapped in a transaction (see
    /// [`Store::wraps_executions`]).
    pub fn open_in_memory() -> Result<Self> {
        let uri = format!("file:norn-{}?mode=memory&cache=shared", Uuid::new_v4());
        Self::open_location(Location::Memory(uri))
    }

    fn open_location(location: Location) -> Result<Self> {
        let busy_timeout = Duration::from_millis(5_000);
        let conn = connect(&location, busy_timeout)?;
        init_db(&conn)?;
        Ok(Self {
            conn,
            location,
            busy_timeout,
            wrap_executions: false,
        })
    }

    /// Enable or disable transactional wrapping of task executions.
    pub fn with_wrapped_executions(mut self, wrap: bool) -> Self {
        self.wrap_executions = wrap;
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// A new connection to the same database, independent of any
    /// transaction open on [`Store::connection`].
    pub fn open_side_connection(&self) -> Result<Connection> {
        connect(&self.location, self.busy_timeout)
    }

    /// Whether task executions may run inside a transaction. In-memory
    /// databases never do: their shared-cache locking rejects the logger's
    /// writes outright instead of waiting.
    pub fn wraps_executions(&self) -> bool {
        self.wrap_executions && matches!(self.location, Location::File(_))
    }

    // --- tasks -------------------------------------------------------------

    /// Register a new task. Returns the fully populated [`Task`] record.
    pub fn create_task(&self, new: &NewTask) -> Result<Task> {
        let interval_us = interval_micros(new.interval)?;
        self.conn.execute(
            "INSERT INTO tasks (name, function, interval_us, disabled, environment,
                                next_execution_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                new.name,
                new.function,
                interval_us,
                new.disabled,
                new.environment,
                new.next_execution_time.map(format_ts),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(task_id = id, function = %new.function, env = %new.environment, "task registered");
        self.get_task(id)
    }

    /// Return the task registered for `new.function`, creating it first if
    /// it does not exist yet.
    pub fn get_or_create_task(&self, new: &NewTask) -> Result<Task> {
        match self.find_task_by_function(&new.function)? {
            Some(task) => Ok(task),
            None => self.create_task(new),
        }
    }

    pub fn get_task(&self, id: i64) -> Result<Task> {
        self.conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                [id],
                task_from_row,
            )
            .optional()?
            .ok_or(SchedulerError::TaskNotFound { id })
    }

    /// Like [`Store::get_task`], but tasks of other environments are
    /// reported as missing.
    pub fn get_task_in_env(&self, id: i64, environment: &str) -> Result<Task> {
        match self.get_task(id)? {
            task if task.environment == environment => Ok(task),
            _ => Err(SchedulerError::TaskNotFound { id }),
        }
    }

    pub fn find_task_by_function(&self, function: &str) -> Result<Option<Task>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE function = ?1"),
                [function],
                task_from_row,
            )
            .optional()?)
    }

    /// Enabled tasks of `environment`, the set the monitor keeps running.
    pub fn enabled_tasks(&self, environment: &str) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE disabled = 0 AND environment = ?1 ORDER BY id"
        ))?;
        let tasks = stmt
            .query_map([environment], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// All tasks of `environment`, enabled or not.
    pub fn list_tasks(&self, environment: &str) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE environment = ?1 ORDER BY id"
        ))?;
        let tasks = stmt
            .query_map([environment], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    pub fn set_disabled(&self, id: i64, disabled: bool) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE tasks SET disabled = ?1 WHERE id = ?2",
            rusqlite::params![disabled, id],
        )?;
        if n == 0 {
            return Err(SchedulerError::TaskNotFound { id });
        }
        info!(task_id = id, disabled, "task toggled");
        Ok(())
    }

    /// Ask the current owner of `id` to release its lease. The owner sees
    /// the command on its next heartbeat.
    pub fn request_shutdown(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE tasks SET shutdown_command = ?1 WHERE id = ?2",
            rusqlite::params![format_ts(at), id],
        )?;
        if n == 0 {
            return Err(SchedulerError::TaskNotFound { id });
        }
        info!(task_id = id, "shutdown requested");
        Ok(())
    }

    // --- lease fields ------------------------------------------------------

    pub fn save_lease(&self, id: i64, pid: u32, run_id: Uuid) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET pid = ?1, shutdown_command = NULL, current_run_id = ?2
             WHERE id = ?3",
            rusqlite::params![pid, run_id.to_string(), id],
        )?;
        Ok(())
    }

    pub fn clear_lease(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET pid = NULL, shutdown_command = NULL, current_run_id = NULL
             WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }

    /// Clear the lease only if `pid` still holds it. Returns whether it did.
    pub fn release_lease(&self, id: i64, pid: u32) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE tasks SET pid = NULL, current_run_id = NULL WHERE id = ?1 AND pid = ?2",
            rusqlite::params![id, pid],
        )?;
        Ok(n > 0)
    }

    pub fn save_last_checked(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET last_checked = ?1 WHERE id = ?2",
            rusqlite::params![format_ts(at), id],
        )?;
        Ok(())
    }

    /// Persist a new `next_execution_time`. The guard keeps the column
    /// monotonic even if a stale worker races a fresh one.
    pub fn save_next_execution_time(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let at = format_ts(at);
        self.conn.execute(
            "UPDATE tasks SET next_execution_time = ?1
             WHERE id = ?2 AND (next_execution_time IS NULL OR next_execution_time < ?1)",
            rusqlite::params![at, id],
        )?;
        Ok(())
    }

    // --- logs --------------------------------------------------------------

    /// Retained logs of a task, oldest first.
    pub fn logs_for_task(&self, task_id: i64) -> Result<Vec<Log>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, execution_time, task_id, run_id FROM logs
             WHERE task_id = ?1 ORDER BY id",
        )?;
        let logs = stmt
            .query_map([task_id], |row| {
                Ok(Log {
                    id: row.get(0)?,
                    execution_time: parse_ts(&row.get::<_, String>(1)?)?,
                    task_id: row.get(2)?,
                    run_id: parse_uuid(&row.get::<_, String>(3)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(logs)
    }

    /// Captured lines of one log, in write order.
    pub fn log_items(&self, log_id: i64) -> Result<Vec<LogItem>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, log_id, data FROM log_items WHERE log_id = ?1 ORDER BY id")?;
        let items = stmt
            .query_map([log_id], |row| {
                Ok(LogItem {
                    id: row.get(0)?,
                    log_id: row.get(1)?,
                    data: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }
}

fn connect(location: &Location, busy_timeout: Duration) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = match location {
        Location::File(path) => {
            let conn = Connection::open_with_flags(path, flags)?;
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
            conn
        }
        Location::Memory(uri) => Connection::open_with_flags(uri, flags)?,
    };
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

pub(crate) fn interval_micros(interval: chrono::Duration) -> Result<i64> {
    interval
        .num_microseconds()
        .filter(|us| *us > 0)
        .ok_or_else(|| SchedulerError::InvalidInterval(format!("{interval} (must be > 0)")))
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let pid: Option<i64> = row.get(3)?;
    let run_id: Option<String> = row.get(9)?;
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        function: row.get(2)?,
        pid: pid.and_then(|p| u32::try_from(p).ok()),
        shutdown_command: parse_opt_ts(row.get(4)?)?,
        next_execution_time: parse_opt_ts(row.get(5)?)?,
        last_checked: parse_opt_ts(row.get(6)?)?,
        interval: chrono::Duration::microseconds(row.get(7)?),
        disabled: row.get(8)?,
        current_run_id: run_id.as_deref().map(parse_uuid).transpose()?,
        environment: row.get(10)?,
    })
}

fn parse_uuid(raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}
