//! Per-execution log capture.
//!
//! A [`Logger`] owns its own connection so that log lines are written (and
//! visible) independently of any transaction wrapping the execution.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::io::{self, Write};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use crate::{
    db::format_ts,
    error::{Result, TaskPanic},
    store::Store,
    types::{Log, Task},
};

pub struct Logger {
    conn: Connection,
    log: Log,
    pending: Vec<u8>,
    /// Complete lines queued while held; see [`Logger::hold`].
    held: Option<Vec<String>>,
    closed: bool,
}

impl Logger {
    /// Prune the task's history down to `keep_logs - 1` entries and open a
    /// fresh log, so at most `keep_logs` logs exist once this one is added.
    pub fn open(store: &Store, task: &Task, keep_logs: usize, now: DateTime<Utc>) -> Result<Self> {
        let mut conn = store.open_side_connection()?;
        let keep = i64::try_from(keep_logs.saturating_sub(1)).unwrap_or(i64::MAX);
        let run_id = task.current_run_id.unwrap_or_else(Uuid::new_v4);

        let tx = conn.transaction()?;
        let stale = "SELECT id FROM logs WHERE task_id = ?1 ORDER BY id DESC LIMIT -1 OFFSET ?2";
        let pruned_items = tx.execute(
            &format!("DELETE FROM log_items WHERE log_id IN ({stale})"),
            rusqlite::params![task.id, keep],
        )?;
        let pruned = tx.execute(
            &format!("DELETE FROM logs WHERE id IN ({stale})"),
            rusqlite::params![task.id, keep],
        )?;
        tx.execute(
            "INSERT INTO logs (execution_time, task_id, run_id) VALUES (?1, ?2, ?3)",
            rusqlite::params![format_ts(now), task.id, run_id.to_string()],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        if pruned > 0 {
            debug!(task_id = task.id, pruned, pruned_items, "old logs pruned");
        }

        Ok(Self {
            conn,
            log: Log {
                id,
                execution_time: now,
                task_id: task.id,
                run_id,
            },
            pending: Vec::new(),
            held: None,
            closed: false,
        })
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    /// Queue complete lines in memory until [`Logger::release`].
    ///
    /// SQLite admits a single writer. While the worker's connection holds an
    /// execution transaction, an insert through this connection would wait
    /// for it and then fail with `SQLITE_BUSY`.
    pub fn hold(&mut self) {
        if self.held.is_none() {
            self.held = Some(Vec::new());
        }
    }

    /// Store the lines queued since [`Logger::hold`] and go back to
    /// writing each line as it completes. No-op when not held.
    pub fn release(&mut self) -> Result<()> {
        let Some(lines) = self.held.take() else {
            return Ok(());
        };
        for line in &lines {
            self.persist(line)?;
        }
        Ok(())
    }

    /// Store any trailing partial line and stop capturing.
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.release()?;
        let rest = std::mem::take(&mut self.pending);
        self.insert_line(&rest)
    }

    fn store_complete_lines(&mut self) -> Result<()> {
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.insert_line(&line[..pos])?;
        }
        Ok(())
    }

    fn insert_line(&mut self, raw: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end_matches('\r');
        if line.trim().is_empty() {
            return Ok(());
        }
        match &mut self.held {
            Some(held) => {
                held.push(line.to_string());
                Ok(())
            }
            None => self.persist(line),
        }
    }

    fn persist(&self, line: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO log_items (log_id, data) VALUES (?1, ?2)",
            rusqlite::params![self.log.id, line],
        )?;
        Ok(())
    }
}

impl Write for Logger {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "log closed"));
        }
        self.pending.extend_from_slice(buf);
        self.store_complete_lines().map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            debug!(log_id = self.log.id, error = %e, "dropping unflushed log line");
        }
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("log_id", &self.log.id)
            .field("task_id", &self.log.task_id)
            .finish_non_exhaustive()
    }
}

/// Writes everything to both sinks.
pub struct Tee<A, B> {
    primary: A,
    mirror: B,
}

impl<A: Write, B: Write> Tee<A, B> {
    pub fn new(primary: A, mirror: B) -> Self {
        Self { primary, mirror }
    }
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.primary.write_all(buf)?;
        self.mirror.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.primary.flush()?;
        self.mirror.flush()
    }
}

/// Record a failed execution: the message first, then its cause chain,
/// then the trace. A panic always carries its location and backtrace; a
/// returned error has a backtrace only when `RUST_BACKTRACE` or
/// `RUST_LIB_BACKTRACE` was set where it was created.
pub fn write_failure(out: &mut dyn Write, err: &anyhow::Error) -> io::Result<()> {
    writeln!(out, "ERROR {err}")?;
    for cause in err.chain().skip(1) {
        writeln!(out, "    caused by: {cause}")?;
    }
    match err.downcast_ref::<TaskPanic>() {
        Some(panic) => {
            if let Some(location) = &panic.location {
                writeln!(out, "    at {location}")?;
            }
            write_backtrace(out, &panic.backtrace)
        }
        None => write_backtrace(out, err.backtrace()),
    }
}

fn write_backtrace(out: &mut dyn Write, backtrace: &Backtrace) -> io::Result<()> {
    if backtrace.status() != BacktraceStatus::Captured {
        return Ok(());
    }
    writeln!(out, "    backtrace:")?;
    for frame in backtrace.to_string().lines() {
        writeln!(out, "      {}", frame.trim_end())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewTask;

    fn task(store: &Store, function: &str) -> Task {
        store
            .create_task(&NewTask::new(
                function,
                function,
                chrono::Duration::seconds(1),
                "default",
            ))
            .unwrap()
    }

    fn lines(store: &Store, log_id: i64) -> Vec<String> {
        store
            .log_items(log_id)
            .unwrap()
            .into_iter()
            .map(|item| item.data)
            .collect()
    }

    #[test]
    fn splits_lines_and_skips_blank_ones() {
        let store = Store::open_in_memory().unwrap();
        let t = task(&store, "jobs.a");
        let mut logger = Logger::open(&store, &t, 10, Utc::now()).unwrap();
        let log_id = logger.log().id;

        write!(logger, "first ").unwrap();
        write!(logger, "line\n\n   \nsecond\r\nthird").unwrap();
        // Partial lines wait for their newline.
        assert_eq!(lines(&store, log_id), vec!["first line", "second"]);

        logger.close().unwrap();
        assert_eq!(lines(&store, log_id), vec!["first line", "second", "third"]);
    }

    #[test]
    fn drop_flushes_partial_line() {
        let store = Store::open_in_memory().unwrap();
        let t = task(&store, "jobs.a");
        let log_id = {
            let mut logger = Logger::open(&store, &t, 10, Utc::now()).unwrap();
            write!(logger, "no newline").unwrap();
            logger.log().id
        };
        assert_eq!(lines(&store, log_id), vec!["no newline"]);
    }

    #[test]
    fn retention_is_per_task() {
        let store = Store::open_in_memory().unwrap();
        let a = task(&store, "jobs.a");
        let b = task(&store, "jobs.b");

        for _ in 0..3 {
            Logger::open(&store, &b, 3, Utc::now()).unwrap().close().unwrap();
        }
        for n in 0..5 {
            let mut logger = Logger::open(&store, &a, 3, Utc::now()).unwrap();
            writeln!(logger, "run {n}").unwrap();
            logger.close().unwrap();
        }

        let kept = store.logs_for_task(a.id).unwrap();
        assert_eq!(kept.len(), 3);
        let first_lines: Vec<_> = kept.iter().map(|l| lines(&store, l.id)).collect();
        assert_eq!(
            first_lines,
            vec![vec!["run 2"], vec!["run 3"], vec!["run 4"]]
        );
        assert_eq!(store.logs_for_task(b.id).unwrap().len(), 3);

        let orphans: i64 = store
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM log_items WHERE log_id NOT IN (SELECT id FROM logs)",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[test]
    fn run_id_follows_lease() {
        let store = Store::open_in_memory().unwrap();
        let t = task(&store, "jobs.a");
        let run_id = Uuid::new_v4();
        store.save_lease(t.id, 1, run_id).unwrap();
        let leased = store.get_task(t.id).unwrap();

        let logger = Logger::open(&store, &leased, 10, Utc::now()).unwrap();
        assert_eq!(logger.log().run_id, run_id);
    }

    #[test]
    fn tee_and_failure_format() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        {
            let mut tee = Tee::new(&mut a, &mut b);
            let err = anyhow::anyhow!("disk full").context("exception");
            write_failure(&mut tee, &err).unwrap();
        }
        assert_eq!(a, b);
        let text = String::from_utf8(a).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[..2], ["ERROR exception", "    caused by: disk full"]);
        // Anything after the cause chain is the (env-dependent) backtrace.
        if lines.len() > 2 {
            assert_eq!(lines[2], "    backtrace:");
        }
    }

    #[test]
    fn panic_failure_carries_location_and_backtrace() {
        let err = anyhow::Error::new(TaskPanic {
            message: "kaboom".into(),
            location: Some("src/jobs.rs:12:5".into()),
            backtrace: Backtrace::force_capture(),
        });
        let mut out = Vec::new();
        write_failure(&mut out, &err).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines[..3],
            ["ERROR task panicked: kaboom", "    at src/jobs.rs:12:5", "    backtrace:"]
        );
        assert!(lines.len() > 3);
        assert!(lines[3..].iter().all(|l| l.starts_with("      ")));
    }

    #[test]
    fn held_lines_are_stored_on_release_in_order() {
        let store = Store::open_in_memory().unwrap();
        let t = task(&store, "jobs.a");
        let mut logger = Logger::open(&store, &t, 10, Utc::now()).unwrap();
        let log_id = logger.log().id;

        writeln!(logger, "before").unwrap();
        logger.hold();
        write!(logger, "during\nhalf").unwrap();
        assert_eq!(lines(&store, log_id), vec!["before"]);

        logger.release().unwrap();
        assert_eq!(lines(&store, log_id), vec!["before", "during"]);
        writeln!(logger, " done").unwrap();
        assert_eq!(lines(&store, log_id), vec!["before", "during", "half done"]);
    }

    #[test]
    fn close_stores_lines_still_held() {
        let store = Store::open_in_memory().unwrap();
        let t = task(&store, "jobs.a");
        let mut logger = Logger::open(&store, &t, 10, Utc::now()).unwrap();
        let log_id = logger.log().id;
        logger.hold();
        write!(logger, "queued\ntail").unwrap();
        logger.close().unwrap();
        assert_eq!(lines(&store, log_id), vec!["queued", "tail"]);
    }
}
