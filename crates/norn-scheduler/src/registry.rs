//! Task registry: maps stable string keys to the functions workers execute.
//!
//! Populated once at process start by whoever embeds the scheduler (the
//! `norn` binary registers its built-ins). A task row's `function` column is
//! a key into this map.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use rusqlite::Connection;

use crate::error::{Result, SchedulerError};

/// Signature every task function implements.
pub type TaskFn = dyn Fn(&mut TaskContext<'_>) -> anyhow::Result<()> + Send + Sync;

/// Everything a task function gets to work with during one execution.
///
/// Output written here (`writeln!(ctx, ...)`) lands in the execution log.
/// Long-running functions must call [`TaskContext::heartbeat`] regularly;
/// it is cheap when called often and fails once the lease is gone.
pub struct TaskContext<'a> {
    task_id: i64,
    db: &'a Connection,
    out: &'a mut dyn Write,
    heartbeat: &'a mut dyn FnMut() -> Result<()>,
}

impl<'a> TaskContext<'a> {
    pub fn new(
        task_id: i64,
        db: &'a Connection,
        out: &'a mut dyn Write,
        heartbeat: &'a mut dyn FnMut() -> Result<()>,
    ) -> Self {
        Self {
            task_id,
            db,
            out,
            heartbeat,
        }
    }

    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    /// The worker's connection; inside the execution transaction when the
    /// function is transactional and the store supports wrapping.
    pub fn db(&self) -> &Connection {
        self.db
    }

    /// Prove the lease is still held. Returns `ShuttingDown` when it is not;
    /// propagate it with `?`.
    pub fn heartbeat(&mut self) -> Result<()> {
        (self.heartbeat)()
    }
}

impl Write for TaskContext<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.out.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }
}

/// A function registered under a key.
pub struct RegisteredTask {
    pub key: String,
    pub name: String,
    pub description: String,
    /// When false the function always runs outside any transaction, e.g.
    /// because it issues statements SQLite refuses inside one (`VACUUM`).
    pub transactional: bool,
    function: Box<TaskFn>,
}

impl RegisteredTask {
    pub fn new<F>(key: impl Into<String>, function: F) -> Self
    where
        F: Fn(&mut TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let key = key.into();
        Self {
            name: display_name(&key),
            key,
            description: String::new(),
            transactional: true,
            function: Box::new(function),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    pub fn call(&self, ctx: &mut TaskContext<'_>) -> anyhow::Result<()> {
        (self.function)(ctx)
    }
}

impl std::fmt::Debug for RegisteredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTask")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("transactional", &self.transactional)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<RegisteredTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transactional function under `key`.
    pub fn register<F>(&mut self, key: impl Into<String>, function: F) -> &mut Self
    where
        F: Fn(&mut TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_task(RegisteredTask::new(key, function))
    }

    /// Register a function that must never be wrapped in a transaction.
    pub fn register_non_transactional<F>(&mut self, key: impl Into<String>, function: F) -> &mut Self
    where
        F: Fn(&mut TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_task(RegisteredTask::new(key, function).transactional(false))
    }

    /// Register a fully described task. A later registration under the same
    /// key replaces the earlier one.
    pub fn register_task(&mut self, task: RegisteredTask) -> &mut Self {
        self.tasks.insert(task.key.clone(), Arc::new(task));
        self
    }

    pub fn resolve(&self, key: &str) -> Result<Arc<RegisteredTask>> {
        self.tasks
            .get(key)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownFunction {
                key: key.to_string(),
            })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tasks.contains_key(key)
    }

    /// Registered tasks ordered by key.
    pub fn list(&self) -> Vec<Arc<RegisteredTask>> {
        let mut tasks: Vec<_> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.key.cmp(&b.key));
        tasks
    }
}

/// "reports.send_daily_digest" -> "Send daily digest"
fn display_name(key: &str) -> String {
    let last = key.rsplit('.').next().unwrap_or(key).replace('_', " ");
    let mut chars = last.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
