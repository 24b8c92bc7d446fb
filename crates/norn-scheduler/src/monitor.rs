//! Fleet supervisor: keeps exactly one worker process per enabled task.
//!
//! The monitor never touches lease fields. Its only inputs are the enabled
//! task set of its environment and the liveness of its own children; the
//! workers sort out ownership among themselves through the store.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, SchedulerError},
    store::Store,
    types::Task,
};

/// A running worker process as seen by the monitor.
pub trait WorkerProcess: Send {
    fn id(&self) -> u32;
    /// Non-blocking; reaps the process when it has exited.
    fn has_exited(&mut self) -> Result<bool>;
    /// Ask the worker to stop (SIGTERM).
    fn terminate(&mut self) -> Result<()>;
    /// Stop the worker now (SIGKILL).
    fn kill(&mut self) -> Result<()>;
}

/// Starts worker processes for tasks.
pub trait WorkerLauncher: Send {
    fn launch(&mut self, task: &Task) -> Result<Box<dyn WorkerProcess>>;
}

/// A worker spawned as a child of this process.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

impl WorkerProcess for ChildProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn has_exited(&mut self) -> Result<bool> {
        match self.child.try_wait()? {
            Some(status) => {
                debug!(pid = self.child.id(), %status, "worker process exited");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn terminate(&mut self) -> Result<()> {
        #[cfg(unix)]
        {
            // Safety: the pid belongs to our own child, which has not been
            // reaped yet, so it cannot have been recycled.
            let rc = unsafe { libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            self.kill()
        }
    }

    fn kill(&mut self) -> Result<()> {
        if self.has_exited()? {
            return Ok(());
        }
        self.child.kill()?;
        self.child.wait()?;
        Ok(())
    }
}

/// Launches `<exe> [--config <path>] worker <task id>`.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    exe: PathBuf,
    config: Option<PathBuf>,
}

impl CommandLauncher {
    pub fn new(exe: impl Into<PathBuf>, config: Option<PathBuf>) -> Self {
        Self {
            exe: exe.into(),
            config,
        }
    }

    /// Re-launch the running executable as the worker.
    pub fn current_exe(config: Option<PathBuf>) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, config))
    }

    pub fn command(&self, task_id: i64) -> Command {
        let mut cmd = Command::new(&self.exe);
        if let Some(config) = &self.config {
            cmd.arg("--config").arg(config);
        }
        cmd.arg("worker").arg(task_id.to_string());
        // Crash logs include the backtrace of a failing task's error.
        if std::env::var_os("RUST_LIB_BACKTRACE").is_none() {
            cmd.env("RUST_LIB_BACKTRACE", "1");
        }
        cmd
    }
}

impl WorkerLauncher for CommandLauncher {
    fn launch(&mut self, task: &Task) -> Result<Box<dyn WorkerProcess>> {
        let child = self.command(task.id).spawn().map_err(|e| {
            SchedulerError::Spawn(format!("{} worker {}: {e}", self.exe.display(), task.id))
        })?;
        Ok(Box::new(ChildProcess::new(child)))
    }
}

/// What one reconciliation pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<i64>,
    pub stopped: Vec<i64>,
    pub reaped: Vec<i64>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.reaped.is_empty()
    }
}

struct Tracked {
    name: String,
    process: Box<dyn WorkerProcess>,
}

pub struct Monitor {
    store: Store,
    launcher: Box<dyn WorkerLauncher>,
    environment: String,
    tick: Duration,
    workers: HashMap<i64, Tracked>,
    /// Terminated but not yet reaped.
    stopping: Vec<Tracked>,
}

impl Monitor {
    pub fn new(
        store: Store,
        launcher: Box<dyn WorkerLauncher>,
        environment: impl Into<String>,
        tick: Duration,
    ) -> Self {
        Self {
            store,
            launcher,
            environment: environment.into(),
            tick,
            workers: HashMap::new(),
            stopping: Vec::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Task ids with a live tracked worker, ascending.
    pub fn tracked(&self) -> Vec<i64> {
        let mut ids: Vec<_> = self.workers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn worker_pid(&self, task_id: i64) -> Option<u32> {
        self.workers.get(&task_id).map(|w| w.process.id())
    }

    /// One pass: reap dead workers, start missing ones, stop the ones whose
    /// task is gone or disabled. Spawn failures are logged and retried on
    /// the next pass.
    pub fn reconcile(&mut self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let mut exited = Vec::new();
        for (task_id, worker) in self.workers.iter_mut() {
            match worker.process.has_exited() {
                Ok(false) => {}
                Ok(true) => exited.push(*task_id),
                Err(e) => {
                    warn!(task_id, pid = worker.process.id(), error = %e, "cannot poll worker, dropping it");
                    exited.push(*task_id);
                }
            }
        }
        for task_id in exited {
            if let Some(worker) = self.workers.remove(&task_id) {
                info!(task_id, task = %worker.name, pid = worker.process.id(), "worker exited");
            }
            report.reaped.push(task_id);
        }
        report.reaped.sort_unstable();
        self.stopping
            .retain_mut(|w| !w.process.has_exited().unwrap_or(true));

        let mut enabled = self.store.enabled_tasks(&self.environment)?;
        enabled.sort_by_key(|t| t.id);

        for task in &enabled {
            if self.workers.contains_key(&task.id) {
                continue;
            }
            match self.launcher.launch(task) {
                Ok(process) => {
                    info!(task_id = task.id, task = %task, pid = process.id(), "Starting");
                    self.workers.insert(
                        task.id,
                        Tracked {
                            name: task.name.clone(),
                            process,
                        },
                    );
                    report.started.push(task.id);
                }
                Err(e) => error!(task_id = task.id, task = %task, error = %e, "failed to start worker"),
            }
        }

        let wanted: HashSet<i64> = enabled.iter().map(|t| t.id).collect();
        let mut unwanted: Vec<i64> = self
            .workers
            .keys()
            .filter(|id| !wanted.contains(id))
            .copied()
            .collect();
        unwanted.sort_unstable();
        for task_id in unwanted {
            if let Some(mut worker) = self.workers.remove(&task_id) {
                info!(task_id, task = %worker.name, pid = worker.process.id(), "Removed");
                if let Err(e) = worker.process.terminate() {
                    warn!(task_id, error = %e, "failed to terminate worker");
                }
                self.stopping.push(worker);
                report.stopped.push(task_id);
            }
        }

        Ok(report)
    }

    /// Forcefully stop every child, tracked or still stopping.
    pub fn kill_all(&mut self) {
        for (task_id, mut worker) in self.workers.drain() {
            info!(task_id, task = %worker.name, pid = worker.process.id(), "Killed");
            if let Err(e) = worker.process.kill() {
                warn!(task_id, error = %e, "failed to kill worker");
            }
        }
        for mut worker in self.stopping.drain(..) {
            if let Err(e) = worker.process.kill() {
                warn!(task = %worker.name, error = %e, "failed to kill stopping worker");
            }
        }
    }

    /// Reconcile every tick until `shutdown` flips to true, then kill all
    /// workers.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(environment = %self.environment, "Monitor started");

        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile() {
                        error!("monitor reconcile error: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutting down");
                        break;
                    }
                }
            }
        }

        self.kill_all();
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if !self.workers.is_empty() || !self.stopping.is_empty() {
            self.kill_all();
        }
    }
}
