//! The per-task worker loop.
//!
//! One worker process owns one task. It waits out a predecessor that is
//! shutting down, takes the lease, then alternates between heartbeating,
//! executing due windows and sleeping until the lease is lost or a shutdown
//! command arrives. Every way out ends the process with
//! [`SHUTDOWN_EXIT_CODE`].

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use norn_core::config::{SchedulerConfig, SHUTDOWN_EXIT_CODE};
use tracing::{error, info, warn};

use crate::{
    clock::Clock,
    error::{Result, SchedulerError},
    lease::{LeaseSettings, TaskHandle},
    logger::{write_failure, Logger, Tee},
    registry::TaskRegistry,
    store::Store,
    types::{Log, NewTask, Task},
};

/// Interval given to tasks created implicitly by a manual run.
const MANUAL_RUN_INTERVAL_DAYS: i64 = 9_999;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub lease: LeaseSettings,
    pub keep_logs: usize,
    /// Missed windows are only reported for intervals longer than this.
    pub interval_warning: Duration,
    /// Upper bound on a single idle sleep, so shutdown commands are noticed
    /// without waiting for the next execution.
    pub idle_poll: Duration,
    /// Exit instead of sleeping when the next execution is further away.
    pub max_idle_sleep: Option<Duration>,
}

impl From<&SchedulerConfig> for WorkerSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            lease: LeaseSettings::from(config),
            keep_logs: config.keep_logs,
            interval_warning: config.interval_warning(),
            idle_poll: config.idle_poll(),
            max_idle_sleep: config.max_idle_sleep(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Init,
    WaitingForPredecessor,
    Owning,
    Executing,
    Idle,
    Terminated,
}

/// Why a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Lease lost, shutdown command received, or the function asked to stop.
    Shutdown { reason: String },
    /// The task function failed; the failure is in the execution log.
    Crashed { message: String },
    /// Next execution too far away; lease released for a later worker.
    Idle,
}

impl WorkerExit {
    /// Process exit code. The monitor restarts workers regardless of how
    /// they ended, so every exit uses the same code.
    pub fn code(&self) -> i32 {
        SHUTDOWN_EXIT_CODE
    }
}

pub struct Worker<'s> {
    handle: TaskHandle<'s>,
    settings: WorkerSettings,
    mirror: Box<dyn Write + Send>,
    state: WorkerState,
    executions: u64,
}

impl<'s> Worker<'s> {
    pub fn new(
        store: &'s Store,
        registry: Arc<TaskRegistry>,
        clock: Arc<dyn Clock>,
        settings: WorkerSettings,
        task: Task,
    ) -> Self {
        let handle = TaskHandle::new(store, registry, clock, settings.lease.clone(), task);
        Self {
            handle,
            settings,
            mirror: Box::new(std::io::stdout()),
            state: WorkerState::Init,
            executions: 0,
        }
    }

    /// Load task `task_id` from `environment` and build a worker for it.
    pub fn load(
        store: &'s Store,
        registry: Arc<TaskRegistry>,
        clock: Arc<dyn Clock>,
        settings: WorkerSettings,
        task_id: i64,
        environment: &str,
    ) -> Result<Self> {
        let task = store.get_task_in_env(task_id, environment)?;
        Ok(Self::new(store, registry, clock, settings, task))
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.handle = self.handle.with_pid(pid);
        self
    }

    /// Where captured output is echoed besides the log (stdout by default).
    pub fn with_mirror(mut self, mirror: Box<dyn Write + Send>) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn task(&self) -> &Task {
        self.handle.task()
    }

    /// Run until the worker has a reason to stop. `Err` is reserved for
    /// store failures outside any execution.
    pub fn run(&mut self) -> Result<WorkerExit> {
        let task_id = self.handle.task().id;
        info!(task_id, task = %self.handle.task(), pid = self.handle.pid(), "worker starting");

        self.state = WorkerState::WaitingForPredecessor;
        self.handle.refresh()?;
        self.handle.wait_for_previous_shutdown()?;
        self.handle.start()?;
        self.state = WorkerState::Owning;

        let exit = loop {
            if let Some(exit) = self.step()? {
                break exit;
            }
        };

        self.state = WorkerState::Terminated;
        info!(task_id, executions = self.executions, exit = ?exit, "worker stopped");
        Ok(exit)
    }

    /// One pass of the loop: heartbeat, then execute or sleep.
    fn step(&mut self) -> Result<Option<WorkerExit>> {
        if let Err(e) = self.handle.heartbeat() {
            return match e {
                SchedulerError::ShuttingDown(reason) => Ok(Some(WorkerExit::Shutdown { reason })),
                other => {
                    error!(task_id = self.handle.task().id, error = %other, "heartbeat failed");
                    Ok(Some(WorkerExit::Crashed {
                        message: other.to_string(),
                    }))
                }
            };
        }

        let count = match self.handle.calculate_number_of_execution_slots_passed() {
            Ok(count) => count,
            Err(e @ SchedulerError::InvalidInterval(_)) => {
                error!(task_id = self.handle.task().id, error = %e, "cannot schedule task");
                return Ok(Some(WorkerExit::Crashed {
                    message: e.to_string(),
                }));
            }
            Err(e) => return Err(e),
        };
        if count > 0 {
            return self.execute_due(count);
        }

        let wait = self
            .handle
            .time_to_next_execution()
            .to_std()
            .unwrap_or(Duration::ZERO);
        if let Some(max) = self.settings.max_idle_sleep {
            if wait > max {
                self.state = WorkerState::Idle;
                self.handle.release()?;
                info!(
                    task_id = self.handle.task().id,
                    wait_secs = wait.as_secs(),
                    "next execution too far away, releasing lease"
                );
                return Ok(Some(WorkerExit::Idle));
            }
        }

        self.state = WorkerState::Idle;
        self.handle.clock().sleep(wait.min(self.settings.idle_poll));
        self.state = WorkerState::Owning;
        Ok(None)
    }

    fn execute_due(&mut self, count: u64) -> Result<Option<WorkerExit>> {
        self.state = WorkerState::Executing;
        let task_id = self.handle.task().id;
        let now = self.handle.clock().now();
        let mut logger = Logger::open(
            self.handle.store(),
            self.handle.task(),
            self.settings.keep_logs,
            now,
        )?;

        let interval_warning = chrono::Duration::from_std(self.settings.interval_warning)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        if count > 1 && self.handle.task().interval > interval_warning {
            let missed = count - 1;
            let mut out = Tee::new(&mut logger, &mut *self.mirror);
            writeln!(out, "WARNING Missed {missed} execution windows")?;
            warn!(task_id, missed, "missed execution windows");
        }

        // Lines written inside an execution transaction are stored once it ends.
        if self.handle.wraps_execution() {
            logger.hold();
        }
        self.executions += 1;
        let outcome = self
            .handle
            .execute(&mut Tee::new(&mut logger, &mut *self.mirror));
        logger.release()?;

        let exit = match outcome {
            Ok(()) => None,
            Err(e) => match SchedulerError::shutdown_reason(&e) {
                Some(reason) => Some(WorkerExit::Shutdown {
                    reason: reason.to_string(),
                }),
                None => {
                    write_failure(&mut Tee::new(&mut logger, &mut *self.mirror), &e)?;
                    error!(task_id, error = %e, "scheduler worker crashed");
                    Some(WorkerExit::Crashed {
                        message: e.to_string(),
                    })
                }
            },
        };

        logger.close()?;
        if exit.is_none() {
            self.state = WorkerState::Owning;
        }
        Ok(exit)
    }
}

/// Result of [`run_once`].
#[derive(Debug)]
pub struct ManualRun {
    pub task: Task,
    pub log: Log,
    /// Failure message, already written to the log.
    pub error: Option<String>,
}

/// Execute `function` once, outside the lease protocol, capturing its
/// output in the task's log like a scheduled run. The task row is created
/// disabled if it does not exist yet.
pub fn run_once(
    store: &Store,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    environment: &str,
    keep_logs: usize,
    function: &str,
    mirror: &mut dyn Write,
) -> Result<ManualRun> {
    let registered = registry.resolve(function)?;
    let task = store.get_or_create_task(
        &NewTask::new(
            registered.name.clone(),
            function,
            chrono::Duration::days(MANUAL_RUN_INTERVAL_DAYS),
            environment,
        )
        .disabled(true),
    )?;

    let now = clock.now();
    let mut logger = Logger::open(store, &task, keep_logs, now)?;
    let log = logger.log().clone();
    let mut handle = TaskHandle::new(store, registry, clock, LeaseSettings::default(), task);

    if handle.wraps_execution() {
        logger.hold();
    }
    let outcome = handle.execute_unleased(&mut Tee::new(&mut logger, &mut *mirror));
    logger.release()?;
    let error = match outcome {
        Ok(()) => None,
        Err(e) => {
            write_failure(&mut Tee::new(&mut logger, &mut *mirror), &e)?;
            Some(e.to_string())
        }
    };
    logger.close()?;

    info!(task_id = log.task_id, log_id = log.id, ok = error.is_none(), "manual run finished");
    Ok(ManualRun {
        task: handle.task().clone(),
        log,
        error,
    })
}
