//! Lease protocol and interval arithmetic for a single task row.
//!
//! Ownership is proven purely through the store: `start()` writes our pid
//! into the row and every `heartbeat()` re-reads it. A process that finds
//! another pid (or none) has lost the race and must exit; one that finds a
//! `shutdown_command` clears the lease and exits. There is no lock service
//! and no row lock; the loser of a race notices within one heartbeat.

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once};
use std::time::Duration;

use norn_core::config::SchedulerConfig;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    error::{Result, SchedulerError, TaskPanic},
    registry::{RegisteredTask, TaskContext, TaskRegistry},
    store::{interval_micros, Store},
    types::Task,
};

/// Heartbeats closer together than this skip the lease check entirely.
const HEARTBEAT_MIN_GAP_MS: i64 = 1_000;
/// Poll period while waiting for a predecessor to vacate the lease.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

static PANIC_HOOK: Once = Once::new();

thread_local! {
    /// Location and stack of the latest panic on this thread.
    static LAST_PANIC: RefCell<Option<(Option<String>, Backtrace)>> = const { RefCell::new(None) };
}

#[derive(Debug, Clone)]
pub struct LeaseSettings {
    pub shutdown_timeout: Duration,
    pub heartbeat_warning: Duration,
    pub resolution_backoff: Duration,
}

impl From<&SchedulerConfig> for LeaseSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            shutdown_timeout: config.shutdown_timeout(),
            heartbeat_warning: config.heartbeat_warning(),
            resolution_backoff: config.resolution_backoff(),
        }
    }
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

/// How [`TaskHandle::wait_for_previous_shutdown`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredecessorWait {
    /// No predecessor was shutting down, or it released the lease in time.
    Vacated,
    /// The predecessor still held the lease when the shutdown timeout hit.
    TimedOut,
}

/// A task row bound to the calling process.
pub struct TaskHandle<'s> {
    store: &'s Store,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    settings: LeaseSettings,
    pid: u32,
    task: Task,
    /// Resolved once per handle; a worker handle lives as long as its process.
    resolved: Option<Arc<RegisteredTask>>,
}

impl<'s> TaskHandle<'s> {
    pub fn new(
        store: &'s Store,
        registry: Arc<TaskRegistry>,
        clock: Arc<dyn Clock>,
        settings: LeaseSettings,
        task: Task,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            settings,
            pid: std::process::id(),
            task,
            resolved: None,
        }
    }

    /// Act as process `pid` instead of the current process.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn store(&self) -> &'s Store {
        self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Reload the whole row from the store.
    pub fn refresh(&mut self) -> Result<()> {
        self.task = self.store.get_task(self.task.id)?;
        Ok(())
    }

    /// Take the lease: our pid, no pending shutdown, a fresh run id.
    pub fn start(&mut self) -> Result<()> {
        let run_id = Uuid::new_v4();
        self.store.save_lease(self.task.id, self.pid, run_id)?;
        self.task.pid = Some(self.pid);
        self.task.shutdown_command = None;
        self.task.current_run_id = Some(run_id);
        info!(task_id = self.task.id, pid = self.pid, %run_id, "lease acquired");
        Ok(())
    }

    /// Re-read the row and fail with `ShuttingDown` unless we still own it
    /// and nobody asked us to stop. A pending shutdown command is consumed:
    /// the lease is cleared before returning the error.
    pub fn check_lock(&mut self) -> Result<()> {
        let current = match self.store.get_task(self.task.id) {
            Ok(task) => task,
            Err(SchedulerError::TaskNotFound { .. }) => {
                return Err(SchedulerError::shutting_down("PID changed"))
            }
            Err(e) => return Err(e),
        };

        if current.pid != Some(self.pid) {
            debug!(
                task_id = self.task.id,
                ours = self.pid,
                stored = ?current.pid,
                "lease lost"
            );
            return Err(SchedulerError::shutting_down("PID changed"));
        }

        if current.shutdown_command.is_some() {
            self.store.clear_lease(self.task.id)?;
            self.task.pid = None;
            self.task.shutdown_command = None;
            self.task.current_run_id = None;
            info!(task_id = self.task.id, "lease released on shutdown command");
            return Err(SchedulerError::shutting_down("Got shutdown command"));
        }

        Ok(())
    }

    /// Cheap liveness proof, safe to call in tight loops: the lease is only
    /// re-checked (and `last_checked` written) once more than a second has
    /// passed since the previous check.
    pub fn heartbeat(&mut self) -> Result<()> {
        let now = self.clock.now();
        let gap = self.task.last_checked.map(|last| now - last);

        if let Some(gap) = gap {
            if gap > to_chrono(self.settings.heartbeat_warning) {
                warn!(
                    task_id = self.task.id,
                    gap_ms = gap.num_milliseconds(),
                    "heartbeat not called often enough"
                );
            }
        }

        let due = gap.map_or(true, |gap| gap > chrono::Duration::milliseconds(HEARTBEAT_MIN_GAP_MS));
        if due {
            self.check_lock()?;
            self.task.last_checked = Some(now);
            self.store.save_last_checked(self.task.id, now)?;
        }
        Ok(())
    }

    /// Block while a previous owner is still honouring a shutdown command,
    /// but no longer than the configured shutdown timeout.
    pub fn wait_for_previous_shutdown(&mut self) -> Result<PredecessorWait> {
        let timeout = to_chrono(self.settings.shutdown_timeout);
        while self.predecessor_shutting_down(timeout) {
            self.clock.sleep(SHUTDOWN_POLL);
            self.refresh()?;
        }

        if self.task.pid.is_some() && self.task.shutdown_command.is_some() {
            warn!(
                task_id = self.task.id,
                predecessor = ?self.task.pid,
                "shutdown timeout hit, taking over"
            );
            return Ok(PredecessorWait::TimedOut);
        }
        Ok(PredecessorWait::Vacated)
    }

    fn predecessor_shutting_down(&self, timeout: chrono::Duration) -> bool {
        match (self.task.pid, self.task.shutdown_command) {
            (Some(_), Some(requested)) => self.clock.now() < requested + timeout,
            _ => false,
        }
    }

    /// Number of execution windows that have opened since the last check,
    /// advancing (and persisting) `next_execution_time` past now.
    ///
    /// 0 means not due yet; 1 means exactly on schedule; more means windows
    /// were missed. A task that was never scheduled counts as due once and
    /// gets its first `next_execution_time` one interval from now.
    pub fn calculate_number_of_execution_slots_passed(&mut self) -> Result<u64> {
        let interval_us = interval_micros(self.task.interval)?;
        let now = self.clock.now();

        let Some(next) = self.task.next_execution_time else {
            let next = now
                .checked_add_signed(self.task.interval)
                .ok_or_else(|| out_of_range(self.task.interval))?;
            self.store.save_next_execution_time(self.task.id, next)?;
            self.task.next_execution_time = Some(next);
            return Ok(1);
        };

        if now < next {
            return Ok(0);
        }

        // Same result as stepping one interval at a time while now >= next.
        let overdue_us = (now - next).num_microseconds().unwrap_or(i64::MAX);
        let count = overdue_us / interval_us + 1;
        let advanced = next
            .checked_add_signed(chrono::Duration::microseconds(count.saturating_mul(interval_us)))
            .ok_or_else(|| out_of_range(self.task.interval))?;

        self.store.save_next_execution_time(self.task.id, advanced)?;
        self.task.next_execution_time = Some(advanced);
        Ok(count as u64)
    }

    /// Time left until the task is due; zero (due now) when never scheduled.
    pub fn time_to_next_execution(&self) -> chrono::Duration {
        match self.task.next_execution_time {
            Some(next) => next - self.clock.now(),
            None => chrono::Duration::zero(),
        }
    }

    /// Run the task's function once with a heartbeat bound to this lease.
    ///
    /// Errors returned by the function propagate unchanged; a panic is
    /// turned into an error so one bad task cannot abort the worker without
    /// leaving a trace in its log.
    pub fn execute(&mut self, out: &mut dyn Write) -> anyhow::Result<()> {
        self.invoke(out, true)
    }

    /// Run the function without holding the lease (manual runs). The
    /// heartbeat handed to the function always succeeds.
    pub fn execute_unleased(&mut self, out: &mut dyn Write) -> anyhow::Result<()> {
        self.invoke(out, false)
    }

    /// Whether [`TaskHandle::execute`] will run the function inside a
    /// transaction on the store's connection.
    pub fn wraps_execution(&self) -> bool {
        if !self.store.wraps_executions() {
            return false;
        }
        match &self.resolved {
            Some(resolved) => resolved.transactional,
            None => self
                .registry
                .resolve(&self.task.function)
                .is_ok_and(|resolved| resolved.transactional),
        }
    }

    fn invoke(&mut self, out: &mut dyn Write, leased: bool) -> anyhow::Result<()> {
        let registered = self.resolve()?;
        let store = self.store;
        let task_id = self.task.id;
        install_panic_hook();

        let tx = if registered.transactional && store.wraps_executions() {
            Some(store.connection().unchecked_transaction()?)
        } else {
            None
        };

        let outcome = {
            let mut heartbeat = || -> Result<()> {
                if leased {
                    self.heartbeat()
                } else {
                    Ok(())
                }
            };
            let mut ctx = TaskContext::new(task_id, store.connection(), out, &mut heartbeat);
            panic::catch_unwind(AssertUnwindSafe(|| registered.call(&mut ctx)))
                .unwrap_or_else(|payload| Err(task_panic(&payload).into()))
        };

        if let Some(tx) = tx {
            if outcome.is_ok() {
                tx.commit()?;
            } else {
                tx.rollback()?;
            }
        }
        outcome
    }

    fn resolve(&mut self) -> Result<Arc<RegisteredTask>> {
        if let Some(resolved) = &self.resolved {
            return Ok(Arc::clone(resolved));
        }
        match self.registry.resolve(&self.task.function) {
            Ok(resolved) => {
                self.resolved = Some(Arc::clone(&resolved));
                Ok(resolved)
            }
            Err(e) => {
                error!(
                    task_id = self.task.id,
                    function = %self.task.function,
                    "Failed to execute function: {e}"
                );
                // The monitor respawns us immediately; don't turn a bad
                // registry key into a hot crash loop.
                self.clock.sleep(self.settings.resolution_backoff);
                Err(SchedulerError::shutting_down("Failed to execute function"))
            }
        }
    }

    /// Give the lease back if we still hold it.
    pub fn release(&mut self) -> Result<bool> {
        let released = self.store.release_lease(self.task.id, self.pid)?;
        if released {
            self.task.pid = None;
            self.task.current_run_id = None;
        }
        Ok(released)
    }

    pub fn disable(&mut self) -> Result<()> {
        self.store.set_disabled(self.task.id, true)?;
        self.task.disabled = true;
        Ok(())
    }

    pub fn enable(&mut self) -> Result<()> {
        self.store.set_disabled(self.task.id, false)?;
        self.task.disabled = false;
        Ok(())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn out_of_range(interval: chrono::Duration) -> SchedulerError {
    SchedulerError::InvalidInterval(format!("{interval} moves the next execution out of range"))
}

/// Chain a hook in front of the current one that remembers where each
/// panic happened, so a caught panic can still be logged with its trace.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let location = info.location().map(|l| l.to_string());
            let _ = LAST_PANIC.try_with(|last| {
                *last.borrow_mut() = Some((location, Backtrace::force_capture()));
            });
            previous(info);
        }));
    });
}

fn task_panic(payload: &Box<dyn std::any::Any + Send>) -> TaskPanic {
    let (location, backtrace) = LAST_PANIC
        .with(|last| last.borrow_mut().take())
        .unwrap_or_else(|| (None, Backtrace::disabled()));
    TaskPanic {
        message: panic_message(payload),
        location,
        backtrace,
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
