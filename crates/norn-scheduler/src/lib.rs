//! `norn-scheduler`: process-per-task interval scheduler on SQLite.
//!
//! # Overview
//!
//! A [`monitor::Monitor`] keeps one worker process alive per enabled task of
//! its environment. Each worker runs a [`worker::Worker`] loop that owns the
//! task through a lease stored in the task row itself: the worker writes its
//! pid, heartbeats by re-reading the row, and exits as soon as the row says
//! someone else owns it or a shutdown was requested.
//!
//! | Module     | Responsibility                                        |
//! |------------|-------------------------------------------------------|
//! | `store`    | SQLite connection, task CRUD, lease-field writes      |
//! | `lease`    | lease protocol and execution-window arithmetic        |
//! | `worker`   | the per-task loop and manual runs                     |
//! | `logger`   | per-execution log capture with retention              |
//! | `registry` | function key → task function                          |
//! | `monitor`  | worker process supervision                            |
//! | `clock`    | injectable time source                                |

pub mod clock;
pub mod db;
pub mod error;
pub mod lease;
pub mod logger;
pub mod monitor;
pub mod registry;
pub mod store;
pub mod types;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, SchedulerError, TaskPanic};
pub use lease::{LeaseSettings, PredecessorWait, TaskHandle};
pub use logger::{Logger, Tee};
pub use monitor::{CommandLauncher, Monitor, ReconcileReport, WorkerLauncher, WorkerProcess};
pub use registry::{RegisteredTask, TaskContext, TaskRegistry};
pub use store::Store;
pub use types::{Log, LogItem, NewTask, Task};
pub use worker::{run_once, ManualRun, Worker, WorkerExit, WorkerSettings, WorkerState};
