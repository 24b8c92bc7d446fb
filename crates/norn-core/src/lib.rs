//! `norn-core`: configuration and constants shared by every norn crate.

pub mod config;
pub mod error;

pub use config::{DatabaseConfig, NornConfig, SchedulerConfig, KEEP_LOGS, SHUTDOWN_EXIT_CODE};
pub use error::{NornError, Result};
