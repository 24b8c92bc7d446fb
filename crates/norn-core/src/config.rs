use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Runtime constants shared by the monitor, the workers and the CLI.
pub const KEEP_LOGS: usize = 10;
pub const SHUTDOWN_EXIT_CODE: i32 = 7;
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 10;
pub const HEARTBEAT_WARNING_SECS: u64 = 5;
pub const INTERVAL_WARNING_SECS: u64 = 5;
pub const MONITOR_TICK_MS: u64 = 100;
pub const IDLE_POLL_MS: u64 = 1_000;
pub const RESOLUTION_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_ENVIRONMENT: &str = "default";

/// Top-level config (norn.toml + NORN_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NornConfig {
    /// Logical partition: a monitor or worker only sees tasks of its own
    /// environment. Override with NORN_ENVIRONMENT.
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Default for NornConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Run task functions inside a transaction on the worker connection.
    ///
    /// Off by default: SQLite allows a single writer, so an open write
    /// transaction blocks the logger's own connection until it commits.
    #[serde(default)]
    pub wrap_executions: bool,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            wrap_executions: false,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    /// Create the directory holding the database file if it is missing.
    pub fn ensure_parent_dir(&self) -> crate::error::Result<()> {
        if let Some(parent) = std::path::Path::new(&self.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

/// Timing and retention knobs for workers and the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of execution logs retained per task.
    #[serde(default = "default_keep_logs")]
    pub keep_logs: usize,
    /// How long a new worker waits for a predecessor to honour a shutdown
    /// command before taking the task over anyway.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Gap between heartbeats above which a warning is logged.
    #[serde(default = "default_heartbeat_warning_secs")]
    pub heartbeat_warning_secs: u64,
    /// Missed-window warnings are only emitted for intervals above this.
    #[serde(default = "default_interval_warning_secs")]
    pub interval_warning_secs: u64,
    #[serde(default = "default_monitor_tick_ms")]
    pub monitor_tick_ms: u64,
    /// Longest single sleep of an idle worker between heartbeats.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// When set, a worker whose next run is further away than this exits
    /// instead of sleeping, and the monitor respawns it on its next tick.
    #[serde(default)]
    pub max_idle_sleep_secs: Option<u64>,
    #[serde(default = "default_resolution_backoff_ms")]
    pub resolution_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            keep_logs: KEEP_LOGS,
            shutdown_timeout_secs: SHUTDOWN_TIMEOUT_SECS,
            heartbeat_warning_secs: HEARTBEAT_WARNING_SECS,
            interval_warning_secs: INTERVAL_WARNING_SECS,
            monitor_tick_ms: MONITOR_TICK_MS,
            idle_poll_ms: IDLE_POLL_MS,
            max_idle_sleep_secs: None,
            resolution_backoff_ms: RESOLUTION_BACKOFF_MS,
        }
    }
}

impl SchedulerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn heartbeat_warning(&self) -> Duration {
        Duration::from_secs(self.heartbeat_warning_secs)
    }

    pub fn interval_warning(&self) -> Duration {
        Duration::from_secs(self.interval_warning_secs)
    }

    pub fn monitor_tick(&self) -> Duration {
        Duration::from_millis(self.monitor_tick_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn max_idle_sleep(&self) -> Option<Duration> {
        self.max_idle_sleep_secs.map(Duration::from_secs)
    }

    pub fn resolution_backoff(&self) -> Duration {
        Duration::from_millis(self.resolution_backoff_ms)
    }
}

fn default_environment() -> String {
    DEFAULT_ENVIRONMENT.to_string()
}
fn default_keep_logs() -> usize {
    KEEP_LOGS
}
fn default_shutdown_timeout_secs() -> u64 {
    SHUTDOWN_TIMEOUT_SECS
}
fn default_heartbeat_warning_secs() -> u64 {
    HEARTBEAT_WARNING_SECS
}
fn default_interval_warning_secs() -> u64 {
    INTERVAL_WARNING_SECS
}
fn default_monitor_tick_ms() -> u64 {
    MONITOR_TICK_MS
}
fn default_idle_poll_ms() -> u64 {
    IDLE_POLL_MS
}
fn default_resolution_backoff_ms() -> u64 {
    RESOLUTION_BACKOFF_MS
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.norn/norn.db", home)
}

impl NornConfig {
    /// Load config from a TOML file with NORN_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `NORN_SCHEDULER__KEEP_LOGS=20` or `NORN_DATABASE__PATH=/var/lib/norn.db`.
    /// A missing file is not an error: every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        tracing::debug!(%path, "loading configuration");

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("NORN_").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        let config: NornConfig = figment
            .extract()
            .map_err(|e| crate::error::NornError::Config(e.to_string()))?;

        if config.scheduler.keep_logs == 0 {
            return Err(crate::error::NornError::Config(
                "scheduler.keep_logs must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.norn/norn.toml", home)
}
