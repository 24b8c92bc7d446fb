use chrono::{DateTime, Duration, Utc};
use serde::{Serialize, Serializer};
use uuid::Uuid;

/// A scheduled task row, including its lease fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    /// INTEGER primary key; the identifier passed to `norn worker`.
    pub id: i64,
    /// Human-readable label.
    pub name: String,
    /// Registry key of the function this task executes (unique).
    pub function: String,
    /// Process id of the owning worker. `None` means unowned.
    pub pid: Option<u32>,
    /// Set by an external actor to ask the owner to release the lease.
    pub shutdown_command: Option<DateTime<Utc>>,
    /// When the task is next due. Set on the first due check when unset.
    pub next_execution_time: Option<DateTime<Utc>>,
    /// Heartbeat freshness marker written by the owning worker.
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(rename = "interval_ms", serialize_with = "serialize_interval")]
    pub interval: Duration,
    pub disabled: bool,
    /// Identifies the in-progress run of the current lease holder.
    pub current_run_id: Option<Uuid>,
    /// Logical partition this task belongs to.
    pub environment: String,
}

impl Task {
    /// A task is owned while a worker holds its lease.
    pub fn is_owned(&self) -> bool {
        self.pid.is_some()
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Fields needed to register a new task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub function: String,
    pub interval: Duration,
    pub environment: String,
    pub disabled: bool,
    pub next_execution_time: Option<DateTime<Utc>>,
}

impl NewTask {
    /// An enabled task with no schedule yet: it fires on the first due check.
    pub fn new(
        name: impl Into<String>,
        function: impl Into<String>,
        interval: Duration,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            function: function.into(),
            interval,
            environment: environment.into(),
            disabled: false,
            next_execution_time: None,
        }
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn starting_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_execution_time = Some(at);
        self
    }
}

/// One execution attempt of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Log {
    pub id: i64,
    pub execution_time: DateTime<Utc>,
    pub task_id: i64,
    pub run_id: Uuid,
}

/// One captured, non-blank output line of an execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogItem {
    pub id: i64,
    pub log_id: i64,
    pub data: String,
}

fn serialize_interval<S: Serializer>(interval: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_i64(interval.num_milliseconds())
}
