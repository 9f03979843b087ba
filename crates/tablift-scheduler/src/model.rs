//! Data model — tasks, executions, and their closed status sets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A recurring collection task definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Row id (0 until stored).
    pub id: i64,
    /// Human-readable name.
    pub name: String,
    /// Cron-like schedule expression (5 or 6 fields). Empty = never fires.
    pub cron_expression: String,
    /// Current status.
    pub status: TaskStatus,
    /// Opaque source descriptor (connection/table details for the generator).
    pub source: serde_json::Value,
    /// Opaque target descriptor (HDFS path/format details for the generator).
    pub target: serde_json::Value,
    /// Per-execution timeout, seconds.
    pub timeout_secs: u64,
    /// Bounded-retry policy: how many early re-fires a Failed execution gets
    /// before waiting for the next natural cron tick. 0 = none.
    pub retry_times: u32,
    /// Minimum seconds between a failure and its retry.
    pub retry_interval_secs: i64,
    /// Last fire instant (when the poller last dispatched this task).
    pub last_fire: Option<DateTime<Utc>>,
    /// Next computed fire instant (lazily maintained bookkeeping).
    pub next_fire: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task in status New.
    pub fn new(name: &str, cron_expression: &str) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: name.to_string(),
            cron_expression: cron_expression.to_string(),
            status: TaskStatus::New,
            source: serde_json::Value::Null,
            target: serde_json::Value::Null,
            timeout_secs: 7200,
            retry_times: 0,
            retry_interval_secs: 60,
            last_fire: None,
            next_fire: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Eligible for scheduling.
    New,
    /// Dispatched; an execution is outstanding.
    Pending,
    /// A worker is running it.
    Running,
    /// Never scheduled.
    Disabled,
    /// Last execution failed; re-armed by the poller at the next fire.
    Error,
}

impl TaskStatus {
    pub fn code(&self) -> &'static str {
        match self {
            TaskStatus::New => "NEW",
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Disabled => "DISABLED",
            TaskStatus::Error => "ERROR",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "NEW" => Some(TaskStatus::New),
            "PENDING" => Some(TaskStatus::Pending),
            "RUNNING" => Some(TaskStatus::Running),
            "DISABLED" => Some(TaskStatus::Disabled),
            "ERROR" => Some(TaskStatus::Error),
            _ => None,
        }
    }
}

/// One attempt to run a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// Row id (0 until stored).
    pub id: i64,
    /// Owning task.
    pub task_id: i64,
    pub start_time: DateTime<Utc>,
    /// Set exactly once, at the terminating transition.
    pub end_time: Option<DateTime<Utc>>,
    /// Derived: end - start, seconds.
    pub duration_secs: Option<i64>,
    pub status: ExecStatus,
    pub trigger_type: TriggerType,
    /// Generated engine-config payload. None = the generator's
    /// missing-dependency sentinel; a worker pre-flight failure.
    pub payload: Option<serde_json::Value>,
    /// Parsed statistics. None until finished, or when the trailer was
    /// unparseable.
    pub stats: Option<ExecStats>,
    pub log_path: Option<String>,
    pub error_message: Option<String>,
}

/// Execution status. Waiting and Running are the outstanding states;
/// Success and Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecStatus {
    Waiting,
    Running,
    Success,
    Failed,
}

impl ExecStatus {
    pub fn code(&self) -> &'static str {
        match self {
            ExecStatus::Waiting => "WAITING",
            ExecStatus::Running => "RUNNING",
            ExecStatus::Success => "SUCCESS",
            ExecStatus::Failed => "FAILED",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "WAITING" => Some(ExecStatus::Waiting),
            "RUNNING" => Some(ExecStatus::Running),
            "SUCCESS" => Some(ExecStatus::Success),
            "FAILED" => Some(ExecStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecStatus::Success | ExecStatus::Failed)
    }
}

/// What caused an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerType {
    Scheduled,
    Manual,
    ManualBatch,
}

impl TriggerType {
    pub fn code(&self) -> &'static str {
        match self {
            TriggerType::Scheduled => "SCHEDULED",
            TriggerType::Manual => "MANUAL",
            TriggerType::ManualBatch => "MANUAL_BATCH",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "SCHEDULED" => Some(TriggerType::Scheduled),
            "MANUAL" => Some(TriggerType::Manual),
            "MANUAL_BATCH" => Some(TriggerType::ManualBatch),
            _ => None,
        }
    }
}

/// Statistics parsed from the engine's output trailer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecStats {
    pub total_records: i64,
    pub success_records: i64,
    pub failed_records: i64,
    /// Not reported by the engine trailer; kept for the record schema.
    pub rejected_records: i64,
    pub bytes_per_sec: i64,
    pub records_per_sec: i64,
}
