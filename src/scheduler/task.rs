//! Task definitions for the queue.
//!
//! This module defines the core types stored in the queue:
//!
//! - `Task`: a persisted unit of work and its full row state
//! - `NewTask`: builder for enqueuing work
//! - `TaskStatus`: the task state machine
//! - `TaskEvent` / `TaskLogEntry`: the append-only audit trail

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default maximum number of attempts before a task is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default priority for tasks (0 is normal; lower values are more urgent).
pub const DEFAULT_PRIORITY: i32 = 0;

/// Error returned when parsing a status or event string from the database.
#[derive(Debug, Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    /// Which enum failed to parse ("status" or "event").
    pub kind: &'static str,
    /// The offending string.
    pub value: String,
}

/// Status of a task in the queue.
///
/// Exactly one of {queued-and-unlocked, leased-with-live-lease, terminal}
/// holds for a row at any instant. A `Leased` row whose lease has expired is
/// logically queued again and claimable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Queued,
    /// Claimed by a worker, lease running.
    Leased,
    /// Completed successfully (terminal).
    Succeeded,
    /// Failed or cancelled (terminal).
    Failed,
    /// Exhausted retries or failed permanently (terminal).
    Dead,
}

impl TaskStatus {
    /// Returns whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Dead
        )
    }

    /// The string form stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Leased => "leased",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Dead => "dead",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "leased" => Ok(TaskStatus::Leased),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "dead" => Ok(TaskStatus::Dead),
            other => Err(ParseEnumError {
                kind: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// A persisted task row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Monotonic surrogate key assigned by the store.
    pub id: i64,
    /// Worker capability required to process this task.
    pub task_type: String,
    /// Opaque JSON payload handed to the worker.
    pub params: serde_json::Value,
    /// Current status.
    pub status: TaskStatus,
    /// Lower values are served first by the Priority strategy.
    pub priority: i32,
    /// Number of reported failures so far.
    pub attempts: u32,
    /// Attempt budget before dead-lettering.
    pub max_attempts: u32,
    /// The task is unclaimable before this instant.
    pub run_after: DateTime<Utc>,
    /// Lease expiry; past this instant a leased task is claimable again.
    pub lease_until: Option<DateTime<Utc>>,
    /// Worker currently holding the lease.
    pub locked_by: Option<String>,
    /// Optional unique key preventing duplicate enqueue.
    pub idempotency_key: Option<String>,
    /// Result payload recorded on success.
    pub result: Option<serde_json::Value>,
    /// Error context from the most recent failure.
    pub last_error: Option<String>,
    /// When the task was enqueued.
    pub created_at: DateTime<Utc>,
    /// When the task reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Returns whether the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns whether the lease has expired relative to `now`.
    ///
    /// Only meaningful for `Leased` tasks; other statuses return false.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Leased
            && self.lease_until.is_some_and(|until| until <= now)
    }

    /// Returns the number of failures left before dead-lettering.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

/// Builder for a task to be enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    /// Worker capability required.
    pub task_type: String,
    /// Opaque JSON payload.
    pub params: serde_json::Value,
    /// Scheduling priority (lower = more urgent).
    pub priority: i32,
    /// Attempt budget.
    pub max_attempts: u32,
    /// Earliest claimable instant; `None` means immediately.
    #[serde(default)]
    pub run_after: Option<DateTime<Utc>>,
    /// Optional deduplication key.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl NewTask {
    /// Creates a new task with default priority and attempt budget.
    pub fn new(task_type: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            params,
            priority: DEFAULT_PRIORITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            run_after: None,
            idempotency_key: None,
        }
    }

    /// Sets the priority. Lower values are more urgent.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delays the task until the given instant.
    pub fn with_run_after(mut self, run_after: DateTime<Utc>) -> Self {
        self.run_after = Some(run_after);
        self
    }

    /// Sets the deduplication key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Events recorded in the append-only task log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskEvent {
    /// A worker leased the task.
    Claimed,
    /// The task completed successfully.
    Succeeded,
    /// A processing attempt failed.
    Failed,
    /// The task was requeued for another attempt.
    Retried,
    /// The task was moved to the dead-letter state.
    DeadLettered,
}

impl TaskEvent {
    /// The string form stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskEvent::Claimed => "claimed",
            TaskEvent::Succeeded => "succeeded",
            TaskEvent::Failed => "failed",
            TaskEvent::Retried => "retried",
            TaskEvent::DeadLettered => "dead-lettered",
        }
    }
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskEvent {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claimed" => Ok(TaskEvent::Claimed),
            "succeeded" => Ok(TaskEvent::Succeeded),
            "failed" => Ok(TaskEvent::Failed),
            "retried" => Ok(TaskEvent::Retried),
            "dead-lettered" => Ok(TaskEvent::DeadLettered),
            other => Err(ParseEnumError {
                kind: "event",
                value: other.to_string(),
            }),
        }
    }
}

/// One entry in a task's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    /// Log row id.
    pub id: i64,
    /// Task this entry belongs to.
    pub task_id: i64,
    /// What happened.
    pub event: TaskEvent,
    /// Free-form context (error text, worker id, backoff).
    pub detail: Option<String>,
    /// When the entry was recorded.
    pub created_at: DateTime<Utc>,
}

/// Registered worker process as seen through the registry table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Stable identifier for the worker process.
    pub worker_id: String,
    /// Task types the worker can process.
    pub capabilities: Vec<String>,
    /// Optional placement tag.
    pub region: Option<String>,
    /// Last heartbeat received.
    pub last_heartbeat: DateTime<Utc>,
    /// When the worker registered.
    pub started_at: DateTime<Utc>,
}

impl WorkerInfo {
    /// Returns whether the worker's heartbeat is older than `threshold`.
    pub fn is_dead(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        now - self.last_heartbeat > threshold
    }
}
