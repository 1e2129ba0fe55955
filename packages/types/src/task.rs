use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::status::TaskError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(crate::create_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle of a task.
///
/// Within one delivery attempt a status only ever moves forward:
/// `queued → claimed → assigned → running → {succeeded | failed | expired}`.
/// `cancelled` is reachable from `queued` only. Re-arming a task for
/// redelivery is reserved to the queue (see [`Task::requeue`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Claimed,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Expired,
    Cancelled,
}

impl TaskStatus {
    fn rank(&self) -> u8 {
        match self {
            TaskStatus::Queued => 0,
            TaskStatus::Claimed => 1,
            TaskStatus::Assigned => 2,
            TaskStatus::Running => 3,
            TaskStatus::Succeeded
            | TaskStatus::Failed
            | TaskStatus::Expired
            | TaskStatus::Cancelled => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 4
    }

    pub fn can_advance_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == TaskStatus::Cancelled {
            return *self == TaskStatus::Queued;
        }
        next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Expired => "expired",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A submission as accepted by the control plane, before the queue assigns
/// an identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub pipeline_ref: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub input_locator: String,
    pub output_locator: String,
    #[serde(default)]
    pub priority: i32,
    /// Subject that submitted the task
    pub owner: String,
    /// Caller-supplied key making `enqueue` idempotent within the retention window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    /// Hint used to extend the lease of long-running tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_duration_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub pipeline_ref: String,
    pub parameters: serde_json::Value,
    pub input_locator: String,
    pub output_locator: String,
    pub priority: i32,
    pub owner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_duration_secs: Option<u64>,
    pub enqueue_time: DateTime<Utc>,
    pub attempt_count: u32,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<TaskError>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn from_submission(task_id: TaskId, new: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            pipeline_ref: new.pipeline_ref,
            parameters: new.parameters,
            input_locator: new.input_locator,
            output_locator: new.output_locator,
            priority: new.priority,
            owner: new.owner,
            dedup_key: new.dedup_key,
            expected_duration_secs: new.expected_duration_secs,
            enqueue_time: now,
            attempt_count: 0,
            status: TaskStatus::Queued,
            last_error: None,
            updated_at: now,
        }
    }

    /// Move forward in the lifecycle. Backward or post-terminal transitions
    /// are refused and leave the task untouched.
    pub fn advance(&mut self, next: TaskStatus, now: DateTime<Utc>) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = now;
        true
    }

    /// Re-arm a non-terminal task for another delivery attempt.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Queued;
        self.updated_at = now;
        true
    }
}
