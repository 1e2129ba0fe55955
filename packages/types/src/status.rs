use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::task::{TaskId, TaskStatus};

/// Error taxonomy shared by every component and carried in status reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Identity or worker-pool authorization failure. Never retried.
    AuthDenied,
    /// Credential request exceeds the role policy. Never retried.
    ScopeDenied,
    /// Lease expired or already settled before the receipt was used.
    StaleReceipt,
    /// Worker-reported task failure, retried up to `max_attempts`.
    ExecutionError,
    /// Pre-signed URL used after its expiry.
    AccessExpired,
    /// Pre-signed URL used for another object or operation, or tampered.
    AccessDenied,
    /// Retry budget exhausted; surfaced to operators.
    DeadLettered,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthDenied => "auth_denied",
            ErrorKind::ScopeDenied => "scope_denied",
            ErrorKind::StaleReceipt => "stale_receipt",
            ErrorKind::ExecutionError => "execution_error",
            ErrorKind::AccessExpired => "access_expired",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::DeadLettered => "dead_lettered",
        }
    }

    /// Whether queue redelivery may recover from this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::ExecutionError | ErrorKind::StaleReceipt)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last failure recorded on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    pub attempt: u32,
}

/// Payload of the status callback sent to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_locator: Option<String>,
    pub reported_at: DateTime<Utc>,
}

impl StatusReport {
    pub fn new(task_id: TaskId, status: TaskStatus, attempt: u32, at: DateTime<Utc>) -> Self {
        Self {
            task_id,
            status,
            attempt,
            error_kind: None,
            message: None,
            output_locator: None,
            reported_at: at,
        }
    }

    pub fn with_error(mut self, kind: ErrorKind, message: impl Into<String>) -> Self {
        self.error_kind = Some(kind);
        self.message = Some(message.into());
        self
    }

    pub fn with_output(mut self, locator: impl Into<String>) -> Self {
        self.output_locator = Some(locator.into());
        self
    }
}
