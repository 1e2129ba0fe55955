use jobplane_types::{
    ErrorKind, TaskId,
    chrono::{DateTime, Utc},
};
use parking_lot::Mutex;
use serde::Serialize;

/// Operator-facing alert. Raised for dead-lettered tasks and for denied
/// worker-pool authorization.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: ErrorKind, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            task_id: None,
            message: message.into(),
            at,
        }
    }

    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: Alert);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    #[tracing::instrument(name = "Raise alert", skip_all, fields(kind = %alert.kind))]
    fn notify(&self, alert: Alert) {
        match &alert.task_id {
            Some(task_id) => tracing::error!(task_id = %task_id, "{}", alert.message),
            None => tracing::error!("{}", alert.message),
        }
        metrics::counter!("jobplane_alerts_total", "kind" => alert.kind.as_str()).increment(1);
    }
}

/// Keeps alerts in memory, for tests and the local runtime.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

impl AlertSink for MemoryAlertSink {
    fn notify(&self, alert: Alert) {
        LogAlertSink.notify(alert.clone());
        self.alerts.lock().push(alert);
    }
}
