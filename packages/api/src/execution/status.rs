//! Status reporting.
//!
//! Workers post non-terminal progress through the callback endpoint with a
//! token bound to their task; the dispatcher publishes terminal states itself
//! once the queue has settled the task. Both end up in a [`StatusSink`].

use std::sync::Arc;
use std::time::Duration;

use jobplane_executor::{BearerToken, ExecutorError, StatusReporter};
use jobplane_types::{ErrorKind, StatusReport, TaskId, async_trait};
use parking_lot::Mutex;

use super::queue::{JobQueue, QueueError};
use crate::credentials::Scope;
use crate::identity::{CapabilityError, Identity, IdentityVerifier, VerifyError};

#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, report: StatusReport) -> jobplane_types::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusSink;

#[async_trait]
impl StatusSink for LogStatusSink {
    async fn publish(&self, report: StatusReport) -> jobplane_types::Result<()> {
        tracing::info!(
            task_id = %report.task_id,
            status = %report.status,
            attempt = report.attempt,
            error_kind = ?report.error_kind,
            "Task status"
        );
        Ok(())
    }
}

/// Records every report; used by tests and the local runtime's status view.
#[derive(Debug, Default)]
pub struct MemoryStatusSink {
    reports: Mutex<Vec<StatusReport>>,
}

impl MemoryStatusSink {
    pub fn reports(&self) -> Vec<StatusReport> {
        self.reports.lock().clone()
    }

    pub fn for_task(&self, task_id: &TaskId) -> Vec<StatusReport> {
        self.reports
            .lock()
            .iter()
            .filter(|report| &report.task_id == task_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StatusSink for MemoryStatusSink {
    async fn publish(&self, report: StatusReport) -> jobplane_types::Result<()> {
        LogStatusSink.publish(report.clone()).await?;
        self.reports.lock().push(report);
        Ok(())
    }
}

/// Pushes reports to an external webhook with bounded retries.
#[derive(Debug, Clone)]
pub struct WebhookStatusSink {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    retries: u32,
}

impl WebhookStatusSink {
    pub fn new(url: impl Into<String>, timeout: Duration, retries: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout,
            retries,
        }
    }
}

#[async_trait]
impl StatusSink for WebhookStatusSink {
    async fn publish(&self, report: StatusReport) -> jobplane_types::Result<()> {
        for attempt in 0..=self.retries {
            let result = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .json(&report)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) if response.status().is_client_error() => {
                    jobplane_types::bail!("Webhook rejected status report: {}", response.status());
                }
                Ok(response) => {
                    tracing::warn!(attempt, status = %response.status(), "Status webhook failed");
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Status webhook error");
                }
            }

            if attempt < self.retries {
                tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
            }
        }

        jobplane_types::bail!("Status webhook failed after {} retries", self.retries)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error(transparent)]
    Auth(#[from] VerifyError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error("Task not found: {0}")]
    NotFound(TaskId),
    #[error("Report rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("Failed to publish status: {0}")]
    Sink(String),
}

impl StatusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StatusError::Auth(_) | StatusError::Capability(_) => ErrorKind::AuthDenied,
            StatusError::Queue(e) => e.kind(),
            _ => ErrorKind::ExecutionError,
        }
    }
}

/// Accepts worker progress reports.
pub struct StatusIntake {
    verifier: Arc<IdentityVerifier>,
    queue: Arc<dyn JobQueue>,
    sink: Arc<dyn StatusSink>,
}

impl StatusIntake {
    pub fn new(
        verifier: Arc<IdentityVerifier>,
        queue: Arc<dyn JobQueue>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            verifier,
            queue,
            sink,
        }
    }

    pub fn sink(&self) -> &Arc<dyn StatusSink> {
        &self.sink
    }

    #[tracing::instrument(name = "status.accept", skip(self, identity, report), fields(sub = %identity.subject))]
    pub async fn accept(
        &self,
        identity: &Identity,
        task_id: &TaskId,
        report: StatusReport,
    ) -> Result<(), StatusError> {
        identity.require(Scope::StatusReport)?;
        if !identity.is_bound() {
            return Err(CapabilityError::ResourceMismatch.into());
        }
        identity.require_resource(task_id.as_str())?;

        if &report.task_id != task_id {
            return Err(StatusError::Rejected("report is for another task".into()));
        }
        if report.status.is_terminal() {
            return Err(StatusError::Rejected(
                "terminal states are settled through the queue".into(),
            ));
        }

        let task = self
            .queue
            .get(task_id)
            .await?
            .ok_or_else(|| StatusError::NotFound(task_id.clone()))?;
        if task.status.is_terminal() {
            return Err(StatusError::Rejected(format!("task already {}", task.status)));
        }
        if task.attempt_count != report.attempt {
            return Err(StatusError::Rejected(format!(
                "attempt {} is no longer current",
                report.attempt
            )));
        }

        self.sink
            .publish(report)
            .await
            .map_err(|e| StatusError::Sink(e.to_string()))
    }
}

/// In-process callback path for workers sharing the control plane's process.
#[async_trait]
impl StatusReporter for StatusIntake {
    async fn report(&self, token: &BearerToken, report: &StatusReport) -> Result<(), ExecutorError> {
        let identity = self
            .verifier
            .verify(token.expose())
            .await
            .map_err(|e| ExecutorError::Unauthorized(e.to_string()))?;

        self.accept(&identity, &report.task_id, report.clone())
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::AuthDenied => ExecutorError::Unauthorized(e.to_string()),
                _ => ExecutorError::Callback(e.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::MemoryAlertSink;
    use crate::config::{CredentialConfig, IdentityConfig, QueueConfig};
    use crate::credentials::{CredentialVendor, Role, SigningKey, Subject, TokenRequest, USER_SCOPES};
    use crate::execution::queue::InMemoryQueue;
    use jobplane_types::{ManualClock, NewTask, TaskStatus, chrono::Duration as ChronoDuration};

    struct Fixture {
        clock: ManualClock,
        vendor: Arc<CredentialVendor>,
        queue: Arc<InMemoryQueue>,
        sink: Arc<MemoryStatusSink>,
        intake: StatusIntake,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::starting_now();
        let vendor = Arc::new(CredentialVendor::new(
            SigningKey::generate("k1").unwrap(),
            CredentialConfig::default(),
            clock.shared(),
        ));
        let verifier = Arc::new(IdentityVerifier::new(
            vendor.clone(),
            IdentityConfig::default(),
            clock.shared(),
        ));
        let queue = Arc::new(InMemoryQueue::new(
            QueueConfig::default(),
            clock.shared(),
            Arc::new(MemoryAlertSink::default()),
        ));
        let sink = Arc::new(MemoryStatusSink::default());
        let intake = StatusIntake::new(verifier, queue.clone(), sink.clone());
        Fixture {
            clock,
            vendor,
            queue,
            sink,
            intake,
        }
    }

    async fn claimed_task(fx: &Fixture) -> TaskId {
        fx.queue
            .enqueue(NewTask {
                pipeline_ref: "builtin/echo".into(),
                parameters: serde_json::Value::Null,
                input_locator: "in".into(),
                output_locator: "out".into(),
                priority: 0,
                owner: "alice".into(),
                dedup_key: None,
                expected_duration_secs: None,
            })
            .await
            .unwrap();
        fx.queue
            .claim(ChronoDuration::seconds(30))
            .await
            .unwrap()
            .unwrap()
            .task
            .task_id
    }

    fn callback_token(fx: &Fixture, task_id: &TaskId) -> BearerToken {
        let token = fx
            .vendor
            .issue_with(
                TokenRequest::new(Subject::new("worker", Role::Worker), &[Scope::StatusReport])
                    .bound_to(task_id.as_str()),
            )
            .unwrap();
        BearerToken::new(token.as_str())
    }

    #[tokio::test]
    async fn bound_worker_reports_running() {
        let fx = fixture();
        let task_id = claimed_task(&fx).await;
        let token = callback_token(&fx, &task_id);

        let report = StatusReport::new(task_id.clone(), TaskStatus::Running, 1, fx.clock.now());
        fx.intake.report(&token, &report).await.unwrap();

        assert_eq!(fx.sink.for_task(&task_id).len(), 1);
    }

    #[tokio::test]
    async fn token_for_other_task_is_refused() {
        let fx = fixture();
        let task_id = claimed_task(&fx).await;
        let token = callback_token(&fx, &TaskId::from("someone-else"));

        let report = StatusReport::new(task_id, TaskStatus::Running, 1, fx.clock.now());
        assert!(matches!(
            fx.intake.report(&token, &report).await,
            Err(ExecutorError::Unauthorized(_))
        ));
        assert!(fx.sink.reports().is_empty());
    }

    #[tokio::test]
    async fn worker_cannot_report_success() {
        let fx = fixture();
        let task_id = claimed_task(&fx).await;
        let token = callback_token(&fx, &task_id);

        let report = StatusReport::new(task_id, TaskStatus::Succeeded, 1, fx.clock.now());
        assert!(matches!(
            fx.intake.report(&token, &report).await,
            Err(ExecutorError::Callback(_))
        ));
    }

    #[tokio::test]
    async fn unbound_token_is_refused() {
        let fx = fixture();
        let task_id = claimed_task(&fx).await;
        let token = fx.vendor.issue(&Subject::new("alice", Role::User), USER_SCOPES).unwrap();

        let report = StatusReport::new(task_id, TaskStatus::Running, 1, fx.clock.now());
        assert!(matches!(
            fx.intake.report(&BearerToken::new(token.as_str()), &report).await,
            Err(ExecutorError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn report_from_previous_attempt_is_refused() {
        let fx = fixture();
        let task_id = claimed_task(&fx).await;
        let token = callback_token(&fx, &task_id);

        fx.clock.advance(ChronoDuration::seconds(31));
        fx.queue.claim(ChronoDuration::seconds(30)).await.unwrap().unwrap();

        let report = StatusReport::new(task_id, TaskStatus::Running, 1, fx.clock.now());
        assert!(fx.intake.report(&token, &report).await.is_err());
    }
}
