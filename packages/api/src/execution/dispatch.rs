//! Dispatcher.
//!
//! Pulls tasks from the queue and hands them to the worker pool. Every batch
//! starts with the two-factor worker-pool check; a denial halts all new
//! assignments for that batch and raises an alert, but never stops the loop.
//! Admission control leaves tasks queued when the pool has no free slot.
//!
//! Per task the dispatcher:
//!
//! 1. extends the lease when the task expects to outlive the visibility timeout,
//! 2. pre-signs one read URL for the input and one write URL for the output,
//!    valid for the remaining lease plus a grace period,
//! 3. issues a callback token bound to the task,
//! 4. marks the task `assigned`, hands it to the pool, marks it `running`,
//! 5. monitors the worker: success is acknowledged and only then reported,
//!    failures are released back to the queue, crashes are left to the lease.

use std::sync::Arc;

use jobplane_executor::{
    Assignment, Authorization, BearerToken, ExecutionResult, ExecutorError, PoolGrant, Totp,
    WorkerAuth, WorkerOutcome, WorkerPool, WorkerRun,
};
use jobplane_storage::{ObjectGateway, Operation, TransferError};
use jobplane_types::{
    ErrorKind, SharedClock, StatusReport, TaskId, TaskStatus,
    chrono::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::authorized::AuthorizedQueue;
use super::queue::{ClaimedTask, DeliveryReceipt, NackOutcome, QueueError};
use super::status::StatusSink;
use crate::alerting::{Alert, AlertSink};
use crate::config::DispatchConfig;
use crate::credentials::{
    AccessToken, CredentialError, CredentialVendor, DISPATCHER_SCOPES, Role, Scope, Subject,
    TokenRequest, WORKER_SCOPES,
};
use crate::identity::{CapabilityError, IdentityVerifier, VerifyError};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Credential(e) => e.kind(),
            DispatchError::Verify(e) => e.kind(),
            DispatchError::Capability(e) => e.kind(),
            DispatchError::Queue(e) => e.kind(),
            DispatchError::Transfer(e) => e.kind(),
            DispatchError::Executor(e) => e.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The worker pool refused the dispatcher; nothing was claimed.
    Halted(jobplane_executor::DenialReason),
    /// No free worker slot; tasks stay queued.
    Saturated,
    /// Nothing to claim.
    Idle,
    /// Tasks handed to workers in this batch.
    Dispatched(usize),
}

/// How a monitored attempt was settled.
#[derive(Debug)]
pub enum MonitorOutcome {
    Succeeded(ExecutionResult),
    Requeued(ErrorKind),
    DeadLettered(ErrorKind),
    /// Worker died; the lease is left to lapse.
    Crashed(String),
    /// The queue refused the settlement (typically a lapsed lease).
    Unsettled(String),
}

#[derive(Debug)]
pub struct Batch {
    pub outcome: BatchOutcome,
    pub monitors: Vec<JoinHandle<MonitorOutcome>>,
}

impl Batch {
    fn empty(outcome: BatchOutcome) -> Self {
        Self {
            outcome,
            monitors: Vec::new(),
        }
    }

    /// Wait for every monitored attempt of this batch.
    pub async fn settle(self) -> Vec<MonitorOutcome> {
        futures_util::future::join_all(self.monitors)
            .await
            .into_iter()
            .map(|joined| joined.unwrap_or_else(|e| MonitorOutcome::Unsettled(e.to_string())))
            .collect()
    }
}

/// Everything the dispatcher is wired to.
pub struct DispatcherContext {
    pub queue: AuthorizedQueue,
    pub vendor: Arc<CredentialVendor>,
    pub verifier: Arc<IdentityVerifier>,
    pub pool: Arc<dyn WorkerPool>,
    pub gateway: ObjectGateway,
    pub sink: Arc<dyn StatusSink>,
    pub alerts: Arc<dyn AlertSink>,
    pub totp: Totp,
    pub config: DispatchConfig,
    pub visibility_timeout: Duration,
    pub clock: SharedClock,
}

struct DispatcherInner {
    ctx: DispatcherContext,
    subject: Subject,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("subject", &self.inner.subject.id)
            .field("batch_size", &self.inner.ctx.config.batch_size)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(ctx: DispatcherContext) -> Self {
        let subject = Subject::new(ctx.config.subject.clone(), Role::Dispatcher);
        Self {
            inner: Arc::new(DispatcherInner { ctx, subject }),
        }
    }

    /// Dispatch loop. Batch failures are logged and the loop carries on until
    /// `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(subject = %self.inner.subject.id, "Dispatcher started");
        let interval = self.inner.ctx.config.poll_interval();

        loop {
            match self.run_once().await {
                Ok(batch) => {
                    if let BatchOutcome::Dispatched(count) = batch.outcome {
                        tracing::debug!(count, "Dispatched batch");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, kind = %e.kind(), "Dispatch batch failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        tracing::info!("Dispatcher stopped");
    }

    #[tracing::instrument(name = "dispatch.batch", skip(self))]
    pub async fn run_once(&self) -> Result<Batch, DispatchError> {
        let ctx = &self.inner.ctx;
        let now = ctx.clock.now();

        let auth = WorkerAuth::generate(&ctx.totp, ctx.config.source_ip, now);
        let grant = match ctx.pool.authorize(&auth).await {
            Authorization::Authorized(grant) => grant,
            Authorization::Denied(reason) => {
                tracing::error!(reason = %reason, "Worker pool refused dispatcher; halting assignments");
                metrics::counter!("jobplane_dispatch_halted_total").increment(1);
                ctx.alerts.notify(Alert::new(
                    ErrorKind::AuthDenied,
                    format!("worker pool authorization denied: {}", reason),
                    now,
                ));
                return Ok(Batch::empty(BatchOutcome::Halted(reason)));
            }
        };

        let available = ctx.pool.available();
        if available == 0 {
            tracing::debug!("Worker pool saturated; leaving tasks queued");
            metrics::counter!("jobplane_dispatch_saturated_total").increment(1);
            return Ok(Batch::empty(BatchOutcome::Saturated));
        }

        // Fresh credential per batch.
        let token = ctx.vendor.issue(&self.inner.subject, DISPATCHER_SCOPES)?;
        ctx.verifier.verify_token(&token).await?.require(Scope::ObjectPresign)?;

        let mut claimed = 0;
        let mut monitors = Vec::new();
        for _ in 0..available.min(ctx.config.batch_size) {
            let Some(task) = ctx.queue.claim(&token, ctx.visibility_timeout).await? else {
                break;
            };
            claimed += 1;

            match self.dispatch_task(&token, &grant, task).await {
                Ok(monitor) => monitors.push(monitor),
                Err(e @ DispatchError::Executor(ExecutorError::Saturated | ExecutorError::Unauthorized(_))) => {
                    tracing::warn!(error = %e, "Worker pool refused assignment; ending batch");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to dispatch task");
                }
            }
        }

        let outcome = if claimed == 0 {
            BatchOutcome::Idle
        } else {
            metrics::counter!("jobplane_dispatch_assigned_total").increment(monitors.len() as u64);
            BatchOutcome::Dispatched(monitors.len())
        };
        Ok(Batch { outcome, monitors })
    }

    #[tracing::instrument(name = "dispatch.task", skip_all, fields(task_id = %claimed.task.task_id, attempt = claimed.receipt.attempt))]
    async fn dispatch_task(
        &self,
        token: &AccessToken,
        grant: &PoolGrant,
        claimed: ClaimedTask,
    ) -> Result<JoinHandle<MonitorOutcome>, DispatchError> {
        let ctx = &self.inner.ctx;
        let ClaimedTask { task, receipt } = claimed;

        let (assignment, receipt) = match self.prepare(token, &task, receipt.clone()).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.release(token, &receipt, e.kind(), &e.to_string()).await;
                return Err(e);
            }
        };

        let run = match ctx.pool.assign(grant, assignment).await {
            Ok(run) => run,
            Err(e) => {
                self.release(token, &receipt, ErrorKind::ExecutionError, &e.to_string())
                    .await;
                return Err(e.into());
            }
        };

        if let Err(e) = ctx.queue.mark(token, &receipt, TaskStatus::Running).await {
            tracing::warn!(error = %e, "Failed to mark task running");
        }

        let inner = self.inner.clone();
        let output_locator = task.output_locator.clone();
        Ok(tokio::spawn(async move {
            monitor(inner, receipt, output_locator, run).await
        }))
    }

    async fn prepare(
        &self,
        token: &AccessToken,
        task: &jobplane_types::Task,
        mut receipt: DeliveryReceipt,
    ) -> Result<(Assignment, DeliveryReceipt), DispatchError> {
        let ctx = &self.inner.ctx;
        let grace = ctx.config.presign_grace();

        if let Some(expected) = task.expected_duration_secs {
            let expected = Duration::seconds(expected.min(u32::MAX as u64) as i64);
            if expected > ctx.visibility_timeout {
                let by = expected - ctx.visibility_timeout + grace;
                receipt = ctx.queue.extend(token, &receipt, by).await?;
                tracing::debug!(expires_at = %receipt.expires_at, "Extended lease for long task");
            }
        }

        let ttl = (receipt.expires_at - ctx.clock.now()) + grace;
        let input = ctx.gateway.presign(&task.input_locator, Operation::Read, ttl)?;
        let output = ctx.gateway.presign(&task.output_locator, Operation::Write, ttl)?;

        let callback = ctx.vendor.issue_with(
            TokenRequest::new(
                Subject::new(format!("worker:{}", task.task_id), Role::Worker),
                WORKER_SCOPES,
            )
            .bound_to(task.task_id.as_str())
            .ttl(ttl),
        )?;

        ctx.queue.mark(token, &receipt, TaskStatus::Assigned).await?;

        let assignment = Assignment {
            task_id: task.task_id.clone(),
            attempt: receipt.attempt,
            pipeline_ref: task.pipeline_ref.clone(),
            parameters: task.parameters.clone(),
            input,
            output,
            callback_token: BearerToken::new(callback.as_str()),
            lease_expires_at: receipt.expires_at,
        };
        Ok((assignment, receipt))
    }

    /// Hand a task that never reached a worker back to the queue. Only a
    /// dead-lettered release is terminal and reported.
    async fn release(&self, token: &AccessToken, receipt: &DeliveryReceipt, kind: ErrorKind, message: &str) {
        let ctx = &self.inner.ctx;
        match ctx.queue.nack(token, receipt, kind, message).await {
            Ok(NackOutcome::Requeued) => {}
            Ok(NackOutcome::DeadLettered) => {
                let report = StatusReport::new(
                    receipt.task_id.clone(),
                    TaskStatus::Failed,
                    receipt.attempt,
                    ctx.clock.now(),
                )
                .with_error(ErrorKind::DeadLettered, message);
                publish(ctx.sink.as_ref(), report).await;
            }
            Err(e) => {
                tracing::warn!(task_id = %receipt.task_id, error = %e, "Failed to release task");
            }
        }
    }
}

async fn monitor(
    inner: Arc<DispatcherInner>,
    receipt: DeliveryReceipt,
    output_locator: String,
    run: WorkerRun,
) -> MonitorOutcome {
    let ctx = &inner.ctx;
    let task_id = receipt.task_id.clone();
    let attempt = receipt.attempt;
    let outcome = run.outcome().await;

    // The batch token may have lapsed while the worker ran.
    let token = match ctx
        .vendor
        .issue(&inner.subject, &[Scope::QueueAck, Scope::QueueNack])
    {
        Ok(token) => token,
        Err(e) => {
            tracing::error!(task_id = %task_id, error = %e, "Cannot obtain settlement credential");
            return MonitorOutcome::Unsettled(e.to_string());
        }
    };

    match outcome {
        WorkerOutcome::Completed(result) => match ctx.queue.ack(&token, &receipt).await {
            Ok(()) => {
                metrics::counter!("jobplane_tasks_succeeded_total").increment(1);
                let report = StatusReport::new(task_id, TaskStatus::Succeeded, attempt, ctx.clock.now())
                    .with_output(output_locator);
                publish(ctx.sink.as_ref(), report).await;
                MonitorOutcome::Succeeded(result)
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %task_id,
                    attempt,
                    error = %e,
                    "Acknowledgment refused; not reporting success"
                );
                MonitorOutcome::Unsettled(e.to_string())
            }
        },
        WorkerOutcome::Failed(e) => {
            let kind = e.kind();
            let message = e.to_string();
            tracing::warn!(task_id = %task_id, attempt, kind = %kind, error = %message, "Worker reported failure");
            metrics::counter!("jobplane_tasks_failed_total", "kind" => kind.as_str()).increment(1);

            match ctx.queue.nack(&token, &receipt, kind, &message).await {
                Ok(settled) => {
                    let (reported_kind, outcome) = match settled {
                        NackOutcome::Requeued => (kind, MonitorOutcome::Requeued(kind)),
                        NackOutcome::DeadLettered => {
                            (ErrorKind::DeadLettered, MonitorOutcome::DeadLettered(kind))
                        }
                    };
                    let report = StatusReport::new(task_id, TaskStatus::Failed, attempt, ctx.clock.now())
                        .with_error(reported_kind, message);
                    publish(ctx.sink.as_ref(), report).await;
                    outcome
                }
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "Failed to release failed task");
                    MonitorOutcome::Unsettled(e.to_string())
                }
            }
        }
        WorkerOutcome::Crashed(reason) => {
            tracing::warn!(task_id = %task_id, attempt, reason = %reason, "Worker crashed; awaiting lease expiry");
            metrics::counter!("jobplane_worker_crashes_total").increment(1);
            MonitorOutcome::Crashed(reason)
        }
    }
}

async fn publish(sink: &dyn StatusSink, report: StatusReport) {
    let task_id: TaskId = report.task_id.clone();
    if let Err(e) = sink.publish(report).await {
        tracing::warn!(task_id = %task_id, error = %e, "Failed to publish status report");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::MemoryAlertSink;
    use crate::config::PlatformConfig;
    use crate::execution::status::MemoryStatusSink;
    use crate::platform::Platform;
    use jobplane_executor::{DenialReason, HandlerRegistry};
    use jobplane_types::{ManualClock, NewTask, bytes::Bytes};

    fn config() -> PlatformConfig {
        let mut config = PlatformConfig::default();
        config.worker.cold_start_ms = 0;
        config.worker.capacity = 2;
        config
    }

    async fn submit(platform: &Platform, id: &str) -> TaskId {
        let input = format!("in/{}", id);
        platform
            .state
            .gateway
            .put_object(&input, Bytes::from(format!("payload {}", id)))
            .await
            .unwrap();
        platform
            .state
            .queue
            .enqueue(NewTask {
                pipeline_ref: "builtin/uppercase".into(),
                parameters: serde_json::Value::Null,
                input_locator: input,
                output_locator: format!("out/{}", id),
                priority: 0,
                owner: "alice".into(),
                dedup_key: None,
                expected_duration_secs: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn dispatches_and_reports_success_after_ack() {
        let clock = ManualClock::starting_now();
        let sink = Arc::new(MemoryStatusSink::default());
        let platform = Platform::builder(config())
            .clock(clock.shared())
            .status_sink(sink.clone())
            .build()
            .unwrap();
        let id = submit(&platform, "a").await;

        let batch = platform.dispatcher.run_once().await.unwrap();
        assert_eq!(batch.outcome, BatchOutcome::Dispatched(1));
        let outcomes = batch.settle().await;
        assert!(matches!(outcomes[0], MonitorOutcome::Succeeded(_)));

        let task = platform.state.queue.get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        let output = platform.state.gateway.get_object("out/a").await.unwrap();
        assert_eq!(&output[..], b"PAYLOAD A");

        let reports = sink.for_task(&id);
        let last = reports.last().unwrap();
        assert_eq!(last.status, TaskStatus::Succeeded);
        assert_eq!(last.output_locator.as_deref(), Some("out/a"));
    }

    #[tokio::test]
    async fn wrong_second_factor_halts_and_alerts() {
        let clock = ManualClock::starting_now();
        let alerts = Arc::new(MemoryAlertSink::default());
        let platform = Platform::builder(config())
            .clock(clock.shared())
            .alert_sink(alerts.clone())
            .totp_secret(b"pool-secret".to_vec())
            .dispatcher_totp_secret(b"stale-secret".to_vec())
            .build()
            .unwrap();
        submit(&platform, "a").await;

        let batch = platform.dispatcher.run_once().await.unwrap();
        assert_eq!(batch.outcome, BatchOutcome::Halted(DenialReason::InvalidCode));
        assert_eq!(platform.state.queue.stats().await.unwrap().ready, 1);
        assert_eq!(alerts.alerts()[0].kind, ErrorKind::AuthDenied);
    }

    #[tokio::test]
    async fn origin_outside_allow_list_halts() {
        let clock = ManualClock::starting_now();
        let mut config = config();
        config.dispatch.source_ip = "192.0.2.10".parse().unwrap();
        let platform = Platform::builder(config).clock(clock.shared()).build().unwrap();
        submit(&platform, "a").await;

        let batch = platform.dispatcher.run_once().await.unwrap();
        assert_eq!(
            batch.outcome,
            BatchOutcome::Halted(DenialReason::OriginNotAllowed)
        );
    }

    #[tokio::test]
    async fn admission_control_leaves_excess_tasks_queued() {
        let clock = ManualClock::starting_now();
        let platform = Platform::builder(config()).clock(clock.shared()).build().unwrap();
        for id in ["a", "b", "c"] {
            submit(&platform, id).await;
        }

        let batch = platform.dispatcher.run_once().await.unwrap();
        assert_eq!(batch.outcome, BatchOutcome::Dispatched(2));
        assert_eq!(platform.state.queue.stats().await.unwrap().ready, 1);
        batch.settle().await;
    }

    #[tokio::test]
    async fn unknown_pipeline_is_released_for_retry() {
        let clock = ManualClock::starting_now();
        let platform = Platform::builder(config())
            .clock(clock.shared())
            .registry(HandlerRegistry::new())
            .build()
            .unwrap();
        let id = submit(&platform, "a").await;

        let outcomes = platform.dispatcher.run_once().await.unwrap().settle().await;
        assert!(matches!(outcomes[0], MonitorOutcome::Requeued(ErrorKind::ExecutionError)));

        let task = platform.state.queue.get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.last_error.unwrap().kind, ErrorKind::ExecutionError);
    }

    #[tokio::test]
    async fn undeliverable_task_reports_dead_letter() {
        let clock = ManualClock::starting_now();
        let sink = Arc::new(MemoryStatusSink::default());
        let platform = Platform::builder(config())
            .clock(clock.shared())
            .status_sink(sink.clone())
            .build()
            .unwrap();
        // Bypasses submission checks; the input cannot be pre-signed.
        let id = platform
            .state
            .queue
            .enqueue(NewTask {
                pipeline_ref: "builtin/echo".into(),
                parameters: serde_json::Value::Null,
                input_locator: "/".into(),
                output_locator: "out/a".into(),
                priority: 0,
                owner: "alice".into(),
                dedup_key: None,
                expected_duration_secs: None,
            })
            .await
            .unwrap();

        for _ in 0..2 {
            let batch = platform.dispatcher.run_once().await.unwrap();
            assert_eq!(batch.outcome, BatchOutcome::Dispatched(0));
            assert!(sink.for_task(&id).is_empty());
        }
        platform.dispatcher.run_once().await.unwrap();

        let task = platform.state.queue.get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);

        let reports = sink.for_task(&id);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, TaskStatus::Failed);
        assert_eq!(reports[0].attempt, 3);
        assert_eq!(reports[0].error_kind, Some(ErrorKind::DeadLettered));
    }

    #[tokio::test]
    async fn long_task_gets_extended_lease() {
        let clock = ManualClock::starting_now();
        let platform = Platform::builder(config()).clock(clock.shared()).build().unwrap();
        platform
            .state
            .gateway
            .put_object("in/long", Bytes::from_static(b"x"))
            .await
            .unwrap();
        platform
            .state
            .queue
            .enqueue(NewTask {
                pipeline_ref: "builtin/echo".into(),
                parameters: serde_json::Value::Null,
                input_locator: "in/long".into(),
                output_locator: "out/long".into(),
                priority: 0,
                owner: "alice".into(),
                dedup_key: None,
                expected_duration_secs: Some(600),
            })
            .await
            .unwrap();

        let outcomes = platform.dispatcher.run_once().await.unwrap().settle().await;
        assert!(matches!(outcomes[0], MonitorOutcome::Succeeded(_)));
    }

    #[tokio::test]
    async fn empty_queue_is_idle() {
        let platform = Platform::builder(config())
            .clock(ManualClock::starting_now().shared())
            .build()
            .unwrap();
        let batch = platform.dispatcher.run_once().await.unwrap();
        assert_eq!(batch.outcome, BatchOutcome::Idle);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let platform = Platform::builder(config()).build().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let dispatcher = platform.dispatcher.clone();
            let shutdown = shutdown.clone();
            async move { dispatcher.run(shutdown).await }
        });

        shutdown.cancel();
        handle.await.unwrap();
    }
}
