//! Job queue with at-least-once delivery.
//!
//! A claim hands out a [`DeliveryReceipt`] that leases the task for a
//! visibility timeout. Until the receipt is acknowledged the task is invisible
//! to other claimers; when the lease lapses the task becomes claimable again,
//! up to `max_attempts` deliveries, after which it is dead-lettered and
//! reported. The queue is the sole serialization point of the pipeline: a task
//! never has more than one live receipt.
//!
//! Lease expiry is processed lazily at the start of every queue operation. A
//! task dead-lettered that way has no dispatcher watching it, so the queue
//! publishes its terminal `expired` report itself.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use jobplane_types::{
    ErrorKind, NewTask, SharedClock, StatusReport, Task, TaskError, TaskId, TaskStatus, async_trait,
    chrono::{DateTime, Duration, Utc},
    create_id,
};
use parking_lot::Mutex;
use serde::Serialize;

use super::status::StatusSink;
use crate::alerting::{Alert, AlertSink};
use crate::config::QueueConfig;
use crate::identity::{CapabilityError, VerifyError};

const LEASE_LAPSED: &str = "visibility timeout elapsed";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Task not found: {0}")]
    NotFound(TaskId),
    #[error("Receipt is no longer valid")]
    StaleReceipt,
    #[error("Task cannot be cancelled while {0}")]
    NotCancellable(TaskStatus),
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
    #[error(transparent)]
    Auth(#[from] VerifyError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::StaleReceipt => ErrorKind::StaleReceipt,
            QueueError::Auth(_) | QueueError::Capability(_) => ErrorKind::AuthDenied,
            _ => ErrorKind::ExecutionError,
        }
    }
}

/// Handle on one lease of one task. Required to acknowledge, extend or
/// release the task; useless once the lease has lapsed or been settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub task_id: TaskId,
    pub lease_id: String,
    pub attempt: u32,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task: Task,
    pub receipt: DeliveryReceipt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued,
    DeadLettered,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub task: Task,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: usize,
    pub in_flight: usize,
    pub succeeded: usize,
    pub dead_lettered: usize,
    pub cancelled: usize,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Idempotent per `(owner, dedup_key)` within the retention window.
    async fn enqueue(&self, task: NewTask) -> Result<TaskId, QueueError>;

    async fn claim(&self, visibility_timeout: Duration) -> Result<Option<ClaimedTask>, QueueError>;

    async fn ack(&self, receipt: &DeliveryReceipt) -> Result<(), QueueError>;

    async fn extend(
        &self,
        receipt: &DeliveryReceipt,
        by: Duration,
    ) -> Result<DeliveryReceipt, QueueError>;

    /// Release the lease now. Retryable failures are requeued while attempts
    /// remain; everything else is dead-lettered.
    async fn nack(
        &self,
        receipt: &DeliveryReceipt,
        kind: ErrorKind,
        message: &str,
    ) -> Result<NackOutcome, QueueError>;

    /// Advance a leased task to `assigned` or `running`.
    async fn mark(&self, receipt: &DeliveryReceipt, status: TaskStatus) -> Result<(), QueueError>;

    async fn cancel(&self, task_id: &TaskId) -> Result<Task, QueueError>;

    async fn get(&self, task_id: &TaskId) -> Result<Option<Task>, QueueError>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

#[derive(Debug, Clone)]
struct Lease {
    lease_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    task: Task,
    lease: Option<Lease>,
    seq: u64,
}

/// Higher priority first, then enqueue order.
type ReadyKey = (Reverse<i32>, u64, TaskId);

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<TaskId, Entry>,
    ready: BTreeSet<ReadyKey>,
    leases: BTreeSet<(DateTime<Utc>, TaskId)>,
    dedup: HashMap<String, (TaskId, DateTime<Utc>)>,
    dead: Vec<DeadLetter>,
    next_seq: u64,
}

impl QueueState {
    fn push_ready(&mut self, task_id: &TaskId) {
        if let Some(entry) = self.entries.get(task_id) {
            self.ready
                .insert((Reverse(entry.task.priority), entry.seq, task_id.clone()));
        }
    }

    fn release(&mut self, task_id: &TaskId) -> Option<Lease> {
        let lease = self.entries.get_mut(task_id)?.lease.take()?;
        self.leases.remove(&(lease.expires_at, task_id.clone()));
        Some(lease)
    }

    /// Forget settled tasks last touched before `settled_before` and dead
    /// letters recorded before `dead_before`.
    fn prune(&mut self, settled_before: DateTime<Utc>, dead_before: DateTime<Utc>) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            !entry.task.status.is_terminal() || entry.task.updated_at >= settled_before
        });
        self.dead.retain(|dead| dead.dead_lettered_at >= dead_before);

        let pruned = before - self.entries.len();
        if pruned > 0 {
            tracing::debug!(pruned, "Dropped settled tasks past retention");
        }
    }

    fn leased(&mut self, receipt: &DeliveryReceipt) -> Result<&mut Entry, QueueError> {
        let entry = self
            .entries
            .get_mut(&receipt.task_id)
            .ok_or_else(|| QueueError::NotFound(receipt.task_id.clone()))?;
        match &entry.lease {
            Some(lease) if lease.lease_id == receipt.lease_id => Ok(entry),
            _ => Err(QueueError::StaleReceipt),
        }
    }

    fn dead_letter(
        &mut self,
        task_id: &TaskId,
        status: TaskStatus,
        reason: String,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        self.release(task_id);
        let entry = self.entries.get_mut(task_id)?;
        let attempt = entry.task.attempt_count;
        entry.task.advance(status, now);
        entry.task.last_error = Some(TaskError {
            kind: ErrorKind::DeadLettered,
            message: reason.clone(),
            attempt,
        });
        self.dead.push(DeadLetter {
            task: entry.task.clone(),
            reason: reason.clone(),
            dead_lettered_at: now,
        });

        tracing::warn!(task_id = %task_id, attempt, reason = %reason, "Task dead-lettered");
        metrics::counter!("jobplane_queue_dead_lettered_total").increment(1);

        Some(
            Alert::new(
                ErrorKind::DeadLettered,
                format!("task dead-lettered after {} attempts: {}", attempt, reason),
                now,
            )
            .for_task(task_id.clone()),
        )
    }
}

/// Side effects collected under the state lock and delivered after it is
/// released.
#[derive(Default)]
struct Effects {
    alerts: Vec<Alert>,
    reports: Vec<StatusReport>,
}

pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    config: QueueConfig,
    clock: SharedClock,
    alerts: Arc<dyn AlertSink>,
    sink: Option<Arc<dyn StatusSink>>,
}

impl std::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl InMemoryQueue {
    pub fn new(config: QueueConfig, clock: SharedClock, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            config,
            clock,
            alerts,
            sink: None,
        }
    }

    /// Publish terminal reports for tasks whose last lease lapsed.
    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Process lapsed leases, retire expired dedup keys and drop settled
    /// tasks older than the retention window.
    fn sweep(&self, state: &mut QueueState, now: DateTime<Utc>) -> Effects {
        let mut effects = Effects::default();

        loop {
            let Some((expires_at, task_id)) = state.leases.first().cloned() else {
                break;
            };
            if expires_at > now {
                break;
            }
            state.release(&task_id);

            let Some(entry) = state.entries.get_mut(&task_id) else {
                continue;
            };
            let attempt = entry.task.attempt_count;
            if attempt < self.config.max_attempts {
                entry.task.last_error = Some(TaskError {
                    kind: ErrorKind::StaleReceipt,
                    message: LEASE_LAPSED.to_string(),
                    attempt,
                });
                entry.task.requeue(now);
                state.push_ready(&task_id);
                tracing::info!(task_id = %task_id, attempt, "Lease lapsed; task visible again");
                metrics::counter!("jobplane_queue_redelivered_total").increment(1);
            } else if let Some(alert) =
                state.dead_letter(&task_id, TaskStatus::Expired, LEASE_LAPSED.to_string(), now)
            {
                effects.alerts.push(alert);
                effects.reports.push(
                    StatusReport::new(task_id, TaskStatus::Expired, attempt, now)
                        .with_error(ErrorKind::DeadLettered, LEASE_LAPSED),
                );
            }
        }

        let retention = self.config.dedup_retention();
        state.dedup.retain(|_, (_, recorded_at)| now - *recorded_at < retention);
        state.prune(now - retention, now - self.config.dead_letter_retention());

        effects
    }

    async fn deliver(&self, effects: Effects) {
        for alert in effects.alerts {
            self.alerts.notify(alert);
        }
        let Some(sink) = &self.sink else {
            return;
        };
        for report in effects.reports {
            let task_id = report.task_id.clone();
            if let Err(e) = sink.publish(report).await {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to publish expiry report");
            }
        }
    }

    /// Run `op` under the state lock after sweeping, then deliver collected
    /// alerts and reports with the lock released.
    async fn with_state<T>(
        &self,
        op: impl FnOnce(&mut QueueState, DateTime<Utc>, &mut Vec<Alert>) -> T,
    ) -> T {
        let now = self.clock.now();
        let (result, effects) = {
            let mut state = self.state.lock();
            let mut effects = self.sweep(&mut state, now);
            let result = op(&mut state, now, &mut effects.alerts);
            (result, effects)
        };
        self.deliver(effects).await;
        result
    }
}

fn dedup_key(owner: &str, key: &str) -> String {
    format!("{}\0{}", owner, key)
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    #[tracing::instrument(name = "queue.enqueue", skip_all, fields(pipeline = %task.pipeline_ref))]
    async fn enqueue(&self, task: NewTask) -> Result<TaskId, QueueError> {
        self.with_state(|state, now, _| {
            let key = task.dedup_key.as_deref().map(|key| dedup_key(&task.owner, key));
            if let Some((existing, _)) = key.as_ref().and_then(|key| state.dedup.get(key)) {
                tracing::debug!(task_id = %existing, "Duplicate submission; returning existing task");
                return Ok(existing.clone());
            }

            let task_id = TaskId::new();
            let seq = state.next_seq;
            state.next_seq += 1;

            if let Some(key) = key {
                state.dedup.insert(key, (task_id.clone(), now));
            }
            state.entries.insert(
                task_id.clone(),
                Entry {
                    task: Task::from_submission(task_id.clone(), task, now),
                    lease: None,
                    seq,
                },
            );
            state.push_ready(&task_id);

            tracing::info!(task_id = %task_id, "Task enqueued");
            metrics::counter!("jobplane_queue_enqueued_total").increment(1);
            Ok(task_id)
        })
        .await
    }

    async fn claim(&self, visibility_timeout: Duration) -> Result<Option<ClaimedTask>, QueueError> {
        self.with_state(|state, now, _| {
            let Some((_, _, task_id)) = state.ready.pop_first() else {
                return Ok(None);
            };
            let entry = state
                .entries
                .get_mut(&task_id)
                .ok_or_else(|| QueueError::NotFound(task_id.clone()))?;

            let lease = Lease {
                lease_id: create_id(),
                expires_at: now + visibility_timeout,
            };
            entry.task.attempt_count += 1;
            entry.task.advance(TaskStatus::Claimed, now);
            entry.lease = Some(lease.clone());

            let claimed = ClaimedTask {
                task: entry.task.clone(),
                receipt: DeliveryReceipt {
                    task_id: task_id.clone(),
                    lease_id: lease.lease_id,
                    attempt: entry.task.attempt_count,
                    expires_at: lease.expires_at,
                },
            };
            state.leases.insert((lease.expires_at, task_id));

            metrics::counter!("jobplane_queue_claimed_total").increment(1);
            Ok(Some(claimed))
        })
        .await
    }

    async fn ack(&self, receipt: &DeliveryReceipt) -> Result<(), QueueError> {
        self.with_state(|state, now, _| {
            let entry = state.leased(receipt)?;
            let from = entry.task.status;
            if !entry.task.advance(TaskStatus::Succeeded, now) {
                return Err(QueueError::InvalidTransition {
                    from,
                    to: TaskStatus::Succeeded,
                });
            }
            state.release(&receipt.task_id);
            tracing::info!(task_id = %receipt.task_id, attempt = receipt.attempt, "Task acknowledged");
            Ok(())
        })
        .await
    }

    async fn extend(
        &self,
        receipt: &DeliveryReceipt,
        by: Duration,
    ) -> Result<DeliveryReceipt, QueueError> {
        self.with_state(|state, _, _| {
            let entry = state.leased(receipt)?;
            let Some(lease) = entry.lease.as_mut() else {
                return Err(QueueError::StaleReceipt);
            };
            let previous = lease.expires_at;
            lease.expires_at = previous + by.max(Duration::zero());
            let expires_at = lease.expires_at;

            state.leases.remove(&(previous, receipt.task_id.clone()));
            state.leases.insert((expires_at, receipt.task_id.clone()));

            tracing::debug!(task_id = %receipt.task_id, expires_at = %expires_at, "Lease extended");
            Ok(DeliveryReceipt {
                expires_at,
                ..receipt.clone()
            })
        })
        .await
    }

    async fn nack(
        &self,
        receipt: &DeliveryReceipt,
        kind: ErrorKind,
        message: &str,
    ) -> Result<NackOutcome, QueueError> {
        self.with_state(|state, now, alerts| {
            let attempt = state.leased(receipt)?.task.attempt_count;

            if !kind.is_retryable() || attempt >= self.config.max_attempts {
                let reason = format!("{}: {}", kind, message);
                alerts.extend(state.dead_letter(&receipt.task_id, TaskStatus::Failed, reason, now));
                return Ok(NackOutcome::DeadLettered);
            }

            state.release(&receipt.task_id);
            if let Some(entry) = state.entries.get_mut(&receipt.task_id) {
                entry.task.last_error = Some(TaskError {
                    kind,
                    message: message.to_string(),
                    attempt,
                });
                entry.task.requeue(now);
            }
            state.push_ready(&receipt.task_id);

            tracing::info!(task_id = %receipt.task_id, attempt, kind = %kind, "Task returned to queue");
            Ok(NackOutcome::Requeued)
        })
        .await
    }

    async fn mark(&self, receipt: &DeliveryReceipt, status: TaskStatus) -> Result<(), QueueError> {
        self.with_state(|state, now, _| {
            let entry = state.leased(receipt)?;
            let from = entry.task.status;
            let allowed = matches!(status, TaskStatus::Assigned | TaskStatus::Running);
            if !allowed || !entry.task.advance(status, now) {
                return Err(QueueError::InvalidTransition { from, to: status });
            }
            Ok(())
        })
        .await
    }

    async fn cancel(&self, task_id: &TaskId) -> Result<Task, QueueError> {
        self.with_state(|state, now, _| {
            let entry = state
                .entries
                .get_mut(task_id)
                .ok_or_else(|| QueueError::NotFound(task_id.clone()))?;

            if entry.lease.is_some() || !entry.task.advance(TaskStatus::Cancelled, now) {
                return Err(QueueError::NotCancellable(entry.task.status));
            }
            let key = (Reverse(entry.task.priority), entry.seq, task_id.clone());
            let task = entry.task.clone();
            state.ready.remove(&key);

            tracing::info!(task_id = %task_id, "Task cancelled");
            Ok(task)
        })
        .await
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<Task>, QueueError> {
        Ok(self
            .with_state(|state, _, _| state.entries.get(task_id).map(|entry| entry.task.clone()))
            .await)
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self.with_state(|state, _, _| state.dead.clone()).await)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(self.with_state(|state, _, _| {
            let count = |status: TaskStatus| {
                state
                    .entries
                    .values()
                    .filter(|entry| entry.task.status == status)
                    .count()
            };
            QueueStats {
                ready: state.ready.len(),
                in_flight: state.leases.len(),
                succeeded: count(TaskStatus::Succeeded),
                dead_lettered: state.dead.len(),
                cancelled: count(TaskStatus::Cancelled),
            }
        })
        .await)
    }
}
