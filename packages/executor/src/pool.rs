use jobplane_types::{
    async_trait,
    chrono::{DateTime, Utc},
    create_id, SharedClock, TaskId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::auth::{Authorization, PoolGrant, WorkerAuth, WorkerAuthPolicy};
use crate::config::WorkerConfig;
use crate::error::ExecutorError;
use crate::execute::execute;
use crate::handler::HandlerRegistry;
use crate::reporter::StatusReporter;
use crate::transfer::ObjectTransfer;
use crate::types::{Assignment, ExecutionResult};

#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Two-factor check of the caller. Must precede every assignment batch.
    async fn authorize(&self, auth: &WorkerAuth) -> Authorization;

    /// Free worker slots right now.
    fn available(&self) -> usize;

    /// Start one attempt of a task on a worker. Refused without a live grant.
    async fn assign(&self, grant: &PoolGrant, assignment: Assignment) -> Result<WorkerRun, ExecutorError>;
}

#[derive(Debug)]
pub enum WorkerOutcome {
    Completed(ExecutionResult),
    Failed(ExecutorError),
    /// The worker died without reporting; its lease is left to lapse.
    Crashed(String),
}

/// Handle on a running worker.
#[derive(Debug)]
pub struct WorkerRun {
    pub task_id: TaskId,
    pub attempt: u32,
    handle: JoinHandle<Result<ExecutionResult, ExecutorError>>,
}

impl WorkerRun {
    pub async fn outcome(self) -> WorkerOutcome {
        match self.handle.await {
            Ok(Ok(result)) => WorkerOutcome::Completed(result),
            Ok(Err(e)) => WorkerOutcome::Failed(e),
            Err(e) => WorkerOutcome::Crashed(e.to_string()),
        }
    }
}

struct PoolInner {
    config: WorkerConfig,
    policy: WorkerAuthPolicy,
    registry: Arc<HandlerRegistry>,
    transfer: Arc<dyn ObjectTransfer>,
    reporter: Option<Arc<dyn StatusReporter>>,
    clock: SharedClock,
    slots: Arc<Semaphore>,
    warm: AtomicUsize,
    grants: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl PoolInner {
    fn rewarm(&self) {
        let prewarm = self.config.prewarm;
        let _ = self
            .warm
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |warm| {
                (warm < prewarm).then_some(warm + 1)
            });
    }

    fn take_warm(&self) -> bool {
        self.warm
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |warm| warm.checked_sub(1))
            .is_ok()
    }
}

/// Returns the worker to the warm set when its task ends, including by panic.
struct WarmGuard(Arc<PoolInner>);

impl Drop for WarmGuard {
    fn drop(&mut self) {
        self.0.rewarm();
    }
}

/// In-process worker pool. Every worker is a separate tokio task with its own
/// copy of the assignment; workers share nothing mutable.
#[derive(Clone)]
pub struct LocalWorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for LocalWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalWorkerPool")
            .field("capacity", &self.inner.config.capacity)
            .field("available", &self.available())
            .field("warm", &self.warm())
            .finish()
    }
}

impl LocalWorkerPool {
    pub fn new(
        config: WorkerConfig,
        policy: WorkerAuthPolicy,
        registry: HandlerRegistry,
        transfer: Arc<dyn ObjectTransfer>,
        clock: SharedClock,
    ) -> Self {
        let capacity = config.capacity.max(1);
        let prewarm = config.prewarm.min(capacity);
        Self {
            inner: Arc::new(PoolInner {
                config: WorkerConfig {
                    capacity,
                    prewarm,
                    ..config
                },
                policy,
                registry: Arc::new(registry),
                transfer,
                reporter: None,
                clock,
                slots: Arc::new(Semaphore::new(capacity)),
                warm: AtomicUsize::new(prewarm),
                grants: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Attach the status callback used by workers for progress reports.
    /// Must be called before the pool is shared.
    pub fn with_reporter(self, reporter: Arc<dyn StatusReporter>) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.reporter = Some(reporter);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                tracing::warn!("Worker pool already shared; reporter not attached");
                Self { inner }
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }

    pub fn warm(&self) -> usize {
        self.inner.warm.load(Ordering::SeqCst)
    }

    fn grant_is_live(&self, grant: &PoolGrant, now: DateTime<Utc>) -> bool {
        let mut grants = self.inner.grants.lock();
        grants.retain(|_, expires_at| *expires_at > now);
        grants.contains_key(&grant.grant_id)
    }
}

#[async_trait]
impl WorkerPool for LocalWorkerPool {
    async fn authorize(&self, auth: &WorkerAuth) -> Authorization {
        let now = self.inner.clock.now();

        if let Some(reason) = self.inner.policy.check(auth, now) {
            tracing::warn!(source_ip = %auth.source_ip, reason = %reason, "Worker pool authorization denied");
            return Authorization::Denied(reason);
        }

        let grant = PoolGrant {
            grant_id: create_id(),
            issued_at: now,
            expires_at: self.inner.policy.totp().step_end(now),
        };
        self.inner
            .grants
            .lock()
            .insert(grant.grant_id.clone(), grant.expires_at);

        tracing::debug!(expires_at = %grant.expires_at, "Worker pool authorization granted");
        Authorization::Authorized(grant)
    }

    fn available(&self) -> usize {
        self.inner.slots.available_permits()
    }

    async fn assign(&self, grant: &PoolGrant, assignment: Assignment) -> Result<WorkerRun, ExecutorError> {
        let now = self.inner.clock.now();
        if !self.grant_is_live(grant, now) {
            return Err(ExecutorError::Unauthorized(
                "grant expired or not issued by this pool".into(),
            ));
        }

        let permit = self
            .inner
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| ExecutorError::Saturated)?;

        let warm = self.inner.take_warm();
        let inner = self.inner.clone();
        let task_id = assignment.task_id.clone();
        let attempt = assignment.attempt;

        tracing::info!(task_id = %task_id, attempt, warm, "Assigning task to worker");

        let handle = tokio::spawn(async move {
            let _permit = permit;
            let _guard = WarmGuard(inner.clone());

            if !warm {
                tokio::time::sleep(inner.config.cold_start_delay()).await;
            }

            execute(
                &assignment,
                &inner.registry,
                inner.transfer.as_ref(),
                inner.reporter.as_deref(),
                &inner.clock,
            )
            .await
        });

        Ok(WorkerRun {
            task_id,
            attempt,
            handle,
        })
    }
}
