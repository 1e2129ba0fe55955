#![allow(dead_code)]

use std::sync::Arc;

use jobplane_api::Platform;
use jobplane_api::alerting::MemoryAlertSink;
use jobplane_api::config::PlatformConfig;
use jobplane_api::credentials::{AccessToken, Role, Scope, Subject};
use jobplane_api::execution::MemoryStatusSink;
use jobplane_executor::{HandlerContext, HandlerRegistry, TaskHandler};
use jobplane_types::{
    ManualClock, NewTask, Result, TaskId, async_trait, bytes::Bytes, chrono::Duration,
};

pub const FLAKY: &str = "test/flaky";

pub struct Harness {
    pub clock: ManualClock,
    pub platform: Platform,
    pub statuses: Arc<MemoryStatusSink>,
    pub alerts: Arc<MemoryAlertSink>,
}

impl Harness {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self::with_config(config(), registry)
    }

    pub fn with_config(config: PlatformConfig, registry: HandlerRegistry) -> Self {
        Self::build(ManualClock::starting_now(), config, registry)
    }

    /// For handlers that need to drive the same clock as the platform.
    pub fn build(clock: ManualClock, config: PlatformConfig, registry: HandlerRegistry) -> Self {
        let statuses = Arc::new(MemoryStatusSink::default());
        let alerts = Arc::new(MemoryAlertSink::default());
        let platform = Platform::builder(config)
            .clock(clock.shared())
            .registry(registry)
            .status_sink(statuses.clone())
            .alert_sink(alerts.clone())
            .totp_secret(b"integration-secret".to_vec())
            .build()
            .unwrap();
        Self {
            clock,
            platform,
            statuses,
            alerts,
        }
    }

    pub fn token(&self, subject: &str, role: Role, scopes: &[Scope]) -> AccessToken {
        self.platform
            .state
            .vendor
            .issue(&Subject::new(subject, role), scopes)
            .unwrap()
    }

    pub async fn put_input(&self, locator: &str, body: &'static [u8]) {
        self.platform
            .state
            .gateway
            .put_object(locator, Bytes::from_static(body))
            .await
            .unwrap();
    }

    pub async fn submit(&self, pipeline_ref: &str, name: &str) -> TaskId {
        self.put_input(&format!("in/{}", name), b"payload").await;
        self.platform
            .state
            .queue
            .enqueue(NewTask {
                pipeline_ref: pipeline_ref.into(),
                parameters: serde_json::Value::Null,
                input_locator: format!("in/{}", name),
                output_locator: format!("out/{}", name),
                priority: 0,
                owner: "alice".into(),
                dedup_key: None,
                expected_duration_secs: None,
            })
            .await
            .unwrap()
    }

    /// Moves time past the queue's visibility timeout.
    pub fn lapse_lease(&self) {
        let visibility = self.platform.state.config.queue.visibility_timeout();
        self.clock.advance(visibility + Duration::seconds(1));
    }
}

pub fn config() -> PlatformConfig {
    let mut config = PlatformConfig::default();
    config.worker.cold_start_ms = 0;
    config.worker.capacity = 4;
    config
}

/// Upper-cases its input, but the worker process dies on the first
/// `crash_until` attempts.
pub struct CrashingHandler {
    pub crash_until: u32,
}

#[async_trait]
impl TaskHandler for CrashingHandler {
    async fn run(&self, ctx: &HandlerContext, input: Bytes) -> Result<Bytes> {
        if ctx.attempt <= self.crash_until {
            panic!("worker process died on attempt {}", ctx.attempt);
        }
        let text = String::from_utf8_lossy(&input).to_uppercase();
        Ok(Bytes::from(text))
    }
}

/// Produces its output, then stalls long enough for the lease to lapse
/// before the dispatcher can acknowledge. Only on the first attempt.
pub struct SlowFirstAttempt {
    pub clock: ManualClock,
    pub stall: Duration,
}

#[async_trait]
impl TaskHandler for SlowFirstAttempt {
    async fn run(&self, ctx: &HandlerContext, input: Bytes) -> Result<Bytes> {
        if ctx.attempt == 1 {
            self.clock.advance(self.stall);
        }
        let digest = blake3::hash(&input).to_hex().to_string();
        Ok(Bytes::from(digest))
    }
}

pub fn registry_with(name: &str, handler: impl TaskHandler + 'static) -> HandlerRegistry {
    let mut registry = HandlerRegistry::with_builtins();
    registry.register(name, handler);
    registry
}
