//! Wiring for a complete control plane with an in-process worker pool.

use std::sync::Arc;

use base64::Engine;
use jobplane_executor::{
    HandlerRegistry, HttpStatusReporter, HttpTransfer, LocalTransfer, LocalWorkerPool,
    ObjectTransfer, StatusReporter, Totp, WorkerAuthPolicy, WorkerTransport,
};
use jobplane_storage::{JobplaneStore, ObjectGateway, UrlSigner};
use jobplane_types::{SharedClock, SystemClock, anyhow};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::alerting::{AlertSink, LogAlertSink};
use crate::config::PlatformConfig;
use crate::credentials::{CredentialVendor, SigningKey};
use crate::execution::{
    AuthorizedQueue, Dispatcher, DispatcherContext, InMemoryQueue, JobQueue, LogStatusSink,
    StatusIntake, StatusSink,
};
use crate::identity::{IdentityVerifier, JwksKeySource, KeySource};
use crate::state::{AppState, State};

pub struct Platform {
    pub state: AppState,
    pub dispatcher: Dispatcher,
    pub pool: Arc<LocalWorkerPool>,
}

impl Platform {
    pub fn builder(config: PlatformConfig) -> PlatformBuilder {
        PlatformBuilder::new(config)
    }

    pub fn router(&self) -> axum::Router {
        crate::construct_router(self.state.clone())
    }

    /// Run the dispatch loop until `shutdown` fires.
    pub fn spawn_dispatcher(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move { dispatcher.run(shutdown).await })
    }
}

pub struct PlatformBuilder {
    config: PlatformConfig,
    clock: Option<SharedClock>,
    registry: Option<HandlerRegistry>,
    signing_key: Option<SigningKey>,
    totp_secret: Option<Vec<u8>>,
    dispatcher_totp_secret: Option<Vec<u8>>,
    status_sink: Option<Arc<dyn StatusSink>>,
    alert_sink: Option<Arc<dyn AlertSink>>,
    store: Option<JobplaneStore>,
}

impl PlatformBuilder {
    pub fn new(config: PlatformConfig) -> Self {
        Self {
            config,
            clock: None,
            registry: None,
            signing_key: None,
            totp_secret: None,
            dispatcher_totp_secret: None,
            status_sink: None,
            alert_sink: None,
            store: None,
        }
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    /// Shared secret of the worker pool's one-time codes.
    pub fn totp_secret(mut self, secret: Vec<u8>) -> Self {
        self.totp_secret = Some(secret);
        self
    }

    /// Secret the dispatcher generates codes from. Defaults to the pool's.
    pub fn dispatcher_totp_secret(mut self, secret: Vec<u8>) -> Self {
        self.dispatcher_totp_secret = Some(secret);
        self
    }

    pub fn status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status_sink = Some(sink);
        self
    }

    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    pub fn store(mut self, store: JobplaneStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> jobplane_types::Result<Platform> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let alerts = self
            .alert_sink
            .unwrap_or_else(|| Arc::new(LogAlertSink) as Arc<dyn AlertSink>);
        let sink = self
            .status_sink
            .unwrap_or_else(|| Arc::new(LogStatusSink) as Arc<dyn StatusSink>);

        let key = match self.signing_key {
            Some(key) => key,
            None => SigningKey::from_env_or_generate()?,
        };
        let vendor = Arc::new(CredentialVendor::new(
            key,
            config.credentials.clone(),
            clock.clone(),
        ));

        let source: Arc<dyn KeySource> = match &config.identity.jwks_url {
            Some(url) => Arc::new(JwksKeySource::new(url.clone())),
            None => vendor.clone(),
        };
        let verifier = Arc::new(IdentityVerifier::new(
            source,
            config.identity.clone(),
            clock.clone(),
        ));

        let queue: Arc<dyn JobQueue> = Arc::new(
            InMemoryQueue::new(config.queue.clone(), clock.clone(), alerts.clone())
                .with_status_sink(sink.clone()),
        );

        let store = match self.store {
            Some(store) => store,
            None => match &config.storage.root {
                Some(root) => JobplaneStore::local(root)?,
                None => JobplaneStore::memory(),
            },
        };
        let signer = match &config.storage.url_secret {
            Some(secret) => UrlSigner::new(secret.as_bytes().to_vec(), config.storage.base_url.clone()),
            None => UrlSigner::with_random_secret(config.storage.base_url.clone())?,
        };
        let gateway = ObjectGateway::new(store, signer, clock.clone());

        let intake = Arc::new(StatusIntake::new(
            verifier.clone(),
            queue.clone(),
            sink.clone(),
        ));

        let pool_secret = match self.totp_secret {
            Some(secret) => secret,
            None => match &config.dispatch.totp_secret {
                Some(encoded) => base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| anyhow!("JOBPLANE_TOTP_SECRET is not valid base64: {}", e))?,
                None => Totp::generate_secret()
                    .map_err(|e| anyhow!("Failed to generate one-time code secret: {}", e))?,
            },
        };
        let dispatcher_secret = self
            .dispatcher_totp_secret
            .unwrap_or_else(|| pool_secret.clone());

        // Over HTTP, workers reach storage and the callback through the
        // public URL, the same way an out-of-process worker does.
        let (transfer, reporter): (Arc<dyn ObjectTransfer>, Arc<dyn StatusReporter>) =
            match config.worker.transport {
                WorkerTransport::Local => (
                    Arc::new(LocalTransfer::new(gateway.clone())) as Arc<dyn ObjectTransfer>,
                    intake.clone() as Arc<dyn StatusReporter>,
                ),
                WorkerTransport::Http => (
                    Arc::new(HttpTransfer::new(config.worker.transfer_timeout())) as Arc<dyn ObjectTransfer>,
                    Arc::new(HttpStatusReporter::new(
                        config.storage.base_url.clone(),
                        &config.worker,
                    )) as Arc<dyn StatusReporter>,
                ),
            };

        let pool = Arc::new(
            LocalWorkerPool::new(
                config.worker.clone(),
                WorkerAuthPolicy::from_config(&config.worker, pool_secret),
                self.registry.unwrap_or_else(HandlerRegistry::with_builtins),
                transfer,
                clock.clone(),
            )
            .with_reporter(reporter),
        );

        let dispatcher = Dispatcher::new(DispatcherContext {
            queue: AuthorizedQueue::new(queue.clone(), verifier.clone()),
            vendor: vendor.clone(),
            verifier: verifier.clone(),
            pool: pool.clone(),
            gateway: gateway.clone(),
            sink,
            alerts: alerts.clone(),
            totp: Totp::from_config(dispatcher_secret, &config.worker),
            config: config.dispatch.clone(),
            visibility_timeout: config.queue.visibility_timeout(),
            clock: clock.clone(),
        });

        tracing::info!(
            capacity = pool.capacity(),
            transport = %config.worker.transport,
            issuer = %config.credentials.issuer,
            "Platform assembled"
        );

        let state = Arc::new(State {
            config,
            clock,
            vendor,
            verifier,
            queue,
            gateway,
            intake,
            alerts,
        });

        Ok(Platform {
            state,
            dispatcher,
            pool,
        })
    }
}
