use std::sync::Arc;

use jobplane_storage::ObjectGateway;
use jobplane_types::SharedClock;

use crate::alerting::AlertSink;
use crate::config::PlatformConfig;
use crate::credentials::CredentialVendor;
use crate::execution::{JobQueue, StatusIntake};
use crate::identity::IdentityVerifier;

pub type AppState = Arc<State>;

/// Shared control-plane components. Built once by
/// [`PlatformBuilder`](crate::platform::PlatformBuilder) and handed to every
/// route through axum state.
pub struct State {
    pub config: PlatformConfig,
    pub clock: SharedClock,
    pub vendor: Arc<CredentialVendor>,
    pub verifier: Arc<IdentityVerifier>,
    pub queue: Arc<dyn JobQueue>,
    pub gateway: ObjectGateway,
    pub intake: Arc<StatusIntake>,
    pub alerts: Arc<dyn AlertSink>,
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("bind", &self.config.server.bind)
            .field("verifier", &self.verifier)
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}
