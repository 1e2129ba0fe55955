//! jobplane control plane
//!
//! Task submission, the job queue, short-lived credentials, identity
//! verification, the dispatcher and the HTTP surface tying them together.
//! Workers live in `jobplane-executor`; object storage behind pre-signed URLs
//! in `jobplane-storage`.

use std::sync::Arc;

use axum::{Router, middleware::from_fn_with_state, routing::get};
use middleware::jwt::jwt_middleware;
use state::State;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

mod middleware;
mod routes;

pub mod alerting;
pub mod config;
pub mod credentials;
pub mod error;
pub mod execution;
pub mod identity;
pub mod platform;
pub mod state;

pub use axum;
pub mod auth {
    use crate::middleware;
    pub use middleware::jwt::AuthUser;
}

pub use platform::{Platform, PlatformBuilder};

pub fn construct_router(state: Arc<State>) -> Router {
    let objects = jobplane_storage::object_routes(state.gateway.clone());

    Router::new()
        .nest("/health", routes::health::routes())
        .nest("/tasks", routes::tasks::routes())
        .nest("/dead-letters", routes::dead_letters::routes())
        .route("/.well-known/jwks.json", get(routes::jwks::get_jwks))
        .with_state(state.clone())
        .layer(from_fn_with_state(state, jwt_middleware))
        // Pre-signed object URLs carry their own authorization.
        .merge(objects)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
