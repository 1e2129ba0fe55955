//! Public verification keys of the credential vendor.

use crate::credentials::Jwks;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;

#[tracing::instrument(name = "GET /.well-known/jwks.json", skip(state))]
pub async fn get_jwks(State(state): State<AppState>) -> Json<Jwks> {
    Json(state.vendor.jwks())
}
