use crate::error::ApiError;
use crate::execution::QueueStats;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use axum::{Router, routing::get};
use serde::{Deserialize, Serialize};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(health))
        .route("/queue", get(queue_health))
}

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[tracing::instrument(name = "GET /health")]
pub async fn health() -> Result<Json<HealthResponse>, ApiError> {
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
    }))
}

/// Queue depth by state. Counts only, no task contents.
#[tracing::instrument(name = "GET /health/queue", skip(state))]
pub async fn queue_health(State(state): State<AppState>) -> Result<Json<QueueStats>, ApiError> {
    Ok(Json(state.queue.stats().await?))
}
