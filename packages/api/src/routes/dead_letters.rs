use crate::{
    credentials::Scope, error::ApiError, execution::DeadLetter, middleware::jwt::AuthUser,
    state::AppState,
};
use axum::{Extension, Json, Router, extract::State, routing::get};

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(list_dead_letters))
}

#[tracing::instrument(name = "GET /dead-letters", skip(state, user))]
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<DeadLetter>>, ApiError> {
    user.require(Scope::DeadLetterRead)?;
    Ok(Json(state.queue.dead_letters().await?))
}
