use crate::{
    credentials::Scope, error::ApiError, middleware::jwt::AuthUser, state::AppState,
};
use axum::{
    Extension, Json,
    extract::{Path, State},
};
use jobplane_types::{Task, TaskId};

#[tracing::instrument(name = "GET /tasks/{task_id}", skip(state, user))]
pub async fn get_task(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let identity = user.require(Scope::TaskRead)?;
    let task = super::visible_task(&state, identity, &TaskId::from(task_id)).await?;
    Ok(Json(task))
}
