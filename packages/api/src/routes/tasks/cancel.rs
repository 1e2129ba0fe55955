use crate::{
    credentials::Scope, error::ApiError, middleware::jwt::AuthUser, state::AppState,
};
use axum::{
    Extension, Json,
    extract::{Path, State},
};
use jobplane_types::{Task, TaskId};

/// Only tasks still waiting in the queue can be cancelled.
#[tracing::instrument(name = "DELETE /tasks/{task_id}", skip(state, user))]
pub async fn cancel_task(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let identity = user.require(Scope::TaskCancel)?;
    let task_id = TaskId::from(task_id);
    super::visible_task(&state, identity, &task_id).await?;

    let task = state.queue.cancel(&task_id).await?;
    tracing::info!(task_id = %task_id, by = %identity.subject, "Task cancelled");
    Ok(Json(task))
}
