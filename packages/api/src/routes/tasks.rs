use crate::{
    credentials::Role, error::ApiError, identity::Identity, state::AppState,
};
use axum::{
    Router,
    routing::{get, post},
};
use jobplane_types::{Task, TaskId};

pub mod cancel;
pub mod get_task;
pub mod report_status;
pub mod submit;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(submit::submit_task))
        .route(
            "/{task_id}",
            get(get_task::get_task).delete(cancel::cancel_task),
        )
        .route("/{task_id}/status", post(report_status::report_status))
}

/// Looks a task up for `identity`. Tasks owned by someone else are reported
/// as missing unless the caller is an operator.
pub(crate) async fn visible_task(
    state: &AppState,
    identity: &Identity,
    task_id: &TaskId,
) -> Result<Task, ApiError> {
    let task = state
        .queue
        .get(task_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Task {} not found", task_id)))?;

    if task.owner != identity.subject && identity.role != Role::Operator {
        return Err(ApiError::not_found(format!("Task {} not found", task_id)));
    }
    Ok(task)
}
