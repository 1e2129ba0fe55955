use crate::{error::ApiError, middleware::jwt::AuthUser, state::AppState};
use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use jobplane_types::{StatusReport, TaskId};

/// Worker progress callback. The bearer must be a callback token bound to
/// this task.
#[tracing::instrument(name = "POST /tasks/{task_id}/status", skip(state, user, report), fields(status = %report.status))]
pub async fn report_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(task_id): Path<String>,
    Json(report): Json<StatusReport>,
) -> Result<StatusCode, ApiError> {
    let identity = user.identity()?;
    state
        .intake
        .accept(identity, &TaskId::from(task_id), report)
        .await?;
    Ok(StatusCode::ACCEPTED)
}
