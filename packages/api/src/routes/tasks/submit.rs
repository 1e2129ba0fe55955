use crate::{
    credentials::Scope, error::ApiError, middleware::jwt::AuthUser, state::AppState,
};
use axum::{Extension, Json, extract::State, http::StatusCode};
use jobplane_storage::parse_locator;
use jobplane_types::{NewTask, TaskId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitTaskRequest {
    pub pipeline_ref: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub input_locator: String,
    pub output_locator: String,
    #[serde(default)]
    pub priority: i32,
    pub dedup_key: Option<String>,
    pub expected_duration_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: TaskId,
}

#[tracing::instrument(name = "POST /tasks", skip(state, user, request), fields(pipeline_ref = %request.pipeline_ref))]
pub async fn submit_task(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<SubmitTaskResponse>), ApiError> {
    let identity = user.require(Scope::TaskSubmit)?;

    if request.pipeline_ref.trim().is_empty() {
        return Err(ApiError::bad_request("pipeline_ref must not be empty"));
    }
    parse_locator(&request.input_locator)?;
    parse_locator(&request.output_locator)?;
    if request.dedup_key.as_deref().is_some_and(|key| key.is_empty()) {
        return Err(ApiError::bad_request("dedup_key must not be empty"));
    }

    let task_id = state
        .queue
        .enqueue(NewTask {
            pipeline_ref: request.pipeline_ref,
            parameters: request.parameters,
            input_locator: request.input_locator,
            output_locator: request.output_locator,
            priority: request.priority,
            owner: identity.subject.clone(),
            dedup_key: request.dedup_key,
            expected_duration_secs: request.expected_duration_secs,
        })
        .await?;

    tracing::info!(task_id = %task_id, owner = %identity.subject, "Task submitted");
    Ok((StatusCode::ACCEPTED, Json(SubmitTaskResponse { task_id })))
}
