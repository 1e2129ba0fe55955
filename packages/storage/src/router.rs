use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;

use crate::{error::TransferError, presign::SignedQuery, store::ObjectGateway};

/// Object routes redeemed with pre-signed URLs. Mounted by the control plane;
/// the gateway state is bound here so the router merges into any parent.
pub fn object_routes<S>(gateway: ObjectGateway) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/objects/{*path}", get(read_object).put(write_object))
        .with_state(gateway)
}

async fn read_object(
    State(gateway): State<ObjectGateway>,
    Path(path): Path<String>,
    Query(query): Query<SignedQuery>,
) -> Result<Bytes, TransferError> {
    gateway.read_parts(&path, &query).await
}

async fn write_object(
    State(gateway): State<ObjectGateway>,
    Path(path): Path<String>,
    Query(query): Query<SignedQuery>,
    body: Bytes,
) -> Result<StatusCode, TransferError> {
    gateway.write_parts(&path, &query, body).await?;
    Ok(StatusCode::NO_CONTENT)
}

impl TransferError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TransferError::AccessExpired => StatusCode::GONE,
            TransferError::AccessDenied(_) => StatusCode::FORBIDDEN,
            TransferError::Malformed(_) | TransferError::InvalidLocator(_) => StatusCode::BAD_REQUEST,
            TransferError::NotFound(_) => StatusCode::NOT_FOUND,
            TransferError::Storage(_) | TransferError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TransferError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Object transfer failed");
        } else {
            tracing::warn!(error = %self, "Object transfer rejected");
        }

        // Internal storage details stay in the logs.
        let message = if status.is_server_error() {
            "Internal storage error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": {
                "code": self.kind().as_str().to_uppercase(),
                "message": message,
            }
        }));
        (status, body).into_response()
    }
}
