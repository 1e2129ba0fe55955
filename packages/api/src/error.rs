use axum::{
    Json,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use jobplane_storage::TransferError;
use jobplane_types::ErrorKind;
use serde::Serialize;

use crate::credentials::CredentialError;
use crate::execution::{QueueError, StatusError};
use crate::identity::{CapabilityError, VerifyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportPolicy {
    Ignore,
    Report,
}

/// Attached to the response extensions of reported errors so outer layers
/// can correlate logs with the `x-error-id` header.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub id: String,
    pub status_code: u16,
    pub public_code: String,
    pub summary: String,
}

#[derive(Debug, Clone)]
pub struct ApiError {
    status: StatusCode,
    public_code: &'static str,
    public_message: Option<String>,
    report_policy: ReportPolicy,
    report_summary: Option<String>,
}

impl ApiError {
    fn new(
        status: StatusCode,
        public_code: &'static str,
        public_message: Option<String>,
        report_policy: ReportPolicy,
    ) -> Self {
        Self {
            status,
            public_code,
            public_message,
            report_policy,
            report_summary: None,
        }
    }

    fn with_report(mut self, summary: impl Into<String>) -> Self {
        self.report_summary = Some(summary.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.public_code
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!("Internal error: {}", msg);
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            None,
            ReportPolicy::Report,
        )
        .with_report(msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::warn!("Not found: {}", msg);
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", Some(msg), ReportPolicy::Ignore)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::warn!("Bad request: {}", msg);
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", Some(msg), ReportPolicy::Ignore)
    }

    /// Identity could not be established. The reason stays in the logs.
    pub fn auth_denied(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::warn!("Authentication denied: {}", msg);
        Self::new(
            StatusCode::UNAUTHORIZED,
            "AUTH_DENIED",
            Some("Authentication required".to_string()),
            ReportPolicy::Ignore,
        )
    }

    /// Identity is known but lacks the capability.
    pub fn forbidden(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::warn!("Forbidden: {}", msg);
        Self::new(StatusCode::FORBIDDEN, "AUTH_DENIED", Some(msg), ReportPolicy::Ignore)
    }

    pub fn scope_denied(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::warn!("Scope denied: {}", msg);
        Self::new(StatusCode::FORBIDDEN, "SCOPE_DENIED", Some(msg), ReportPolicy::Ignore)
    }

    pub fn access_denied(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::warn!("Access denied: {}", msg);
        Self::new(StatusCode::FORBIDDEN, "ACCESS_DENIED", Some(msg), ReportPolicy::Ignore)
    }

    pub fn access_expired(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::warn!("Access expired: {}", msg);
        Self::new(StatusCode::GONE, "ACCESS_EXPIRED", Some(msg), ReportPolicy::Ignore)
    }

    pub fn conflict(code: &'static str, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::warn!("Conflict: {}", msg);
        Self::new(StatusCode::CONFLICT, code, Some(msg), ReportPolicy::Ignore)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorEnvelope<'a> {
            error: ErrorBody<'a>,
        }

        #[derive(Serialize)]
        struct ErrorBody<'a> {
            code: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            id: Option<&'a str>,
            message: &'a str,
        }

        let public_message = self
            .public_message
            .as_deref()
            .unwrap_or_else(|| self.status.canonical_reason().unwrap_or("Error"));

        let error_id = (self.report_policy == ReportPolicy::Report).then(jobplane_types::create_id);

        let mut response = (
            self.status,
            Json(ErrorEnvelope {
                error: ErrorBody {
                    code: self.public_code,
                    id: error_id.as_deref(),
                    message: public_message,
                },
            }),
        )
            .into_response();

        if let Some(id) = error_id.as_deref() {
            if let Ok(v) = HeaderValue::from_str(id) {
                response.headers_mut().insert("x-error-id", v);
            }

            response.extensions_mut().insert(ErrorReport {
                id: id.to_string(),
                status_code: self.status.as_u16(),
                public_code: self.public_code.to_string(),
                summary: self
                    .report_summary
                    .clone()
                    .unwrap_or_else(|| public_message.to_string()),
            });
        }

        response
    }
}

impl From<jobplane_types::Error> for ApiError {
    fn from(err: jobplane_types::Error) -> Self {
        Self::internal(format!("{:?}", err))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        // Parsing errors are typically user-caused.
        Self::bad_request(format!("JSON error: {}", err))
    }
}

impl From<VerifyError> for ApiError {
    fn from(err: VerifyError) -> Self {
        Self::auth_denied(err.to_string())
    }
}

impl From<CapabilityError> for ApiError {
    fn from(err: CapabilityError) -> Self {
        Self::forbidden(err.to_string())
    }
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        match err.kind() {
            ErrorKind::ScopeDenied => Self::scope_denied(err.to_string()),
            _ => Self::internal(err.to_string()),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(id) => Self::not_found(format!("Task {} not found", id)),
            QueueError::StaleReceipt => Self::conflict("STALE_RECEIPT", err.to_string()),
            QueueError::NotCancellable(_) => Self::conflict("NOT_CANCELLABLE", err.to_string()),
            QueueError::InvalidTransition { .. } => Self::conflict("CONFLICT", err.to_string()),
            QueueError::Auth(e) => e.into(),
            QueueError::Capability(e) => e.into(),
        }
    }
}

impl From<StatusError> for ApiError {
    fn from(err: StatusError) -> Self {
        match err {
            StatusError::Auth(e) => e.into(),
            StatusError::Capability(e) => e.into(),
            StatusError::Queue(e) => e.into(),
            StatusError::NotFound(id) => Self::not_found(format!("Task {} not found", id)),
            StatusError::Rejected(msg) => Self::conflict("REPORT_REJECTED", msg),
            StatusError::Sink(msg) => Self::internal(msg),
        }
    }
}

impl From<TransferError> for ApiError {
    fn from(err: TransferError) -> Self {
        match err.kind() {
            ErrorKind::AccessExpired => Self::access_expired(err.to_string()),
            ErrorKind::AccessDenied => Self::access_denied(err.to_string()),
            _ => match err {
                TransferError::InvalidLocator(msg) => Self::bad_request(msg),
                TransferError::NotFound(msg) => Self::not_found(msg),
                other => Self::internal(other.to_string()),
            },
        }
    }
}

impl std::error::Error for ApiError {}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status, self.public_code)
    }
}

#[macro_export]
macro_rules! internal {
    ($($arg:tt)*) => { $crate::error::ApiError::internal(format!($($arg)*)) };
}

#[macro_export]
macro_rules! not_found {
    ($($arg:tt)*) => { $crate::error::ApiError::not_found(format!($($arg)*)) };
}

#[macro_export]
macro_rules! bad_request {
    ($($arg:tt)*) => { $crate::error::ApiError::bad_request(format!($($arg)*)) };
}
