// error.rs - HTTP error taxonomy for the gateway.
//
// Every failure leaves as `{ok: false, error, message}` where `error` is a
// stable discriminant callers can branch on.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use butler_policy::PolicyError;
use butler_submit::SubmitError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid X-Butler-Token")]
    Unauthorized,

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    PathNotAllowed(String),

    #[error("{0}")]
    WorkflowEditBlocked(String),

    #[error("branch '{0}' already exists; choose another name or use branchStrategy \"reuse\"")]
    BranchExists(String),

    #[error("the edits did not change any file")]
    NoChange,

    #[error("{0}")]
    PolicyDenied(String),

    #[error("no adapter for tool '{0}'")]
    UnsupportedTool(String),

    #[error("{0}")]
    ApplyFailed(String),

    #[error("request exceeded its time budget; remote state is unknown")]
    Timeout,
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::Invalid(_) => "invalid",
            ApiError::PathNotAllowed(_) => "path_not_allowed",
            ApiError::WorkflowEditBlocked(_) => "workflow_edit_blocked",
            ApiError::BranchExists(_) => "branch_exists",
            ApiError::NoChange => "no_change",
            ApiError::PolicyDenied(_) => "policy_denied",
            ApiError::UnsupportedTool(_) => "unsupported_tool",
            ApiError::ApplyFailed(_) => "apply_failed",
            ApiError::Timeout => "timeout",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Invalid(_)
            | ApiError::PathNotAllowed(_)
            | ApiError::NoChange
            | ApiError::UnsupportedTool(_) => StatusCode::BAD_REQUEST,
            ApiError::WorkflowEditBlocked(_) | ApiError::PolicyDenied(_) => StatusCode::FORBIDDEN,
            ApiError::BranchExists(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::ApplyFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = self.kind(), "{}", self);
        } else {
            tracing::info!(error = self.kind(), "rejected: {}", self);
        }
        let body = json!({
            "ok": false,
            "error": self.kind(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::BranchExists { branch } => ApiError::BranchExists(branch),
            SubmitError::NoChange => ApiError::NoChange,
            SubmitError::InvalidInput(msg) => ApiError::Invalid(msg),
            other => ApiError::ApplyFailed(other.to_string()),
        }
    }
}

impl From<PolicyError> for ApiError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::PathNotAllowed { .. } => ApiError::PathNotAllowed(e.to_string()),
            PolicyError::WorkflowEditBlocked { .. } => ApiError::WorkflowEditBlocked(e.to_string()),
            // Patterns come from server-side config, never from the request.
            PolicyError::InvalidPattern { .. }
            | PolicyError::Io { .. }
            | PolicyError::Parse { .. } => ApiError::ApplyFailed(e.to_string()),
        }
    }
}
