use arbor_types::{ErrorBody, NodeError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::warn;

/// An error rendered as `{ "code", "message" }` with a matching status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code: code.into(),
                message: message.into(),
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &str {
        &self.body.code
    }
}

pub fn status_for(err: &NodeError) -> StatusCode {
    match err {
        NodeError::Validation(_) | NodeError::Interview(_) | NodeError::ApprovalRequired { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        NodeError::Auth(_) => StatusCode::UNAUTHORIZED,
        NodeError::Banned(_) => StatusCode::FORBIDDEN,
        NodeError::NotFound(_) => StatusCode::NOT_FOUND,
        NodeError::Storage(_) | NodeError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<NodeError> for ApiError {
    fn from(err: NodeError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            warn!("Request failed: {}", err);
        }
        Self::new(status, err.code(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
