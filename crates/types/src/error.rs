use serde::{Deserialize, Serialize};

/// Taxonomy tag carried by every [`NodeError`] so callers can branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Auth,
    ApprovalRequired,
    Interview,
    NotFound,
    Storage,
    Transport,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum NodeError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unauthorized: {0}")]
    Auth(String),
    #[error("origin {0} is banned")]
    Banned(String),
    #[error("approval required for action `{action}`: {reason}")]
    ApprovalRequired { action: String, reason: String },
    #[error("interview failed: {0}")]
    Interview(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl NodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::Validation(_) => ErrorKind::Validation,
            NodeError::Auth(_) | NodeError::Banned(_) => ErrorKind::Auth,
            NodeError::ApprovalRequired { .. } => ErrorKind::ApprovalRequired,
            NodeError::Interview(_) => ErrorKind::Interview,
            NodeError::NotFound(_) => ErrorKind::NotFound,
            NodeError::Storage(_) => ErrorKind::Storage,
            NodeError::Transport(_) => ErrorKind::Transport,
        }
    }

    /// Stable machine-readable code sent to HTTP callers.
    pub fn code(&self) -> &'static str {
        match self {
            NodeError::Validation(_) => "ERR_ARBOR_VALIDATION",
            NodeError::Auth(_) => "ERR_ARBOR_AUTH",
            NodeError::Banned(_) => "ERR_ARBOR_BANNED",
            NodeError::ApprovalRequired { .. } => "ERR_ARBOR_APPROVAL_INFO_REQUIRED",
            NodeError::Interview(_) => "ERR_ARBOR_INTERVIEW",
            NodeError::NotFound(_) => "ERR_ARBOR_NOT_FOUND",
            NodeError::Storage(_) => "ERR_ARBOR_STORAGE",
            NodeError::Transport(_) => "ERR_ARBOR_TRANSPORT",
        }
    }

    pub fn approval_required(action: impl Into<String>, reason: impl Into<String>) -> Self {
        NodeError::ApprovalRequired {
            action: action.into(),
            reason: reason.into(),
        }
    }

    /// Rebuild an error from a remote `{code, message}` body.
    pub fn from_code(code: &str, message: String) -> Self {
        match code {
            "ERR_ARBOR_VALIDATION" => NodeError::Validation(message),
            "ERR_ARBOR_AUTH" => NodeError::Auth(message),
            "ERR_ARBOR_BANNED" => NodeError::Banned(message),
            "ERR_ARBOR_APPROVAL_INFO_REQUIRED" => NodeError::ApprovalRequired {
                action: String::new(),
                reason: message,
            },
            "ERR_ARBOR_INTERVIEW" => NodeError::Interview(message),
            "ERR_ARBOR_NOT_FOUND" => NodeError::NotFound(message),
            "ERR_ARBOR_STORAGE" => NodeError::Storage(message),
            _ => NodeError::Transport(message),
        }
    }
}

impl From<crate::AddressError> for NodeError {
    fn from(err: crate::AddressError) -> Self {
        NodeError::Validation(err.to_string())
    }
}

pub type NodeResult<T> = Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banned_is_an_auth_error() {
        let err = NodeError::Banned("10.0.0.1".into());
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert_eq!(err.code(), "ERR_ARBOR_BANNED");
    }

    #[test]
    fn codes_round_trip_through_remote_bodies() {
        let err = NodeError::Interview("no master".into());
        let rebuilt = NodeError::from_code(err.code(), "no master".into());
        assert_eq!(rebuilt, err);
        assert_eq!(
            NodeError::from_code("SOMETHING_ELSE", "x".into()).kind(),
            ErrorKind::Transport
        );
    }

    #[test]
    fn approval_error_names_the_action() {
        let err = NodeError::approval_required("register", "missing approval info");
        assert!(err.to_string().contains("`register`"));
        assert_eq!(err.code(), "ERR_ARBOR_APPROVAL_INFO_REQUIRED");
    }
}
