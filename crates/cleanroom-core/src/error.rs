//! Error types for cleanroom.

use thiserror::Error;

use crate::job::JobStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("{action} failed: {message}")]
    Upstream { action: String, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a failure from an external system with the action that was attempted.
    pub fn upstream(action: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Error::Upstream {
            action: action.into(),
            message: err.to_string(),
        }
    }

    /// Whether this error belongs to the validation class (bad request or bad transition).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidInput(_) | Error::InvalidTransition { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
