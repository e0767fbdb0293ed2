//! Domain-specific error types for sandbox operations.
//!
//! Typed errors let tool handlers and the lifecycle match on specific
//! failure modes rather than parsing error message strings.

use std::time::Duration;

/// Errors that can occur during sandbox operations.
#[derive(Debug, thiserror::Error)]
pub(crate) enum SandboxError {
    /// The provider could not be reached or rejected the request.
    #[error("Sandbox is not available: {message}")]
    Unavailable { message: String },

    /// The operation exceeded its configured timeout.
    #[error("Sandbox operation timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// A file or sandbox addressed by the caller does not exist.
    #[error("Not found in sandbox: {path}")]
    NotFound { path: String },

    /// The provider accepted the request but the operation failed.
    #[error("Sandbox operation failed: {message}")]
    OperationFailed { message: String },
}

impl SandboxError {
    /// Creates an `Unavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a `Timeout` error from a `Duration`.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            timeout_secs: duration.as_secs(),
        }
    }

    /// Creates a `NotFound` error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Creates an `OperationFailed` error.
    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::OperationFailed {
            message: message.into(),
        }
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if the provider could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Returns true if the addressed path or sandbox does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<bollard::errors::Error> for SandboxError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => Self::not_found(message),
            bollard::errors::Error::DockerResponseServerError { message, .. } => {
                Self::operation_failed(message)
            }
            other => Self::unavailable(other.to_string()),
        }
    }
}
