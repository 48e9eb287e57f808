//! Error types for the ipcx transport.
//!
//! Two families live here. `IpcError` covers failures that surface to the host
//! through failed API calls (binding, registration, transport). `CallError` is
//! the per-request failure produced by dispatch; it is always turned into a
//! response frame and never escapes the dispatcher.

use crate::protocol::Status;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the ipcx library.
#[derive(Debug, Error)]
pub enum IpcError {
    // Lifecycle errors
    #[error("Failed to bind endpoint {path:?}: {message}")]
    Bind {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Registration errors
    #[error("Duplicate {kind} name: {name}")]
    DuplicateName { kind: &'static str, name: String },

    // Protocol errors
    #[error("Malformed frame: {message}")]
    Decode { message: String },

    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Connection closed by peer")]
    Disconnected,

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    // Client-side view of a failed call
    #[error("Remote call failed ({status}): {message}")]
    Remote { status: Status, message: String },
}

/// Result type alias for ipcx operations.
pub type Result<T> = std::result::Result<T, IpcError>;

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        IpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl IpcError {
    /// Create a bind error with endpoint context.
    pub fn bind(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        IpcError::Bind {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a bind error from an OS failure.
    pub fn bind_io(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        IpcError::Bind {
            path: path.into(),
            message: err.to_string(),
            source: Some(err),
        }
    }

    /// Whether this error means the connection can no longer be used.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            IpcError::Io { .. }
                | IpcError::Disconnected
                | IpcError::Decode { .. }
                | IpcError::FrameTooLarge { .. }
        )
    }
}

/// Failure of a single dispatched call.
///
/// The status is never `Ok`; constructors pick the right one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status}: {message}")]
pub struct CallError {
    pub status: Status,
    pub message: String,
}

impl CallError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: Status::NotFound,
            message: message.into(),
        }
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Self {
            status: Status::ArgumentError,
            message: message.into(),
        }
    }

    pub fn handler_failure(message: impl Into<String>) -> Self {
        Self {
            status: Status::HandlerFailure,
            message: message.into(),
        }
    }
}

/// Failure raised by a registered function implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct FunctionError(pub String);

impl FunctionError {
    pub fn new(message: impl Into<String>) -> Self {
        FunctionError(message.into())
    }
}

impl From<FunctionError> for CallError {
    fn from(err: FunctionError) -> Self {
        CallError::handler_failure(err.0)
    }
}
