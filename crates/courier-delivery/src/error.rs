//! Error types for pipeline operations.
//!
//! Per-message failures never surface here; they become queue state
//! transitions. These errors describe problems with the pipeline itself:
//! store access, serialization of enqueued payloads, configuration and
//! task lifecycle.

use std::time::Duration;

use courier_core::CoreError;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised by the pipeline components.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Queue store or guard store operation failed.
    #[error("database error: {message}")]
    Database {
        /// Error message from the store
        message: String,
    },

    /// A payload could not be serialized for enqueueing.
    #[error("serialization error: {message}")]
    Serialization {
        /// Serializer error message
        message: String,
    },

    /// Invalid configuration or collaborator setup.
    #[error("configuration error: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Background tasks did not stop within the shutdown timeout.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Configured shutdown timeout
        timeout: Duration,
    },

    /// A background task panicked.
    #[error("task {task} panicked: {error}")]
    WorkerPanic {
        /// Name of the task
        task: String,
        /// Join error description
        error: String,
    },

    /// Unexpected internal error.
    #[error("internal pipeline error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl PipelineError {
    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database { message: message.into() }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database { .. })
    }
}

impl From<CoreError> for PipelineError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::InvalidInput(message) => Self::configuration(message),
            other => Self::database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(error: serde_json::Error) -> Self {
        Self::serialization(error.to_string())
    }
}
