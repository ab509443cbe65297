//! Container runtime error types.

use std::time::Duration;

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The container command did not finish in time.
    #[error("container {command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// A container with the same name already exists.
    #[error("container already exists: {0}")]
    AlreadyExists(String),

    /// Pulling an image failed.
    #[error("failed to pull image {image}: {message}")]
    ImagePull { image: String, message: String },

    /// Failed to parse container output.
    #[error("failed to parse container output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Classify a failed CLI invocation by its stderr.
    pub(crate) fn from_stderr(command: &str, target: &str, stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        if lower.contains("no such container")
            || lower.contains("no such object")
            || lower.contains("no container with name")
        {
            ContainerError::ContainerNotFound(target.to_string())
        } else if lower.contains("already in use") || lower.contains("already exists") {
            ContainerError::AlreadyExists(target.to_string())
        } else {
            ContainerError::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            }
        }
    }

    /// Whether this error means the target is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ContainerError::ContainerNotFound(_))
    }
}
