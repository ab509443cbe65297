//! Storage provisioning error types.

use thiserror::Error;

use super::config::StorageKind;
use crate::container::ContainerError;
use crate::naming::NamingError;

/// Result type for provisioning operations.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Failure reported by a storage backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("invalid connection url: {0}")]
    Url(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: std::time::Duration,
    },

    #[error("no {0} backend configured")]
    NotConfigured(StorageKind),
}

/// One storage that could not be torn down.
#[derive(Debug)]
pub struct TeardownFailure {
    pub storage: String,
    pub kind: StorageKind,
    pub name: String,
    pub error: BackendError,
}

impl std::fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} {}): {}",
            self.storage, self.kind, self.name, self.error
        )
    }
}

/// Errors that can occur while provisioning or tearing down storages.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Naming(#[from] NamingError),

    /// Creating one storage failed.
    #[error("failed to create {kind} storage '{storage}' ({name}): {source}")]
    ResourceCreation {
        storage: String,
        kind: StorageKind,
        name: String,
        #[source]
        source: BackendError,
    },

    /// Teardown visited every storage; these ones failed.
    #[error("teardown failed for {} storage(s): {}", .0.len(), join_failures(.0))]
    PartialTeardown(Vec<TeardownFailure>),
}

impl ProvisionError {
    /// Storage keys that failed during teardown.
    pub fn failed_storages(&self) -> Vec<&str> {
        match self {
            ProvisionError::PartialTeardown(failures) => {
                failures.iter().map(|f| f.storage.as_str()).collect()
            }
            ProvisionError::ResourceCreation { storage, .. } => vec![storage.as_str()],
            ProvisionError::Naming(_) => Vec::new(),
        }
    }
}

fn join_failures(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
