//! Preview orchestration errors.

use thiserror::Error;

use crate::container::ContainerError;
use crate::naming::NamingError;
use crate::storage::ProvisionError;

pub type PreviewResult<T> = Result<T, PreviewError>;

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error(transparent)]
    Naming(#[from] NamingError),

    #[error("preview {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// Creating or inspecting the app container failed.
    #[error("app container {name}: {source}")]
    Container {
        name: String,
        #[source]
        source: ContainerError,
    },

    /// Teardown attempted everything; these parts failed.
    #[error("teardown incomplete: {}", describe_teardown(.app, .storages))]
    Teardown {
        app: Option<ContainerError>,
        storages: Option<ProvisionError>,
    },
}

fn describe_teardown(app: &Option<ContainerError>, storages: &Option<ProvisionError>) -> String {
    let mut parts = Vec::new();
    if let Some(e) = app {
        parts.push(format!("app container: {}", e));
    }
    if let Some(e) = storages {
        parts.push(e.to_string());
    }
    parts.join("; ")
}
