//! Preview sessions: one app container plus its storages per chat session.

mod error;
mod models;
mod probe;
mod service;

pub use error::{PreviewError, PreviewResult};
pub use models::{
    HealthBody, PreviewSession, PreviewStatus, PreviewStatusBody, SessionKey, StartPreviewRequest,
};
pub use probe::{AppProbe, HttpAppProbe};
pub use service::{
    DEFAULT_APP_IMAGE, DEFAULT_APP_PORT, DEFAULT_URL_TEMPLATE, PreviewService,
    PreviewServiceConfig, storage_env,
};
