//! Readiness error types.

use thiserror::Error;

pub type ReadinessResult<T> = Result<T, ReadinessError>;

#[derive(Debug, Error)]
pub enum ReadinessError {
    /// Bounded polling ran out of attempts.
    #[error("preview did not become ready after {attempts} attempts")]
    Timeout { attempts: u32 },

    /// The start request failed, or the preview was still absent afterwards.
    #[error("preview failed to start: {0}")]
    StartFailed(String),

    /// The health endpoint no longer knows the session (torn down).
    #[error("preview {0} no longer exists")]
    SessionGone(String),

    /// The preview API answered with something other than a status.
    #[error("preview api unavailable: {0}")]
    Unavailable(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}
