//! Client-side readiness detection for preview sessions.
//!
//! [`PreviewWatcher`] drives the status/start/health protocol against a
//! [`PreviewApi`] and keeps a ready session alive with periodic heartbeats.

mod client;
mod error;
mod poller;

pub use client::{HttpPreviewApi, PreviewApi, PreviewProbe};
pub use error::{ReadinessError, ReadinessResult};
pub use poller::{PollerConfig, PreviewState, PreviewWatcher};
