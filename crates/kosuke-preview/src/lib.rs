//! Per-session preview environments.
//!
//! For every (project, session) pair this crate names, provisions, watches
//! and tears down an app container, a dedicated Postgres database and an
//! optional redis container.

pub mod api;
pub mod container;
pub mod naming;
pub mod preview;
pub mod readiness;
pub mod settings;
pub mod storage;

#[cfg(test)]
mod testing;
