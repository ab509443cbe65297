//! Deterministic resource naming for preview sessions.
//!
//! Every per-session resource (database, cache container, app container) is
//! addressed by a name derived from `(prefix, project_id, session_id, kind)`.
//! The same inputs always produce the same name, which is what lets a second
//! provisioning call find the resource the first one created.
//!
//! Naming contract:
//! - `project_id`, `session_id` and the prefix are all sanitized with the
//!   same rule: ASCII lowercase, anything outside `[a-z0-9_]` becomes `_`.
//! - untyped form: `<prefix><project>_<session>` (database identifiers),
//!   bounded to 63 bytes by truncating and appending a digest of the full name
//! - typed form: `<untyped>_<kind>` (containers)
//!
//! The typed form is built on the bounded untyped form, so the database name
//! of a session is always a prefix of its container names, whatever the id
//! lengths.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Default prefix used when none is configured.
pub const DEFAULT_PREFIX: &str = "kosuke_preview_";

/// Maximum identifier length accepted by Postgres (NAMEDATALEN - 1).
pub const MAX_DATABASE_NAME_LEN: usize = 63;

/// Hex chars of the digest appended to over-long database names.
const DIGEST_SUFFIX_LEN: usize = 12;

/// Kind suffix for the application container.
pub const APP_KIND: &str = "app";

/// Kind suffix for the redis cache container.
pub const REDIS_KIND: &str = "redis";

/// Naming errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NamingError {
    #[error("project id must not be empty")]
    EmptyProjectId,

    #[error("session id must not be empty")]
    EmptySessionId,

    #[error("resource kind must not be empty")]
    EmptyKind,
}

/// Lowercase and replace every character outside `[a-z0-9_]` with `_`.
pub fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Build a resource name.
///
/// With `kind == None` the result is the database form, bounded to
/// [`MAX_DATABASE_NAME_LEN`] bytes. Typed names append `_<kind>` to it.
pub fn resource_name(
    prefix: &str,
    project_id: &str,
    session_id: &str,
    kind: Option<&str>,
) -> Result<String, NamingError> {
    if project_id.is_empty() {
        return Err(NamingError::EmptyProjectId);
    }
    if session_id.is_empty() {
        return Err(NamingError::EmptySessionId);
    }

    if kind.is_some_and(str::is_empty) {
        return Err(NamingError::EmptyKind);
    }

    let base = bound_database_name(format!(
        "{}{}_{}",
        sanitize(prefix),
        sanitize(project_id),
        sanitize(session_id)
    ));

    match kind {
        Some(kind) => Ok(format!("{}_{}", base, sanitize(kind))),
        None => Ok(base),
    }
}

/// Keep database identifiers under the server limit without letting the
/// server truncate them (which would merge distinct sessions).
fn bound_database_name(name: String) -> String {
    if name.len() <= MAX_DATABASE_NAME_LEN {
        return name;
    }

    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    let keep = MAX_DATABASE_NAME_LEN - DIGEST_SUFFIX_LEN - 1;
    // Sanitized names are pure ASCII, so byte slicing is char-safe.
    format!("{}_{}", &name[..keep], &digest[..DIGEST_SUFFIX_LEN])
}

/// Namer bound to the configured prefix.
///
/// Cheap to clone; callers ask it for a name every time they need one
/// instead of storing names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNamer {
    prefix: String,
}

impl Default for ResourceNamer {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl ResourceNamer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Database identifier for a session.
    pub fn database_name(&self, project_id: &str, session_id: &str) -> Result<String, NamingError> {
        resource_name(&self.prefix, project_id, session_id, None)
    }

    /// Container (or other typed resource) name for a session.
    pub fn resource_name(
        &self,
        project_id: &str,
        session_id: &str,
        kind: &str,
    ) -> Result<String, NamingError> {
        resource_name(&self.prefix, project_id, session_id, Some(kind))
    }

    /// Name of the application container for a session.
    pub fn app_container_name(
        &self,
        project_id: &str,
        session_id: &str,
    ) -> Result<String, NamingError> {
        self.resource_name(project_id, session_id, APP_KIND)
    }
}
