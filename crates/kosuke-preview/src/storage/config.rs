//! Project storage declarations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Storage engine of a declared storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Postgres,
    Redis,
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageKind::Postgres => f.write_str("postgres"),
            StorageKind::Redis => f.write_str("redis"),
        }
    }
}

/// One storage entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSpec {
    #[serde(rename = "type")]
    pub kind: StorageKind,
}

/// Storage key (chosen by the project author) to storage spec.
///
/// Ordered so provisioning and teardown visit storages deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageConfig(pub BTreeMap<String, StorageSpec>);

impl StorageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, kind: StorageKind) -> Self {
        self.0.insert(key.into(), StorageSpec { kind });
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StorageSpec)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Connection details handed back for a provisioned storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConnectionInfo {
    pub kind: StorageKind,
    /// Physical resource name (database or container).
    pub name: String,
    pub url: String,
}
