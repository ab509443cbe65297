//! Preview session models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::storage::{StorageConfig, StorageConnectionInfo};

/// Identity of a preview session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub project_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(project_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project_id, self.session_id)
    }
}

/// Lifecycle status of a preview session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewStatus {
    #[default]
    Loading,
    Ready,
    Error,
}

impl std::fmt::Display for PreviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreviewStatus::Loading => f.write_str("loading"),
            PreviewStatus::Ready => f.write_str("ready"),
            PreviewStatus::Error => f.write_str("error"),
        }
    }
}

/// A preview session as tracked by the service.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewSession {
    pub project_id: String,
    pub session_id: String,
    pub status: PreviewStatus,
    /// Set once the app container is addressable.
    pub app_url: Option<String>,
    /// Storages declared for this session; teardown walks the same list.
    pub storages: StorageConfig,
    /// Connection URLs carry credentials and never leave the process.
    #[serde(skip)]
    pub connections: BTreeMap<String, StorageConnectionInfo>,
    pub created_at: DateTime<Utc>,
    /// Touched by the health endpoint; read by the external reaper.
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PreviewSession {
    pub fn new(key: &SessionKey, storages: StorageConfig) -> Self {
        let now = Utc::now();
        Self {
            project_id: key.project_id.clone(),
            session_id: key.session_id.clone(),
            status: PreviewStatus::Loading,
            app_url: None,
            storages,
            connections: BTreeMap::new(),
            created_at: now,
            last_activity_at: now,
            error: None,
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.project_id.clone(), self.session_id.clone())
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

/// Body of `POST`/`GET` on the preview endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewStatusBody {
    #[serde(rename = "previewUrl", skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub running: bool,
    pub is_responding: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PreviewStatus>,
}

impl PreviewStatusBody {
    /// Address reported by either field name.
    pub fn address(&self) -> Option<&str> {
        self.preview_url.as_deref().or(self.url.as_deref())
    }
}

/// Body of the per-session health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthBody {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_responding: Option<bool>,
}

/// Body accepted when starting a preview.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StartPreviewRequest {
    /// Image override for the app container.
    pub image: Option<String>,
    /// Storages override; the configured defaults apply otherwise.
    pub storages: Option<StorageConfig>,
    /// Extra environment for the app container.
    pub env: BTreeMap<String, String>,
}
