//! Preview service - orchestrates storages and the app container per session.
//!
//! Sessions are tracked in a concurrent map. Entries are only locked for the
//! duration of a read or write, never across a daemon or database call, so
//! one slow session never blocks another.

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::container::{
    ContainerConfig, ContainerError, ContainerRuntimeApi, PROJECT_LABEL, SESSION_LABEL,
    ensure_container,
};
use crate::storage::{StorageConfig, StorageConnectionInfo, StorageKind, StorageProvisioner};

use super::error::{PreviewError, PreviewResult};
use super::models::{
    HealthBody, PreviewSession, PreviewStatus, PreviewStatusBody, SessionKey, StartPreviewRequest,
};
use super::probe::AppProbe;

/// Default app image.
pub const DEFAULT_APP_IMAGE: &str = "ghcr.io/kosuke-ai/preview-app:latest";

/// Default port the app listens on inside its container.
pub const DEFAULT_APP_PORT: u16 = 3000;

/// Default URL template for a session's app.
pub const DEFAULT_URL_TEMPLATE: &str = "http://{container}:{port}";

/// Seconds the daemon waits for the app to exit before killing it.
const APP_STOP_TIMEOUT_SECONDS: u32 = 10;

/// Preview service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewServiceConfig {
    /// Image for app containers when the request does not name one.
    pub default_image: String,
    /// Port the app listens on inside its container.
    pub app_port: u16,
    /// Network app and cache containers share.
    pub network: Option<String>,
    /// Template for the app address. Placeholders: `{container}`, `{port}`,
    /// `{project}`, `{session}`.
    pub url_template: String,
    /// Storages provisioned when a request does not declare its own.
    pub default_storages: StorageConfig,
}

impl Default for PreviewServiceConfig {
    fn default() -> Self {
        Self {
            default_image: DEFAULT_APP_IMAGE.to_string(),
            app_port: DEFAULT_APP_PORT,
            network: Some("kosuke_network".to_string()),
            url_template: DEFAULT_URL_TEMPLATE.to_string(),
            default_storages: StorageConfig::new().with("postgres", StorageKind::Postgres),
        }
    }
}

impl PreviewServiceConfig {
    fn render_url(&self, container: &str, key: &SessionKey) -> String {
        self.url_template
            .replace("{container}", container)
            .replace("{port}", &self.app_port.to_string())
            .replace("{project}", &key.project_id)
            .replace("{session}", &key.session_id)
    }
}

/// Environment handed to the app container for its storages.
///
/// Every storage gets `<KEY>_URL`; the first postgres and redis storages
/// also populate the conventional `DATABASE_URL` and `REDIS_URL`.
pub fn storage_env(
    connections: &BTreeMap<String, StorageConnectionInfo>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for (key, info) in connections {
        let var: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        env.insert(format!("{}_URL", var), info.url.clone());

        let conventional = match info.kind {
            StorageKind::Postgres => "DATABASE_URL",
            StorageKind::Redis => "REDIS_URL",
        };
        env.entry(conventional.to_string())
            .or_insert_with(|| info.url.clone());
    }
    env
}

/// Live view of a session's app container.
struct Inspection {
    url: String,
    running: bool,
    is_responding: bool,
}

/// Service for managing preview sessions.
#[derive(Clone)]
pub struct PreviewService {
    storage: StorageProvisioner,
    runtime: Arc<dyn ContainerRuntimeApi>,
    probe: Arc<dyn AppProbe>,
    sessions: Arc<DashMap<SessionKey, PreviewSession>>,
    config: PreviewServiceConfig,
}

impl PreviewService {
    pub fn new(
        storage: StorageProvisioner,
        runtime: Arc<dyn ContainerRuntimeApi>,
        probe: Arc<dyn AppProbe>,
        config: PreviewServiceConfig,
    ) -> Self {
        Self {
            storage,
            runtime,
            probe,
            sessions: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &PreviewServiceConfig {
        &self.config
    }

    fn app_container_name(&self, key: &SessionKey) -> PreviewResult<String> {
        Ok(self
            .storage
            .namer()
            .app_container_name(&key.project_id, &key.session_id)?)
    }

    fn set_status(&self, key: &SessionKey, status: PreviewStatus, error: Option<String>) {
        if let Some(mut session) = self.sessions.get_mut(key) {
            session.status = status;
            session.error = error;
        }
    }

    /// Provision storages and the app container for a session.
    ///
    /// Returns once the container exists; it may not be serving yet.
    pub async fn start_preview(
        &self,
        key: &SessionKey,
        request: StartPreviewRequest,
    ) -> PreviewResult<PreviewStatusBody> {
        let container_name = self.app_container_name(key)?;

        let storages = request
            .storages
            .clone()
            .or_else(|| self.sessions.get(key).map(|s| s.storages.clone()))
            .unwrap_or_else(|| self.config.default_storages.clone());

        {
            let mut entry = self
                .sessions
                .entry(key.clone())
                .or_insert_with(|| PreviewSession::new(key, storages.clone()));
            entry.status = PreviewStatus::Loading;
            entry.storages = storages.clone();
            entry.error = None;
            entry.touch();
        }

        info!("Starting preview {}", key);

        let connections = match self
            .storage
            .create_storages(&key.project_id, &key.session_id, &storages)
            .await
        {
            Ok(connections) => connections,
            Err(e) => {
                self.set_status(key, PreviewStatus::Error, Some(e.to_string()));
                return Err(e.into());
            }
        };

        let image = request
            .image
            .clone()
            .unwrap_or_else(|| self.config.default_image.clone());
        let mut container = ContainerConfig::new(container_name.as_str(), image)
            .session_labels(&key.project_id, &key.session_id)
            .env("PORT", self.config.app_port.to_string())
            .envs(storage_env(&connections))
            .envs(request.env.clone());
        if let Some(ref network) = self.config.network {
            container = container.network_mode(network.as_str());
        }

        if let Err(source) = ensure_container(self.runtime.as_ref(), &container).await {
            warn!("Failed to start app container {}: {}", container_name, source);
            self.set_status(key, PreviewStatus::Error, Some(source.to_string()));
            return Err(PreviewError::Container {
                name: container_name,
                source,
            });
        }

        let url = self.config.render_url(&container_name, key);
        if let Some(mut session) = self.sessions.get_mut(key) {
            session.app_url = Some(url.clone());
            session.connections = connections;
        }

        Ok(PreviewStatusBody {
            preview_url: Some(url.clone()),
            url: Some(url),
            running: true,
            is_responding: false,
            status: Some(PreviewStatus::Loading),
        })
    }

    /// Inspect the container and probe the app, adopting sessions whose
    /// container outlived a restart of this process.
    async fn inspect(&self, key: &SessionKey) -> PreviewResult<Option<Inspection>> {
        let container_name = self.app_container_name(key)?;
        let state = self
            .runtime
            .container_state(&container_name)
            .await
            .map_err(|source| PreviewError::Container {
                name: container_name.clone(),
                source,
            })?;

        let known_url = self.sessions.get(key).and_then(|s| s.app_url.clone());
        let url = match (known_url, state) {
            (Some(url), _) => url,
            (None, Some(_)) => {
                let url = self.config.render_url(&container_name, key);
                let mut entry = self.sessions.entry(key.clone()).or_insert_with(|| {
                    debug!("Adopting existing container {}", container_name);
                    PreviewSession::new(key, self.config.default_storages.clone())
                });
                entry.app_url = Some(url.clone());
                url
            }
            (None, None) => {
                if self.sessions.contains_key(key) {
                    // Provisioning in flight, nothing addressable yet
                    return Ok(None);
                }
                return Err(PreviewError::NotFound(key.to_string()));
            }
        };

        let running = state.is_some_and(|s| s.is_running());
        let is_responding = running && self.probe.is_responding(&url).await;

        if is_responding {
            self.set_status(key, PreviewStatus::Ready, None);
        }

        Ok(Some(Inspection {
            url,
            running,
            is_responding,
        }))
    }

    /// Current status of a session's preview.
    pub async fn status(&self, key: &SessionKey) -> PreviewResult<PreviewStatusBody> {
        let inspection = self.inspect(key).await?;
        let status = self.sessions.get(key).map(|s| s.status);

        Ok(match inspection {
            Some(i) => PreviewStatusBody {
                preview_url: Some(i.url.clone()),
                url: Some(i.url),
                running: i.running,
                is_responding: i.is_responding,
                status,
            },
            None => PreviewStatusBody {
                preview_url: None,
                url: None,
                running: false,
                is_responding: false,
                status,
            },
        })
    }

    /// Health check used by the heartbeat; records session activity.
    pub async fn health(&self, key: &SessionKey) -> PreviewResult<HealthBody> {
        let inspection = self.inspect(key).await?;
        self.record_activity(key);

        Ok(match inspection {
            Some(i) => HealthBody {
                ok: i.is_responding,
                running: Some(i.running),
                is_responding: Some(i.is_responding),
            },
            None => HealthBody {
                ok: false,
                running: Some(false),
                is_responding: Some(false),
            },
        })
    }

    /// Mark a session as active now.
    pub fn record_activity(&self, key: &SessionKey) {
        if let Some(mut session) = self.sessions.get_mut(key) {
            session.last_activity_at = Utc::now();
        }
    }

    /// Remove the app container and every storage of a session.
    ///
    /// Every resource is attempted; failures are reported together and the
    /// session stays registered (in `error`) so teardown can be retried.
    pub async fn teardown(&self, key: &SessionKey) -> PreviewResult<()> {
        let container_name = self.app_container_name(key)?;
        let storages = self
            .sessions
            .get(key)
            .map(|s| s.storages.clone())
            .unwrap_or_else(|| self.config.default_storages.clone());

        info!("Tearing down preview {}", key);

        let app = self.remove_app_container(&container_name).await.err();
        let storages = self
            .storage
            .drop_storages(&key.project_id, &key.session_id, &storages)
            .await
            .err();

        if app.is_none() && storages.is_none() {
            self.sessions.remove(key);
            return Ok(());
        }

        let err = PreviewError::Teardown { app, storages };
        warn!("Teardown of {} incomplete: {}", key, err);
        self.set_status(key, PreviewStatus::Error, Some(err.to_string()));
        Err(err)
    }

    async fn remove_app_container(&self, name: &str) -> Result<(), ContainerError> {
        match self
            .runtime
            .stop_container(name, Some(APP_STOP_TIMEOUT_SECONDS))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => debug!("Stopping {} failed, forcing removal: {}", name, e),
        }

        match self.runtime.remove_container(name, true, true).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Snapshot of every tracked session.
    pub fn sessions(&self) -> Vec<PreviewSession> {
        let mut sessions: Vec<PreviewSession> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        sessions.sort_by(|a, b| a.key().cmp(&b.key()));
        sessions
    }

    pub fn session(&self, key: &SessionKey) -> Option<PreviewSession> {
        self.sessions.get(key).map(|s| s.value().clone())
    }

    /// Session ids of containers labelled for a project, from the daemon.
    pub async fn labelled_sessions(&self, project_id: &str) -> PreviewResult<Vec<String>> {
        let containers = self
            .runtime
            .list_containers_by_label(PROJECT_LABEL, project_id)
            .await
            .map_err(|source| PreviewError::Container {
                name: format!("{}={}", PROJECT_LABEL, project_id),
                source,
            })?;

        let mut ids: Vec<String> = containers
            .into_iter()
            .filter_map(|c| c.labels.get(SESSION_LABEL).cloned())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}
