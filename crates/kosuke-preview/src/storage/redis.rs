//! Per-session redis cache containers.

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::container::{ContainerConfig, ContainerResult, ContainerRuntimeApi, ensure_container};

/// Default redis image.
pub const DEFAULT_REDIS_IMAGE: &str = "redis:7-alpine";

/// Port redis listens on inside its container.
pub const REDIS_PORT: u16 = 6379;

/// Seconds the daemon waits for redis to exit before killing it.
const STOP_TIMEOUT_SECONDS: u32 = 10;

/// How cache containers are created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub image: String,
    /// Network shared with the app containers.
    pub network: Option<String>,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            image: DEFAULT_REDIS_IMAGE.to_string(),
            network: None,
        }
    }
}

/// URL an app container on the same network uses to reach the cache.
pub fn redis_url(container_name: &str) -> String {
    format!("redis://{}:{}", container_name, REDIS_PORT)
}

/// Bring up (or reuse) the cache container for a session.
pub async fn create_redis(
    runtime: &dyn ContainerRuntimeApi,
    settings: &RedisSettings,
    container_name: &str,
    project_id: &str,
    session_id: &str,
) -> ContainerResult<String> {
    let mut config = ContainerConfig::new(container_name, settings.image.as_str())
        .session_labels(project_id, session_id);
    if let Some(ref network) = settings.network {
        config = config.network_mode(network.as_str());
    }

    let outcome = ensure_container(runtime, &config).await?;
    debug!("Redis container {}: {:?}", container_name, outcome);
    Ok(redis_url(container_name))
}

/// Stop and remove the cache container with its anonymous volumes.
///
/// Returns `false` when there was nothing to remove.
pub async fn remove_redis(
    runtime: &dyn ContainerRuntimeApi,
    container_name: &str,
) -> ContainerResult<bool> {
    match runtime
        .stop_container(container_name, Some(STOP_TIMEOUT_SECONDS))
        .await
    {
        Ok(()) => {}
        Err(e) if e.is_not_found() => return Ok(false),
        // Removal below is forced, so a failed stop is not fatal yet
        Err(e) => debug!("Stopping {} failed, forcing removal: {}", container_name, e),
    }

    match runtime.remove_container(container_name, true, true).await {
        Ok(()) => {
            info!("Removed redis container {}", container_name);
            Ok(true)
        }
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
