//! Storage provisioning for preview sessions.
//!
//! Each storage a project declares becomes one per-session resource: a
//! database on the shared Postgres server, or a redis container next to the
//! app container. All identifiers come from the [`ResourceNamer`], so
//! provisioning the same session twice lands on the same resources.

mod config;
mod error;
mod postgres;
mod redis;

pub use config::{StorageConfig, StorageConnectionInfo, StorageKind, StorageSpec};
pub use error::{BackendError, ProvisionError, ProvisionResult, TeardownFailure};
pub use postgres::{PostgresAdmin, SqlxPostgresAdmin, database_url};
pub use redis::{DEFAULT_REDIS_IMAGE, REDIS_PORT, RedisSettings, redis_url};

use log::{error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::container::ContainerRuntimeApi;
use crate::naming::{REDIS_KIND, ResourceNamer};

/// Creates and destroys the storages of preview sessions.
#[derive(Clone)]
pub struct StorageProvisioner {
    namer: ResourceNamer,
    postgres: Option<Arc<dyn PostgresAdmin>>,
    runtime: Arc<dyn ContainerRuntimeApi>,
    redis: RedisSettings,
}

impl StorageProvisioner {
    pub fn new(
        namer: ResourceNamer,
        postgres: Option<Arc<dyn PostgresAdmin>>,
        runtime: Arc<dyn ContainerRuntimeApi>,
        redis: RedisSettings,
    ) -> Self {
        Self {
            namer,
            postgres,
            runtime,
            redis,
        }
    }

    pub fn namer(&self) -> &ResourceNamer {
        &self.namer
    }

    /// Physical resource name of one storage.
    pub fn resource_name(
        &self,
        project_id: &str,
        session_id: &str,
        kind: StorageKind,
    ) -> ProvisionResult<String> {
        let name = match kind {
            StorageKind::Postgres => self.namer.database_name(project_id, session_id)?,
            StorageKind::Redis => self.namer.resource_name(project_id, session_id, REDIS_KIND)?,
        };
        Ok(name)
    }

    /// Provision every declared storage.
    ///
    /// Every storage is attempted. If any failed, the first failure is
    /// returned; storages that did succeed are left in place; calling again
    /// is safe since creation reuses existing resources.
    pub async fn create_storages(
        &self,
        project_id: &str,
        session_id: &str,
        config: &StorageConfig,
    ) -> ProvisionResult<BTreeMap<String, StorageConnectionInfo>> {
        let mut created = BTreeMap::new();
        let mut first_failure: Option<ProvisionError> = None;

        for (key, spec) in config.iter() {
            let name = self.resource_name(project_id, session_id, spec.kind)?;
            let result = match spec.kind {
                StorageKind::Postgres => self.create_postgres(&name).await,
                StorageKind::Redis => self.create_redis(&name, project_id, session_id).await,
            };

            match result {
                Ok(url) => {
                    created.insert(
                        key.clone(),
                        StorageConnectionInfo {
                            kind: spec.kind,
                            name,
                            url,
                        },
                    );
                }
                Err(source) => {
                    error!(
                        "Failed to create {} storage '{}' ({}) for session {}/{}: {}",
                        spec.kind, key, name, project_id, session_id, source
                    );
                    if first_failure.is_none() {
                        first_failure = Some(ProvisionError::ResourceCreation {
                            storage: key.clone(),
                            kind: spec.kind,
                            name,
                            source,
                        });
                    }
                }
            }
        }

        if let Some(err) = first_failure {
            return Err(err);
        }

        info!(
            "Provisioned {} storage(s) for session {}/{}",
            created.len(),
            project_id,
            session_id
        );
        Ok(created)
    }

    /// Tear down every declared storage, collecting failures.
    ///
    /// Resources that are already gone count as removed.
    pub async fn drop_storages(
        &self,
        project_id: &str,
        session_id: &str,
        config: &StorageConfig,
    ) -> ProvisionResult<()> {
        let mut failures = Vec::new();

        for (key, spec) in config.iter() {
            let name = self.resource_name(project_id, session_id, spec.kind)?;
            let result = match spec.kind {
                StorageKind::Postgres => self.drop_postgres(&name).await,
                StorageKind::Redis => redis::remove_redis(self.runtime.as_ref(), &name)
                    .await
                    .map(|_| ())
                    .map_err(BackendError::from),
            };

            if let Err(error) = result {
                warn!(
                    "Failed to drop {} storage '{}' ({}): {}",
                    spec.kind, key, name, error
                );
                failures.push(TeardownFailure {
                    storage: key.clone(),
                    kind: spec.kind,
                    name,
                    error,
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ProvisionError::PartialTeardown(failures))
        }
    }

    fn postgres(&self) -> Result<&dyn PostgresAdmin, BackendError> {
        self.postgres
            .as_deref()
            .ok_or(BackendError::NotConfigured(StorageKind::Postgres))
    }

    async fn create_postgres(&self, name: &str) -> Result<String, BackendError> {
        let admin = self.postgres()?;
        if !admin.database_exists(name).await? {
            admin.create_database(name).await?;
        }
        admin.connection_url(name)
    }

    async fn create_redis(
        &self,
        name: &str,
        project_id: &str,
        session_id: &str,
    ) -> Result<String, BackendError> {
        let url = redis::create_redis(
            self.runtime.as_ref(),
            &self.redis,
            name,
            project_id,
            session_id,
        )
        .await?;
        Ok(url)
    }

    async fn drop_postgres(&self, name: &str) -> Result<(), BackendError> {
        let admin = self.postgres()?;
        admin.terminate_connections(name).await?;
        admin.drop_database(name).await?;
        Ok(())
    }
}
