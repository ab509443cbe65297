//! In-memory backends for unit tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::container::{
    ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi, ContainerState,
    ContainerSummary,
};
use crate::storage::{BackendError, PostgresAdmin, database_url};

pub const ADMIN_URL: &str = "postgres://admin:pw@localhost:5432/postgres";

struct FakeContainer {
    state: ContainerState,
    labels: BTreeMap<String, String>,
    network: Option<String>,
    env: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct MemoryRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    images: Mutex<HashSet<String>>,
    creates: AtomicU32,
    pulls: AtomicU32,
    fail_pulls: AtomicBool,
    fail_removes: AtomicBool,
    fail_creates: AtomicBool,
    fail_inspects: AtomicBool,
    race_creates: AtomicBool,
}

impl MemoryRuntime {
    pub fn fail_pulls(&self) {
        self.fail_pulls.store(true, Ordering::SeqCst);
    }

    pub fn fail_removes(&self) {
        self.fail_removes.store(true, Ordering::SeqCst);
    }

    pub fn fail_creates(&self) {
        self.fail_creates.store(true, Ordering::SeqCst);
    }

    /// Inspect fails the way it does when the daemon is unreachable.
    pub fn fail_inspects(&self) {
        self.fail_inspects.store(true, Ordering::SeqCst);
    }

    /// Another creator wins every create: the container appears, but the
    /// call reports a name conflict.
    pub fn race_creates(&self) {
        self.race_creates.store(true, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn pull_calls(&self) -> u32 {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn add_image(&self, image: &str) {
        self.images.lock().unwrap().insert(image.to_string());
    }

    /// Seed a container as if created earlier.
    pub fn insert_container(&self, name: &str, state: ContainerState) {
        self.containers.lock().unwrap().insert(
            name.to_string(),
            FakeContainer {
                state,
                labels: BTreeMap::new(),
                network: None,
                env: BTreeMap::new(),
            },
        );
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub fn labels(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.containers
            .lock()
            .unwrap()
            .get(name)
            .map(|c| c.labels.clone())
    }

    pub fn network(&self, name: &str) -> Option<String> {
        self.containers
            .lock()
            .unwrap()
            .get(name)
            .and_then(|c| c.network.clone())
    }

    pub fn env(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.containers
            .lock()
            .unwrap()
            .get(name)
            .map(|c| c.env.clone())
    }

    pub fn set_state(&self, name: &str, state: ContainerState) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(name) {
            c.state = state;
        }
    }
}

#[async_trait]
impl ContainerRuntimeApi for MemoryRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "run".to_string(),
                message: "daemon unavailable".to_string(),
            });
        }
        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(&config.name) {
            return Err(ContainerError::AlreadyExists(config.name.clone()));
        }
        let raced = self.race_creates.load(Ordering::SeqCst);
        containers.insert(
            config.name.clone(),
            FakeContainer {
                state: ContainerState::Running,
                labels: config.labels.clone(),
                network: config.network_mode.clone(),
                env: config.env.clone(),
            },
        );
        if raced {
            return Err(ContainerError::AlreadyExists(config.name.clone()));
        }
        Ok(format!("id-{}", config.name))
    }

    async fn start_container(&self, name: &str) -> ContainerResult<()> {
        match self.containers.lock().unwrap().get_mut(name) {
            Some(c) => {
                c.state = ContainerState::Running;
                Ok(())
            }
            None => Err(ContainerError::ContainerNotFound(name.to_string())),
        }
    }

    async fn stop_container(&self, name: &str, _timeout: Option<u32>) -> ContainerResult<()> {
        match self.containers.lock().unwrap().get_mut(name) {
            Some(c) => {
                c.state = ContainerState::Exited;
                Ok(())
            }
            None => Err(ContainerError::ContainerNotFound(name.to_string())),
        }
    }

    async fn remove_container(
        &self,
        name: &str,
        _force: bool,
        _volumes: bool,
    ) -> ContainerResult<()> {
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "rm".to_string(),
                message: "device or resource busy".to_string(),
            });
        }
        match self.containers.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(ContainerError::ContainerNotFound(name.to_string())),
        }
    }

    async fn container_state(&self, name: &str) -> ContainerResult<Option<ContainerState>> {
        if self.fail_inspects.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "inspect".to_string(),
                message: "Cannot connect to the Docker daemon".to_string(),
            });
        }
        Ok(self.containers.lock().unwrap().get(name).map(|c| c.state))
    }

    async fn list_containers_by_label(
        &self,
        key: &str,
        value: &str,
    ) -> ContainerResult<Vec<ContainerSummary>> {
        let containers = self.containers.lock().unwrap();
        let mut found: Vec<ContainerSummary> = containers
            .iter()
            .filter(|(_, c)| c.labels.get(key).map(String::as_str) == Some(value))
            .map(|(name, c)| ContainerSummary {
                id: format!("id-{}", name),
                name: name.clone(),
                state: c.state,
                labels: c.labels.clone(),
            })
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        Ok(self.images.lock().unwrap().contains(image))
    }

    async fn pull_image(&self, image: &str) -> ContainerResult<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.fail_pulls.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "pull".to_string(),
                message: "manifest unknown".to_string(),
            });
        }
        self.images.lock().unwrap().insert(image.to_string());
        Ok(())
    }

    async fn ensure_network(&self, _network: &str) -> ContainerResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPostgres {
    databases: Mutex<HashSet<String>>,
    creates: AtomicU32,
    terminates: AtomicU32,
    fail_drops: AtomicBool,
}

impl MemoryPostgres {
    pub fn fail_drops(&self) {
        self.fail_drops.store(true, Ordering::SeqCst);
    }

    pub fn database_count(&self) -> usize {
        self.databases.lock().unwrap().len()
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.databases.lock().unwrap().contains(name)
    }

    pub fn create_calls(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> u32 {
        self.terminates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PostgresAdmin for MemoryPostgres {
    async fn database_exists(&self, name: &str) -> Result<bool, BackendError> {
        Ok(self.databases.lock().unwrap().contains(name))
    }

    async fn create_database(&self, name: &str) -> Result<(), BackendError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        // HashSet insert doubles as "create if not exists"
        self.databases.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn terminate_connections(&self, _name: &str) -> Result<u64, BackendError> {
        self.terminates.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }

    async fn drop_database(&self, name: &str) -> Result<bool, BackendError> {
        if self.fail_drops.load(Ordering::SeqCst) {
            return Err(BackendError::Timeout {
                operation: "drop database".to_string(),
                timeout: std::time::Duration::from_secs(30),
            });
        }
        Ok(self.databases.lock().unwrap().remove(name))
    }

    fn connection_url(&self, name: &str) -> Result<String, BackendError> {
        database_url(ADMIN_URL, name)
    }
}
