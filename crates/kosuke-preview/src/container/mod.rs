//! Container runtime management module.
//!
//! Provides an async interface to manage preview containers via the Docker or
//! Podman CLI. The runtime is auto-detected or can be configured explicitly.
//! Every daemon call runs under a timeout so one hung call cannot wedge a
//! teardown that still has other resources to release.

mod container;
mod error;

pub use container::{
    ContainerConfig, ContainerState, ContainerSummary, MANAGED_LABEL, PROJECT_LABEL, PortMapping,
    SESSION_LABEL, validate_container_name, validate_image_name, validate_network_name,
};
pub use error::{ContainerError, ContainerResult};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Default timeout for a single daemon call.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout for image pulls.
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    #[default]
    Docker,
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// Container runtime abstraction for testability.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create and start a container (`run -d`). Returns the container ID.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;
    async fn start_container(&self, name: &str) -> ContainerResult<()>;
    async fn stop_container(&self, name: &str, timeout_seconds: Option<u32>)
    -> ContainerResult<()>;
    /// Remove a container; `volumes` also removes its anonymous volumes.
    async fn remove_container(&self, name: &str, force: bool, volumes: bool)
    -> ContainerResult<()>;
    /// `Ok(None)` when the container does not exist.
    async fn container_state(&self, name: &str) -> ContainerResult<Option<ContainerState>>;
    async fn list_containers_by_label(
        &self,
        key: &str,
        value: &str,
    ) -> ContainerResult<Vec<ContainerSummary>>;
    async fn image_exists(&self, image: &str) -> ContainerResult<bool>;
    async fn pull_image(&self, image: &str) -> ContainerResult<()>;
    async fn ensure_network(&self, network: &str) -> ContainerResult<()>;
}

/// What [`ensure_container`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// A running container with that name already existed.
    Reused,
    /// A stopped container with that name was started again.
    Restarted,
    /// A new container was created.
    Created,
}

/// Make sure the image is available locally, pulling it only on a miss.
pub async fn ensure_image(runtime: &dyn ContainerRuntimeApi, image: &str) -> ContainerResult<()> {
    if runtime.image_exists(image).await? {
        return Ok(());
    }

    info!("Image {} not present locally, pulling", image);
    runtime
        .pull_image(image)
        .await
        .map_err(|e| match e {
            ContainerError::ImagePull { .. } => e,
            other => ContainerError::ImagePull {
                image: image.to_string(),
                message: other.to_string(),
            },
        })
}

/// Idempotently bring up a named container.
///
/// An existing running container is reused; a stopped one is started. A
/// name conflict raised by a concurrent creator counts as success, since the
/// conflicting container is, by construction, the one we wanted.
pub async fn ensure_container(
    runtime: &dyn ContainerRuntimeApi,
    config: &ContainerConfig,
) -> ContainerResult<EnsureOutcome> {
    config.validate()?;

    match runtime.container_state(&config.name).await? {
        Some(state) if state.is_running() => {
            debug!("Reusing running container {}", config.name);
            return Ok(EnsureOutcome::Reused);
        }
        Some(state) => {
            info!("Container {} is {}, starting it", config.name, state);
            runtime.start_container(&config.name).await?;
            return Ok(EnsureOutcome::Restarted);
        }
        None => {}
    }

    ensure_image(runtime, &config.image).await?;

    if let Some(ref network) = config.network_mode
        && network != "host"
        && network != "bridge"
        && network != "none"
    {
        runtime.ensure_network(network).await?;
    }

    match runtime.create_container(config).await {
        Ok(id) => {
            info!("Created container {} ({})", config.name, id);
            Ok(EnsureOutcome::Created)
        }
        Err(ContainerError::AlreadyExists(_)) => {
            debug!(
                "Container {} was created concurrently, reusing it",
                config.name
            );
            if let Some(state) = runtime.container_state(&config.name).await?
                && !state.is_running()
            {
                runtime.start_container(&config.name).await?;
            }
            Ok(EnsureOutcome::Reused)
        }
        Err(e) => Err(e),
    }
}

/// Container runtime client driving the Docker or Podman CLI.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
    command_timeout: Duration,
    pull_timeout: Duration,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Prefers Docker, falls back to Podman.
    pub fn new() -> Self {
        let runtime_type = if Self::is_binary_available("docker") {
            RuntimeType::Docker
        } else if Self::is_binary_available("podman") {
            RuntimeType::Podman
        } else {
            // Will fail at call time with a clear CLI error
            RuntimeType::Docker
        };
        Self::with_type(runtime_type)
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self::with_binary(runtime_type, runtime_type.default_binary())
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
        }
    }

    /// Override per-call timeouts.
    pub fn with_timeouts(mut self, command_timeout: Duration, pull_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self.pull_timeout = pull_timeout;
        self
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run one CLI command under a timeout and return its raw output.
    async fn exec<S: AsRef<str>>(
        &self,
        command: &str,
        args: &[S],
        timeout: Duration,
    ) -> ContainerResult<std::process::Output> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args.iter().map(|a| a.as_ref()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(ContainerError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(ContainerError::Timeout {
                command: command.to_string(),
                timeout,
            }),
        }
    }

    /// Run a command that must succeed, classifying failures by stderr.
    async fn exec_checked<S: AsRef<str>>(
        &self,
        command: &str,
        target: &str,
        args: &[S],
    ) -> ContainerResult<String> {
        let output = self.exec(command, args, self.command_timeout).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::from_stderr(command, target, &stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        self.exec_checked("version", "", &["version", "--format", "json"])
            .await
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;
        self.exec_checked("run", &config.name, &config.run_args())
            .await
    }

    async fn start_container(&self, name: &str) -> ContainerResult<()> {
        validate_container_name(name)?;
        self.exec_checked("start", name, &["start", name]).await?;
        Ok(())
    }

    async fn stop_container(
        &self,
        name: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_name(name)?;

        let mut args: Vec<String> = vec!["stop".to_string()];
        if let Some(t) = timeout_seconds {
            args.push("-t".to_string());
            args.push(t.to_string());
        }
        args.push(name.to_string());

        self.exec_checked("stop", name, &args).await?;
        Ok(())
    }

    async fn remove_container(
        &self,
        name: &str,
        force: bool,
        volumes: bool,
    ) -> ContainerResult<()> {
        validate_container_name(name)?;

        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        if volumes {
            args.push("-v");
        }
        args.push(name);

        self.exec_checked("rm", name, &args).await?;
        Ok(())
    }

    async fn container_state(&self, name: &str) -> ContainerResult<Option<ContainerState>> {
        validate_container_name(name)?;

        let status = match self
            .exec_checked(
                "container inspect",
                name,
                &["container", "inspect", "--format", "{{.State.Status}}", name],
            )
            .await
        {
            Ok(status) => status,
            // Only a missing container means absent; daemon failures propagate.
            Err(ContainerError::ContainerNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        if status.is_empty() {
            return Ok(None);
        }
        Ok(Some(ContainerState::parse(&status)))
    }

    async fn list_containers_by_label(
        &self,
        key: &str,
        value: &str,
    ) -> ContainerResult<Vec<ContainerSummary>> {
        let filter = format!("label={}={}", key, value);
        let stdout = self
            .exec_checked(
                "ps",
                "",
                &[
                    "ps",
                    "-a",
                    "--filter",
                    filter.as_str(),
                    "--format",
                    "{{.ID}}\t{{.Names}}\t{{.State}}\t{{.Labels}}",
                ],
            )
            .await?;

        Ok(stdout.lines().filter_map(container::parse_ps_line).collect())
    }

    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;

        // `image inspect` works for both Docker and Podman
        let output = self
            .exec(
                "image inspect",
                &["image", "inspect", image],
                self.command_timeout,
            )
            .await?;
        Ok(output.status.success())
    }

    async fn pull_image(&self, image: &str) -> ContainerResult<()> {
        validate_image_name(image)?;

        let output = self.exec("pull", &["pull", image], self.pull_timeout).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::ImagePull {
                image: image.to_string(),
                message: stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn ensure_network(&self, network: &str) -> ContainerResult<()> {
        validate_network_name(network)?;

        let output = self
            .exec(
                "network inspect",
                &["network", "inspect", network],
                self.command_timeout,
            )
            .await?;
        if output.status.success() {
            return Ok(());
        }

        match self
            .exec_checked("network create", network, &["network", "create", network])
            .await
        {
            Ok(_) | Err(ContainerError::AlreadyExists(_)) => Ok(()),
            Err(e) => {
                warn!("Failed to create network {}: {}", network, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryRuntime;

    fn redis_config() -> ContainerConfig {
        ContainerConfig::new("kp_p_s_redis", "redis:7-alpine")
            .network_mode("kosuke_network")
            .session_labels("p", "s")
    }

    #[tokio::test]
    async fn ensure_container_creates_then_reuses() {
        let daemon = MemoryRuntime::default();

        let first = ensure_container(&daemon, &redis_config()).await.unwrap();
        let second = ensure_container(&daemon, &redis_config()).await.unwrap();

        assert_eq!(first, EnsureOutcome::Created);
        assert_eq!(second, EnsureOutcome::Reused);
        assert_eq!(daemon.create_calls(), 1);
        assert_eq!(daemon.pull_calls(), 1);
    }

    #[tokio::test]
    async fn ensure_container_restarts_stopped() {
        let daemon = MemoryRuntime::default();
        daemon.insert_container("kp_p_s_redis", ContainerState::Exited);

        let outcome = ensure_container(&daemon, &redis_config()).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Restarted);
        assert_eq!(daemon.create_calls(), 0);
    }

    #[tokio::test]
    async fn ensure_container_skips_pull_when_image_cached() {
        let daemon = MemoryRuntime::default();
        daemon.add_image("redis:7-alpine");

        ensure_container(&daemon, &redis_config()).await.unwrap();
        assert_eq!(daemon.pull_calls(), 0);
    }

    #[tokio::test]
    async fn ensure_container_absorbs_name_conflict() {
        let daemon = MemoryRuntime::default();
        daemon.race_creates();

        let outcome = ensure_container(&daemon, &redis_config()).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Reused);
        assert_eq!(daemon.container_count(), 1);
    }

    #[tokio::test]
    async fn pull_failure_names_the_image() {
        let daemon = MemoryRuntime::default();
        daemon.fail_pulls();

        let err = ensure_container(&daemon, &redis_config())
            .await
            .unwrap_err();
        match err {
            ContainerError::ImagePull { image, message } => {
                assert_eq!(image, "redis:7-alpine");
                assert!(message.contains("manifest unknown"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ensure_container_stops_when_daemon_unreachable() {
        let daemon = MemoryRuntime::default();
        daemon.fail_inspects();

        let err = ensure_container(&daemon, &redis_config())
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::CommandFailed { .. }));
        assert_eq!(daemon.pull_calls(), 0);
        assert_eq!(daemon.create_calls(), 0);
    }

    /// Runtime whose binary is a shell script printing `stderr` and failing.
    #[cfg(unix)]
    fn failing_cli(dir: &tempfile::TempDir, stderr: &str) -> ContainerRuntime {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("docker");
        std::fs::write(&path, format!("#!/bin/sh\necho '{stderr}' >&2\nexit 1\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        ContainerRuntime::with_binary(RuntimeType::Docker, path.display().to_string())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn container_state_reports_missing_container_as_absent() {
        let dir = tempfile::TempDir::new().unwrap();
        let runtime = failing_cli(
            &dir,
            "Error response from daemon: No such container: kp_p_s_app",
        );

        let state = runtime.container_state("kp_p_s_app").await.unwrap();
        assert_eq!(state, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn container_state_propagates_daemon_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let runtime = failing_cli(
            &dir,
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock.",
        );

        let err = runtime.container_state("kp_p_s_app").await.unwrap_err();
        match err {
            ContainerError::CommandFailed { command, message } => {
                assert_eq!(command, "container inspect");
                assert!(message.contains("Cannot connect to the Docker daemon"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_container_runtime_health_check() {
        let runtime = ContainerRuntime::new();
        // Only meaningful where docker or podman is installed
        if let Ok(version) = runtime.health_check().await {
            assert!(!version.is_empty());
        }
    }
}
