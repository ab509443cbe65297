//! Container types and configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::error::{ContainerError, ContainerResult};

/// Label carrying the project id of a preview resource.
pub const PROJECT_LABEL: &str = "project_id";

/// Label carrying the session id of a preview resource.
pub const SESSION_LABEL: &str = "session_id";

/// Label marking containers managed by this service.
pub const MANAGED_LABEL: &str = "kosuke.preview";

/// Port mapping configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u16,
    /// Port in the container.
    pub container_port: u16,
}

/// Configuration for creating a new container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name.
    pub name: String,
    /// Docker/OCI image to use.
    pub image: String,
    /// Command to run (image default when empty).
    pub command: Vec<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Port mappings (ignored when network_mode is "host").
    pub ports: Vec<PortMapping>,
    /// Labels for the container.
    pub labels: BTreeMap<String, String>,
    /// Network to attach to (e.g. a user-defined bridge, "host").
    pub network_mode: Option<String>,
}

impl ContainerConfig {
    /// Create a new container config with the given name and image.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Attach the labels an external reaper uses to find session resources.
    pub fn session_labels(self, project_id: &str, session_id: &str) -> Self {
        self.label(PROJECT_LABEL, project_id)
            .label(SESSION_LABEL, session_id)
            .label(MANAGED_LABEL, "true")
    }

    /// Validate all container configuration fields.
    ///
    /// Called before any CLI invocation so user-influenced values never
    /// reach the daemon unchecked.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_container_name(&self.name)?;
        validate_image_name(&self.image)?;

        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }

        for (key, value) in &self.labels {
            validate_label(key, value)?;
        }

        if let Some(ref network) = self.network_mode {
            validate_network_name(network)?;
        }

        Ok(())
    }

    /// Set the command to run.
    pub fn command(mut self, cmd: Vec<String>) -> Self {
        self.command = cmd;
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add multiple environment variables.
    pub fn envs(mut self, envs: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(envs);
        self
    }

    /// Add a port mapping.
    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push(PortMapping {
            host_port,
            container_port,
        });
        self
    }

    /// Set the network mode.
    pub fn network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Arguments for `run -d`, image and command last.
    pub(crate) fn run_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
        ];

        if let Some(ref network) = self.network_mode {
            args.push("--network".to_string());
            args.push(network.clone());
        }

        // Ports are reachable directly in host network mode
        if self.network_mode.as_deref() != Some("host") {
            for port in &self.ports {
                args.push("-p".to_string());
                args.push(format!("{}:{}", port.host_port, port.container_port));
            }
        }

        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// Container state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ContainerState {
    /// Parse the `{{.State.Status}}` string reported by inspect.
    pub fn parse(status: &str) -> Self {
        match status.trim().trim_matches('"').to_ascii_lowercase().as_str() {
            "created" | "configured" | "initialized" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "exited" | "stopped" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Removing => "removing",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
            ContainerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Summary of a container matched by label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub labels: BTreeMap<String, String>,
}

/// Parse one line of `ps --format '{{.ID}}\t{{.Names}}\t{{.State}}\t{{.Labels}}'`.
pub(crate) fn parse_ps_line(line: &str) -> Option<ContainerSummary> {
    let mut parts = line.splitn(4, '\t');
    let id = parts.next()?.trim();
    let name = parts.next()?.trim();
    if id.is_empty() || name.is_empty() {
        return None;
    }
    let state = ContainerState::parse(parts.next().unwrap_or_default());
    let labels = parts
        .next()
        .unwrap_or_default()
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    Some(ContainerSummary {
        id: id.to_string(),
        name: name.trim_start_matches('/').to_string(),
        state,
        labels,
    })
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate a Docker/OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@')
    };
    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container name or ID.
///
/// Names must be alphanumeric with hyphens and underscores and must start
/// with an alphanumeric character or underscore.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    let Some(first) = name.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    };

    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }

    if !first.is_ascii_alphanumeric() && first != '_' {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{}' contains invalid characters",
            name
        )));
    }

    Ok(())
}

/// Network names share the container name alphabet, plus `.`.
pub fn validate_network_name(network: &str) -> ContainerResult<()> {
    let valid_chars = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if network.is_empty() || network.len() > 128 || !network.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "invalid network name '{}'",
            network
        )));
    }
    Ok(())
}

/// Environment variable keys: POSIX names.
fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    let Some(first) = key.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    };

    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }

    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters",
            key
        )));
    }

    Ok(())
}

/// Label keys are reverse-DNS style; values may not break the `ps` output.
fn validate_label(key: &str, value: &str) -> ContainerResult<()> {
    let key_ok = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if !key_ok {
        return Err(ContainerError::InvalidInput(format!(
            "invalid label key '{}'",
            key
        )));
    }

    if value.chars().any(|c| matches!(c, ',' | '=' | '\n' | '\r' | '\t' | '\0')) {
        return Err(ContainerError::InvalidInput(format!(
            "label '{}' has a value with reserved characters",
            key
        )));
    }

    Ok(())
}
