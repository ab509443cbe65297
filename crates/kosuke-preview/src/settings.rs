//! Layered configuration: TOML file, then `KOSUKE__*` environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::container::{
    ContainerRuntime, DEFAULT_COMMAND_TIMEOUT, DEFAULT_PULL_TIMEOUT, RuntimeType,
};
use crate::naming::{DEFAULT_PREFIX, ResourceNamer};
use crate::preview::PreviewServiceConfig;
use crate::readiness::PollerConfig;
use crate::storage::{DEFAULT_REDIS_IMAGE, RedisSettings};

pub const APP_NAME: &str = "kosuke-preview";

/// Prefix of environment overrides, e.g. `KOSUKE__NAMING__PREFIX`.
pub const ENV_PREFIX: &str = "KOSUKE";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub naming: NamingConfig,
    pub container: ContainerSettings,
    pub storage: StorageSettings,
    pub preview: PreviewServiceConfig,
    pub probe: ProbeSettings,
    pub poller: PollerSettings,
}

impl AppConfig {
    /// Copy safe to print: credentials in connection strings are masked.
    pub fn redacted(&self) -> AppConfig {
        let mut config = self.clone();
        config.storage.admin_database_url = config
            .storage
            .admin_database_url
            .as_deref()
            .map(redact_url);
        config
    }
}

/// Mask the password of a URL. Unparseable values are hidden entirely.
pub fn redact_url(raw: &str) -> String {
    match reqwest::Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() && url.set_password(Some(REDACTED)).is_err() {
                return REDACTED.to_string();
            }
            url.to_string()
        }
        Err(_) => REDACTED.to_string(),
    }
}

const REDACTED: &str = "********";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Tear down every tracked preview on shutdown.
    pub teardown_on_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            teardown_on_shutdown: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    /// Part of the collision domain: deployments with different prefixes
    /// never share resources.
    pub prefix: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl NamingConfig {
    pub fn namer(&self) -> ResourceNamer {
        ResourceNamer::new(self.prefix.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Auto-detected when unset.
    pub runtime: Option<RuntimeType>,
    /// Binary override, e.g. a full path to `podman`.
    pub binary: Option<String>,
    pub command_timeout_secs: u64,
    pub pull_timeout_secs: u64,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            runtime: None,
            binary: None,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT.as_secs(),
            pull_timeout_secs: DEFAULT_PULL_TIMEOUT.as_secs(),
        }
    }
}

impl ContainerSettings {
    pub fn runtime(&self) -> ContainerRuntime {
        let runtime = match (self.runtime, &self.binary) {
            (Some(kind), Some(binary)) => ContainerRuntime::with_binary(kind, binary.as_str()),
            (Some(kind), None) => ContainerRuntime::with_type(kind),
            (None, Some(binary)) => {
                let kind = if binary.contains("podman") {
                    RuntimeType::Podman
                } else {
                    RuntimeType::Docker
                };
                ContainerRuntime::with_binary(kind, binary.as_str())
            }
            (None, None) => ContainerRuntime::new(),
        };
        runtime.with_timeouts(
            Duration::from_secs(self.command_timeout_secs),
            Duration::from_secs(self.pull_timeout_secs),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Administrative connection string; postgres storages fail without it.
    pub admin_database_url: Option<String>,
    pub statement_timeout_secs: u64,
    pub redis_image: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            admin_database_url: None,
            statement_timeout_secs: 30,
            redis_image: DEFAULT_REDIS_IMAGE.to_string(),
        }
    }
}

impl StorageSettings {
    /// Redis containers join the same network as the app containers.
    pub fn redis(&self, network: Option<&str>) -> RedisSettings {
        RedisSettings {
            image: self.redis_image.clone(),
            network: network.map(str::to_string),
        }
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub timeout_ms: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self { timeout_ms: 2000 }
    }
}

impl ProbeSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Poller timing in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerSettings {
    pub settle_delay_ms: u64,
    pub initial_grace_ms: u64,
    pub fast_delay_ms: u64,
    pub fast_attempts: u32,
    pub slow_delay_ms: u64,
    pub max_attempts: u32,
    pub heartbeat_interval_ms: u64,
    pub progress_cap: u8,
    pub request_timeout_ms: u64,
}

impl Default for PollerSettings {
    fn default() -> Self {
        let defaults = PollerConfig::default();
        Self {
            settle_delay_ms: defaults.settle_delay.as_millis() as u64,
            initial_grace_ms: defaults.initial_grace.as_millis() as u64,
            fast_delay_ms: defaults.fast_delay.as_millis() as u64,
            fast_attempts: defaults.fast_attempts,
            slow_delay_ms: defaults.slow_delay.as_millis() as u64,
            max_attempts: defaults.max_attempts,
            heartbeat_interval_ms: defaults.heartbeat_interval.as_millis() as u64,
            progress_cap: defaults.progress_cap,
            request_timeout_ms: 10_000,
        }
    }
}

impl PollerSettings {
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            initial_grace: Duration::from_millis(self.initial_grace_ms),
            fast_delay: Duration::from_millis(self.fast_delay_ms),
            fast_attempts: self.fast_attempts,
            slow_delay: Duration::from_millis(self.slow_delay_ms),
            max_attempts: self.max_attempts,
            // interval() panics on zero
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms.max(1)),
            progress_cap: self.progress_cap,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Resolve the config file path, honouring an explicit override.
pub fn config_file_path(override_path: Option<PathBuf>) -> Result<PathBuf> {
    let config_file = match override_path {
        Some(path) => {
            let expanded = expand_path(path)?;
            if expanded.is_dir() {
                expanded.join("config.toml")
            } else {
                expanded
            }
        }
        None => default_config_dir()?.join("config.toml"),
    };

    if config_file.parent().is_none() {
        return Err(anyhow!("invalid config file path: {config_file:?}"));
    }
    Ok(config_file)
}

/// Load configuration from `path` (optional) layered with the environment.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let built = Config::builder()
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()
        .with_context(|| format!("reading configuration from {}", path.display()))?;

    let mut config: AppConfig = built
        .try_deserialize()
        .context("deserializing configuration")?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    Ok(config)
}

/// Write the default config file, creating its parent directory.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    format!(
        "# Configuration for {}\n# File: {}\n# Every key can be overridden with {}__<SECTION>__<KEY>\n\n",
        APP_NAME,
        path.display(),
        ENV_PREFIX
    )
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}
