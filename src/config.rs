use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::rpc::{ConnectionSettings, TlsMaterial};

pub const DEFAULT_RELEASE_INDEX: &str = "https://api.github.com/repos/juanfont/headscale/releases";
pub const DEFAULT_CONFIG_TEMPLATE: &str =
    "https://raw.githubusercontent.com/juanfont/headscale/master/config-example.yaml";
const DEFAULT_TEMP_DIR: &str = "/tmp/headscale";

const CONTAINER_APP: &str = "/bin/headscale";
const CONTAINER_SERVICE_CONFIG: &str = "/etc/headscale/config.yaml";

/// On-disk configuration (`config.toml`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub deployment: DeploymentSection,
    pub service: Option<ServiceSection>,
    pub connection: ConnectionSection,
    pub release: ReleaseSection,
    pub scheduler: SchedulerSection,
    pub log: LogSection,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    #[default]
    Colocated,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DeploymentSection {
    pub mode: DeploymentMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceSection {
    /// Path of the supervised binary
    pub app: Option<PathBuf>,
    /// Path of the supervised service's own config file
    pub config: Option<PathBuf>,
    pub controller: Option<ControllerSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ControllerSection {
    /// Own the child process directly (`true`) or drive a service manager
    pub embedded: bool,
    pub start: Option<String>,
    pub stop: Option<String>,
    pub restart: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConnectionSection {
    /// gRPC address. Required for remote deployments, read from the service
    /// config file when colocated and unset.
    pub address: Option<String>,
    pub insecure: Option<bool>,
    pub api_key: Option<String>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseSection {
    pub index_url: String,
    pub config_template_url: String,
    pub temp_dir: PathBuf,
    pub download_timeout_secs: Option<u64>,
}

impl Default for ReleaseSection {
    fn default() -> Self {
        Self {
            index_url: DEFAULT_RELEASE_INDEX.to_string(),
            config_template_url: DEFAULT_CONFIG_TEMPLATE.to_string(),
            temp_dir: PathBuf::from(DEFAULT_TEMP_DIR),
            download_timeout_secs: None,
        }
    }
}

impl ReleaseSection {
    pub fn download_timeout(&self) -> Option<Duration> {
        self.download_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub status_interval_secs: u64,
    pub liveness_interval_secs: u64,
    pub upgrade_interval_secs: u64,
    pub staleness_window_secs: u64,
    pub liveness_failure_threshold: u32,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            status_interval_secs: 2,
            liveness_interval_secs: 30,
            upgrade_interval_secs: 24 * 60 * 60,
            staleness_window_secs: 3 * 60,
            liveness_failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Validated deployment topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deployment {
    Colocated(ColocatedSettings),
    Remote,
}

impl Deployment {
    pub fn is_colocated(&self) -> bool {
        matches!(self, Self::Colocated(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColocatedSettings {
    pub app: PathBuf,
    pub config: PathBuf,
    pub controller: Controller,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Controller {
    Embedded,
    Delegated {
        start: String,
        stop: String,
        restart: Option<String>,
    },
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        tracing::trace!(path = %path.display(), "Loading config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Invalid {
            key: "config.toml",
            reason: e.to_string(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        tracing::trace!(path = %path.display(), "Saving config");
        let write_err = |reason: String| ConfigError::Write {
            path: path.to_path_buf(),
            reason,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| write_err(e.to_string()))?;
        fs::write(path, content).map_err(|e| write_err(e.to_string()))
    }

    /// Resolve the deployment topology, rejecting incomplete settings.
    pub fn deployment(&self, in_container: bool) -> Result<Deployment, ConfigError> {
        match self.deployment.mode {
            DeploymentMode::Remote => {
                if self.connection.address.is_none() {
                    return Err(ConfigError::Missing("connection.address"));
                }
                Ok(Deployment::Remote)
            }
            DeploymentMode::Colocated if in_container => {
                Ok(Deployment::Colocated(ColocatedSettings {
                    app: PathBuf::from(CONTAINER_APP),
                    config: PathBuf::from(CONTAINER_SERVICE_CONFIG),
                    controller: Controller::Embedded,
                }))
            }
            DeploymentMode::Colocated => {
                let service = self.service.as_ref().ok_or(ConfigError::Missing("service"))?;
                let config = service
                    .config
                    .clone()
                    .ok_or(ConfigError::Missing("service.config"))?;
                let controller = service
                    .controller
                    .as_ref()
                    .ok_or(ConfigError::Missing("service.controller"))?;
                let app = service.app.clone().ok_or(ConfigError::Missing("service.app"))?;

                let controller = if controller.embedded {
                    Controller::Embedded
                } else {
                    let start = non_empty(&controller.start)
                        .ok_or(ConfigError::Missing("service.controller.start"))?;
                    let stop = non_empty(&controller.stop)
                        .ok_or(ConfigError::Missing("service.controller.stop"))?;
                    Controller::Delegated {
                        start,
                        stop,
                        restart: non_empty(&controller.restart),
                    }
                };

                Ok(Deployment::Colocated(ColocatedSettings {
                    app,
                    config,
                    controller,
                }))
            }
        }
    }

    /// Build the initial connection settings. `service_file` is the parsed
    /// config of a colocated service, used when no address is configured.
    pub fn connection_settings(
        &self,
        service_file: Option<&ServiceFile>,
        api_key: Option<String>,
    ) -> Result<ConnectionSettings, ConfigError> {
        let conn = &self.connection;

        let address = conn
            .address
            .clone()
            .or_else(|| service_file.and_then(|f| f.grpc_listen_addr.clone()))
            .ok_or(ConfigError::Missing("connection.address"))?;

        let insecure = conn
            .insecure
            .unwrap_or_else(|| service_file.map(|f| f.grpc_allow_insecure).unwrap_or(false));

        let tls = match (&conn.cert, &conn.key) {
            (Some(cert), Some(key)) => Some(TlsMaterial {
                cert: read_bytes(cert)?,
                key: read_bytes(key)?,
                ca: conn.ca.as_deref().map(read_bytes).transpose()?,
                server_name: conn.server_name.clone(),
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("connection.key")),
            (None, Some(_)) => return Err(ConfigError::Missing("connection.cert")),
        };

        Ok(ConnectionSettings {
            address,
            api_key: api_key.or_else(|| conn.api_key.clone()).unwrap_or_default(),
            insecure,
            tls,
        })
    }
}

/// The subset of the supervised service's YAML config this crate reads.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ServiceFile {
    #[serde(default)]
    pub grpc_listen_addr: Option<String>,
    #[serde(default)]
    pub grpc_allow_insecure: bool,
}

impl ServiceFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, ConfigError> {
    fs::read(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
