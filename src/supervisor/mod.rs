//! Lifecycle of the coordination service binary in colocated deployments.

mod cli;
mod delegated;
mod embedded;
mod log_buffer;

pub use cli::UNKNOWN_VERSION;
pub use delegated::{process_running, CommandLine, DelegatedBackend};
pub use embedded::EmbeddedBackend;
pub use log_buffer::LogBuffer;

use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::config::{ColocatedSettings, Controller};
use crate::credentials::KeyRotator;
use crate::error::{ProcessError, Result};
use crate::release::ReleaseManager;
use crate::rpc::api_key_prefix;

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Process control, chosen once from configuration.
pub enum Backend {
    Embedded(EmbeddedBackend),
    Delegated(DelegatedBackend),
}

impl Backend {
    pub fn from_settings(
        settings: &ColocatedSettings,
        logs: Arc<LogBuffer>,
        stop_timeout: Duration,
    ) -> std::result::Result<Self, ProcessError> {
        match &settings.controller {
            Controller::Embedded => Ok(Self::Embedded(EmbeddedBackend::new(
                settings.app.clone(),
                settings.config.clone(),
                logs,
                stop_timeout,
            ))),
            Controller::Delegated {
                start,
                stop,
                restart,
            } => Ok(Self::Delegated(DelegatedBackend::new(
                settings.app.clone(),
                settings.config.clone(),
                start,
                stop,
                restart.as_deref(),
            )?)),
        }
    }

    pub async fn is_running(&self) -> bool {
        match self {
            Self::Embedded(b) => b.is_running(),
            Self::Delegated(b) => b.is_running().await,
        }
    }

    pub async fn start(&self) -> std::result::Result<(), ProcessError> {
        match self {
            Self::Embedded(b) => b.start().await,
            Self::Delegated(b) => b.start().await,
        }
    }

    pub async fn stop(&self) -> std::result::Result<(), ProcessError> {
        match self {
            Self::Embedded(b) => b.stop().await,
            Self::Delegated(b) => {
                tokio::time::timeout(DEFAULT_STOP_TIMEOUT, b.stop())
                    .await
                    .map_err(|_| ProcessError::StopTimeout(DEFAULT_STOP_TIMEOUT))?
            }
        }
    }

    pub fn config_path(&self) -> &Path {
        match self {
            Self::Embedded(b) => b.config_path(),
            Self::Delegated(b) => b.config_path(),
        }
    }
}

pub struct ProcessSupervisor {
    settings: ColocatedSettings,
    releases: Arc<ReleaseManager>,
    logs: Arc<LogBuffer>,
    stop_timeout: Duration,
    backend: OnceCell<Backend>,
    version: Mutex<String>,
    api_key: Mutex<Option<String>>,
    last_error: Mutex<Option<String>>,
}

fn read<T: Clone>(cell: &Mutex<T>) -> T {
    match cell.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn write<T>(cell: &Mutex<T>, value: T) {
    match cell.lock() {
        Ok(mut guard) => *guard = value,
        Err(poisoned) => *poisoned.into_inner() = value,
    }
}

impl ProcessSupervisor {
    pub fn new(settings: ColocatedSettings, releases: Arc<ReleaseManager>) -> Self {
        Self {
            settings,
            releases,
            logs: Arc::new(LogBuffer::default()),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            backend: OnceCell::new(),
            version: Mutex::new(UNKNOWN_VERSION.to_string()),
            api_key: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn binary_path(&self) -> &Path {
        &self.settings.app
    }

    pub fn config_path(&self) -> &Path {
        &self.settings.config
    }

    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.logs
    }

    pub fn version(&self) -> String {
        read(&self.version)
    }

    pub fn api_key(&self) -> Option<String> {
        read(&self.api_key)
    }

    /// Seed the cached key, e.g. from the credential store at startup.
    pub fn set_api_key(&self, key: Option<String>) {
        write(&self.api_key, key);
    }

    pub fn last_error(&self) -> Option<String> {
        read(&self.last_error).or_else(|| match self.backend.get() {
            Some(Backend::Embedded(b)) => b.exit_error(),
            _ => None,
        })
    }

    pub async fn is_running(&self) -> bool {
        match self.backend.get() {
            Some(backend) => backend.is_running().await,
            None => false,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let result = self.try_start().await;
        write(&self.last_error, result.as_ref().err().map(|e| e.to_string()));
        result
    }

    async fn try_start(&self) -> Result<()> {
        let backend = self
            .backend
            .get_or_try_init(|| async {
                Backend::from_settings(&self.settings, Arc::clone(&self.logs), self.stop_timeout)
            })
            .await?;

        self.ensure_binary().await?;
        if !self.ensure_config().await? {
            return Ok(());
        }

        let version = cli::version(&self.settings.app).await;
        info!(version = %version, "Starting coordination service");
        write(&self.version, version);

        backend.start().await?;
        Ok(())
    }

    /// Install the latest release when the binary is absent.
    async fn ensure_binary(&self) -> Result<()> {
        let app = &self.settings.app;
        if app.is_dir() {
            warn!(path = %app.display(), "Service binary path is a directory, removing it");
            tokio::fs::remove_dir_all(app).await?;
        }
        if !app.exists() {
            info!(path = %app.display(), "Service binary missing, installing latest release");
            let release = self.releases.update().await?;
            info!(tag = %release.tag_name, "Installed service binary");
        }
        Ok(())
    }

    /// Returns false when a fresh template was just put in place; the
    /// operator reviews it before the first start.
    async fn ensure_config(&self) -> Result<bool> {
        let config = &self.settings.config;
        if config.is_dir() {
            return Err(ProcessError::ConfigIsDir(config.clone()).into());
        }
        if config.exists() {
            return Ok(true);
        }
        self.releases.download_config_template(config).await?;
        warn!(
            path = %config.display(),
            "Downloaded service config template, review it and start again"
        );
        Ok(false)
    }

    pub async fn stop(&self) -> Result<()> {
        let Some(backend) = self.backend.get() else {
            return Ok(());
        };
        if !backend.is_running().await {
            return Ok(());
        }
        backend.stop().await?;
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        if let Some(Backend::Delegated(backend)) = self.backend.get() {
            if let Some(result) = backend.restart().await {
                write(&self.last_error, result.as_ref().err().map(|e| e.to_string()));
                return Ok(result?);
            }
        }
        if let Err(e) = self.stop().await {
            warn!(error = %e, "Stop before restart failed, not starting");
            return Err(e);
        }
        self.start().await
    }

    /// Expire the cached key (best effort) and mint a new one.
    pub async fn refresh_api_key(&self) -> std::result::Result<String, ProcessError> {
        let app = &self.settings.app;
        let config = &self.settings.config;

        if let Some(old) = self.api_key() {
            let prefix = api_key_prefix(&old);
            if let Err(e) = cli::expire_api_key(app, config, prefix).await {
                warn!(prefix, error = %e, "Failed to expire previous api key");
            }
        }

        match cli::create_api_key(app, config).await {
            Ok(key) => {
                info!(prefix = api_key_prefix(&key), "Created api key");
                write(&self.api_key, Some(key.clone()));
                Ok(key)
            }
            Err(e) => {
                write(&self.api_key, None);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl KeyRotator for ProcessSupervisor {
    async fn rotate_api_key(&self) -> std::result::Result<String, ProcessError> {
        self.refresh_api_key().await
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("app", &self.settings.app)
            .field("config", &self.settings.config)
            .field("controller", &self.settings.controller)
            .field("version", &self.version())
            .finish()
    }
}
