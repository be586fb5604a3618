//! Owns every component and their startup and shutdown order.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clienv;
use crate::config::{AppConfig, Deployment, ServiceFile};
use crate::credentials::{CredentialStore, FileCredentialStore};
use crate::error::Result;
use crate::release::{GithubFeed, ReleaseManager, ReleaseSource};
use crate::rpc::{
    api_key_prefix, AdminClient, ConnectionManager, Connector, GrpcConnector, Rotation,
};
use crate::scheduler::{check_liveness, LivenessWatch, Scheduler, Targets, Timings};
use crate::status::{StatusCache, StatusFile};
use crate::supervisor::ProcessSupervisor;

/// Where the headscale example config listens for gRPC.
const DEFAULT_COLOCATED_ADDRESS: &str = "127.0.0.1:50443";

/// Process-level inputs that do not live in `config.toml`.
#[derive(Debug, Clone)]
pub struct Environment {
    pub data_dir: PathBuf,
    pub in_container: bool,
    pub api_key: Option<String>,
    pub release_index: Option<String>,
}

impl Environment {
    pub fn from_process() -> Self {
        Self {
            data_dir: clienv::data_dir(),
            in_container: clienv::in_container(),
            api_key: clienv::api_key(),
            release_index: clienv::release_index(),
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    pub fn status_path(&self) -> PathBuf {
        self.data_dir.join("status.json")
    }
}

pub struct Runtime {
    config: AppConfig,
    deployment: Deployment,
    store: Arc<FileCredentialStore>,
    releases: Arc<ReleaseManager>,
    supervisor: Option<Arc<ProcessSupervisor>>,
    connection: Arc<ConnectionManager>,
    client: AdminClient,
    status: Arc<StatusCache>,
    timings: Timings,
    scheduler: tokio::sync::Mutex<Option<Scheduler>>,
}

impl Runtime {
    /// Wire up every component with the real network seams.
    pub async fn build(config: AppConfig, env: Environment) -> Result<Self> {
        let index = env
            .release_index
            .clone()
            .unwrap_or_else(|| config.release.index_url.clone());
        let feed = GithubFeed::new(&index, config.release.download_timeout())?;
        Self::build_with(config, env, Arc::new(feed), Arc::new(GrpcConnector)).await
    }

    pub async fn build_with(
        config: AppConfig,
        env: Environment,
        source: Arc<dyn ReleaseSource>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let deployment = config.deployment(env.in_container)?;
        let store = Arc::new(FileCredentialStore::new(env.state_path()));

        let persisted = match store.load_api_key().await {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable credential state");
                None
            }
        };
        let api_key = env.api_key.clone().or(persisted);

        let (app_path, service_file) = match &deployment {
            Deployment::Colocated(settings) => {
                (settings.app.clone(), Some(colocated_service_file(&settings.config)))
            }
            Deployment::Remote => (PathBuf::from("headscale"), None),
        };

        let releases = Arc::new(ReleaseManager::new(
            source,
            app_path,
            config.release.temp_dir.clone(),
            config.release.config_template_url.clone(),
        ));

        let supervisor = match &deployment {
            Deployment::Colocated(settings) => {
                let supervisor = ProcessSupervisor::new(settings.clone(), Arc::clone(&releases));
                supervisor.set_api_key(api_key.clone());
                Some(Arc::new(supervisor))
            }
            Deployment::Remote => None,
        };

        let settings = config.connection_settings(service_file.as_ref(), api_key)?;
        if settings.api_key.is_empty() && supervisor.is_none() {
            warn!("No api key configured for the remote coordination service");
        }
        debug!(
            target_addr = %settings.address,
            prefix = api_key_prefix(&settings.api_key),
            "Resolved connection settings"
        );

        let rotation = supervisor.as_ref().map(|s| Rotation {
            rotator: s.clone(),
            store: store.clone() as Arc<dyn CredentialStore>,
        });
        let connection = Arc::new(ConnectionManager::new(settings, connector, rotation));
        let client = AdminClient::new(Arc::clone(&connection));

        let status =
            Arc::new(StatusCache::new().with_file(StatusFile::new(env.status_path())));
        // Snapshots flow for one staleness window after startup.
        status.touch();

        Ok(Self {
            timings: Timings::from(&config.scheduler),
            config,
            deployment,
            store,
            releases,
            supervisor,
            connection,
            client,
            status,
            scheduler: tokio::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    pub fn client(&self) -> &AdminClient {
        &self.client
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn releases(&self) -> &Arc<ReleaseManager> {
        &self.releases
    }

    pub fn supervisor(&self) -> Option<&Arc<ProcessSupervisor>> {
        self.supervisor.as_ref()
    }

    pub fn status(&self) -> &Arc<StatusCache> {
        &self.status
    }

    pub fn credential_store(&self) -> &Arc<FileCredentialStore> {
        &self.store
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn targets(&self) -> Targets {
        Targets {
            status: Arc::clone(&self.status),
            supervisor: self.supervisor.clone(),
            releases: Arc::clone(&self.releases),
            connection: Arc::clone(&self.connection),
        }
    }

    /// Bring the service up, open the admin channel and start the background
    /// tasks. Failures leave the runtime degraded rather than stopped.
    pub async fn start(&self) {
        let mut liveness = LivenessWatch::new(self.timings.liveness_threshold);
        if let Some(supervisor) = &self.supervisor {
            if let Err(e) = supervisor.start().await {
                warn!(error = %e, "Coordination service did not start");
            }
            self.reload_service_file();

            if let Err(e) = self.releases.check_for_update().await {
                warn!(error = %e, "Upgrade check failed");
            }
            check_liveness(&mut liveness, supervisor.as_ref()).await;
        }

        if let Err(e) = self.connection.connect().await {
            warn!(error = %e, "Admin channel unavailable");
        }

        let mut scheduler = self.scheduler.lock().await;
        if scheduler.is_none() {
            *scheduler = Some(Scheduler::start(self.targets(), self.timings, liveness));
        }
        info!(colocated = self.deployment.is_colocated(), "Runtime started");
    }

    /// Re-derive the address after the service config may have just been
    /// downloaded.
    fn reload_service_file(&self) {
        let Deployment::Colocated(settings) = &self.deployment else {
            return;
        };
        let file = colocated_service_file(&settings.config);
        let current = self.connection.settings();
        match self.config.connection_settings(Some(&file), Some(current.api_key.clone())) {
            Ok(next) if next != *current => {
                info!(target_addr = %next.address, "Connection settings changed");
                self.connection.update_settings(next);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to re-read connection settings"),
        }
    }

    /// Stop background tasks, then the supervised service. Safe to call
    /// more than once.
    pub async fn shutdown(&self) {
        if let Some(scheduler) = self.scheduler.lock().await.take() {
            scheduler.stop().await;
        }
        if let Some(supervisor) = &self.supervisor {
            if let Err(e) = supervisor.stop().await {
                warn!(error = %e, "Failed to stop coordination service");
            }
        }
        info!("Runtime stopped");
    }

    /// Run until `signal` resolves. Shutdown happens on every exit path,
    /// including a signal arriving during startup.
    pub async fn run_until<F>(&self, signal: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(signal);
        tokio::select! {
            _ = self.start() => (&mut signal).await,
            _ = &mut signal => info!("Shutdown requested during startup"),
        }
        self.shutdown().await;
    }

    /// Mint a new key, persist it and reconnect with it.
    pub async fn rotate_api_key(&self) -> Result<String> {
        let key = self.connection.rotate_api_key().await?;
        if let Err(e) = self.connection.reconnect().await {
            warn!(error = %e, "Reconnect with the new api key failed");
        }
        Ok(key)
    }
}

/// Parsed service config, or the headscale defaults when it is missing.
fn colocated_service_file(path: &std::path::Path) -> ServiceFile {
    match ServiceFile::load(path) {
        Ok(file) => file,
        Err(e) => {
            debug!(error = %e, "Service config unavailable, assuming defaults");
            ServiceFile {
                grpc_listen_addr: Some(DEFAULT_COLOCATED_ADDRESS.to_string()),
                grpc_allow_insecure: false,
            }
        }
    }
}

/// Resolves on SIGINT or SIGTERM (Ctrl+C elsewhere).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                _ => {
                    warn!("Failed to install signal handlers, falling back to Ctrl+C");
                    tokio::signal::ctrl_c().await.ok();
                    return;
                }
            };
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeploymentMode, ServiceSection};
    use crate::error::{ConnectionError, Error, ReleaseError};
    use crate::release::Release;
    use crate::rpc::{AdminTransport, ConnectionSettings, LinkStatus, TrustPool};
    use crate::status::ServiceStatus;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Refusing {
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Connector for Refusing {
        async fn dial(
            &self,
            settings: &ConnectionSettings,
            _trust: &TrustPool,
        ) -> std::result::Result<Arc<dyn AdminTransport>, ConnectionError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Err(ConnectionError::Dial {
                target: settings.address.clone(),
                reason: "refused".into(),
            })
        }
    }

    struct EmptyFeed;

    #[async_trait]
    impl ReleaseSource for EmptyFeed {
        async fn list(&self) -> std::result::Result<Vec<Release>, ReleaseError> {
            Ok(Vec::new())
        }
        async fn get(&self, _id: u64) -> std::result::Result<Release, ReleaseError> {
            Err(ReleaseError::EmptyFeed)
        }
        async fn download(&self, _url: &str, _dest: &Path) -> std::result::Result<(), ReleaseError> {
            Err(ReleaseError::EmptyFeed)
        }
    }

    fn env(dir: &Path) -> Environment {
        Environment {
            data_dir: dir.to_path_buf(),
            in_container: false,
            api_key: None,
            release_index: None,
        }
    }

    fn remote_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.deployment.mode = DeploymentMode::Remote;
        config.connection.address = Some("10.0.0.5:50443".into());
        config.connection.insecure = Some(true);
        config.connection.api_key = Some("cfg.key".into());
        config
    }

    async fn build(config: AppConfig, env: Environment) -> Result<Runtime> {
        Runtime::build_with(
            config,
            env,
            Arc::new(EmptyFeed),
            Arc::new(Refusing {
                dials: AtomicUsize::new(0),
            }),
        )
        .await
    }

    #[tokio::test]
    async fn incomplete_colocated_config_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.service = Some(ServiceSection {
            app: Some(dir.path().join("headscale")),
            config: None,
            controller: None,
        });
        let err = build(config, env(dir.path())).await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn persisted_key_wins_over_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("state.json"));
        store.save_api_key("stored.key").await.unwrap();

        let runtime = build(remote_config(), env(dir.path())).await.unwrap();
        assert_eq!(runtime.connection().settings().api_key, "stored.key");
        assert!(runtime.supervisor().is_none());
        assert!(!runtime.connection().is_colocated());
    }

    #[tokio::test]
    async fn environment_key_wins_over_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = env(dir.path());
        env.api_key = Some("env.key".into());
        let runtime = build(remote_config(), env).await.unwrap();
        assert_eq!(runtime.connection().settings().api_key, "env.key");
    }

    #[tokio::test]
    async fn remote_rotation_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = build(remote_config(), env(dir.path())).await.unwrap();
        let err = runtime.rotate_api_key().await.unwrap_err();
        assert!(matches!(err, Error::Connection(ConnectionError::Rotation(_))));
    }

    #[tokio::test]
    async fn signal_during_startup_still_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = build(remote_config(), env(dir.path())).await.unwrap();

        // The connect grace period outlasts the signal.
        runtime.run_until(async {}).await;

        assert!(runtime.scheduler.lock().await.is_none());
        assert_ne!(runtime.connection().link_status(), LinkStatus::Connected);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = build(remote_config(), env(dir.path())).await.unwrap();
        runtime.shutdown().await;
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn remote_view_reports_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = build(remote_config(), env(dir.path())).await.unwrap();
        let view = runtime.targets().service_view().await;
        assert_eq!(view.status, ServiceStatus::Disconnected);
        assert_eq!(view.version, crate::supervisor::UNKNOWN_VERSION);
        assert!(view.log_tail.is_empty());
    }

    #[tokio::test]
    async fn fresh_runtime_publishes_status() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = build(remote_config(), env(dir.path())).await.unwrap();
        assert!(!runtime.status().is_stale(runtime.timings.staleness_window));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn colocated_view_carries_service_output() {
        let dir = tempfile::tempdir().unwrap();
        let app = crate::supervisor::tests::fake_service(dir.path());
        let service_config = dir.path().join("config.yaml");
        std::fs::write(&service_config, "grpc_listen_addr: 127.0.0.1:50443\n").unwrap();
        let mut config = AppConfig::default();
        config.service = Some(ServiceSection {
            app: Some(app),
            config: Some(service_config),
            controller: Some(crate::config::ControllerSection {
                embedded: true,
                ..Default::default()
            }),
        });
        let runtime = build(config, env(dir.path())).await.unwrap();
        let supervisor = runtime.supervisor().cloned().unwrap();
        supervisor.start().await.unwrap();

        let mut view = runtime.targets().service_view().await;
        for _ in 0..40 {
            if !view.log_tail.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            view = runtime.targets().service_view().await;
        }
        supervisor.stop().await.unwrap();

        assert_eq!(view.status, ServiceStatus::Running);
        assert_eq!(view.log_tail, vec!["listening".to_string()]);
    }

    #[tokio::test]
    async fn colocated_defaults_to_local_listener() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.service = Some(ServiceSection {
            app: Some(dir.path().join("headscale")),
            config: Some(dir.path().join("config.yaml")),
            controller: Some(crate::config::ControllerSection {
                embedded: true,
                ..Default::default()
            }),
        });
        let runtime = build(config, env(dir.path())).await.unwrap();
        assert_eq!(runtime.connection().settings().address, DEFAULT_COLOCATED_ADDRESS);
        assert!(runtime.connection().is_colocated());
        assert!(runtime.supervisor().is_some());
    }
}
