use prost::Message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::proto::ListApiKeysRequest;
use super::settings::{api_key_prefix, ConnectionSettings, SharedSettings, TrustPool};
use super::transport::{is_auth_failure, AdminTransport, Connector};
use crate::credentials::{CredentialStore, KeyRotator};
use crate::error::ConnectionError;

/// Method used to verify a freshly dialed channel.
const PROBE_METHOD: &str = "ListApiKeys";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

/// Retry and grace timings of the connect procedure.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Wait before the first dial of [`ConnectionManager::connect`].
    pub startup_grace: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
            startup_grace: Duration::from_secs(4),
        }
    }
}

/// Snapshot of the channel. Replaced as a whole on every transition.
#[derive(Clone)]
pub struct ConnectionState {
    pub target: String,
    pub status: LinkStatus,
    pub retries: u32,
    pub last_error: Option<String>,
    transport: Option<Arc<dyn AdminTransport>>,
}

impl ConnectionState {
    fn disconnected(target: String) -> Self {
        Self {
            target,
            status: LinkStatus::Disconnected,
            retries: 0,
            last_error: None,
            transport: None,
        }
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("target", &self.target)
            .field("status", &self.status)
            .field("retries", &self.retries)
            .field("last_error", &self.last_error)
            .field("has_channel", &self.transport.is_some())
            .finish()
    }
}

/// Key self-healing, available only when this process supervises the
/// service and can mint keys itself.
#[derive(Clone)]
pub struct Rotation {
    pub rotator: Arc<dyn KeyRotator>,
    pub store: Arc<dyn CredentialStore>,
}

/// Clears an atomic flag when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ConnectionManager {
    settings: SharedSettings,
    trust: TrustPool,
    connector: Arc<dyn Connector>,
    rotation: Option<Rotation>,
    options: ConnectionOptions,
    connecting: AtomicBool,
    rotating: AtomicBool,
    state: RwLock<Arc<ConnectionState>>,
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        connector: Arc<dyn Connector>,
        rotation: Option<Rotation>,
    ) -> Self {
        let target = settings.address.clone();
        Self {
            settings: SharedSettings::new(settings),
            trust: TrustPool::default(),
            connector,
            rotation,
            options: ConnectionOptions::default(),
            connecting: AtomicBool::new(false),
            rotating: AtomicBool::new(false),
            state: RwLock::new(Arc::new(ConnectionState::disconnected(target))),
        }
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Initial connect after startup: waits the grace period, then dials.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let _guard =
            FlagGuard::try_acquire(&self.connecting).ok_or(ConnectionError::AlreadyConnecting)?;

        if !self.options.startup_grace.is_zero() {
            debug!(
                "Waiting {:?} for the service to open its listener",
                self.options.startup_grace
            );
            tokio::time::sleep(self.options.startup_grace).await;
        }
        self.run_connect().await
    }

    /// Tear down and re-establish the channel immediately.
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        let _guard =
            FlagGuard::try_acquire(&self.connecting).ok_or(ConnectionError::AlreadyConnecting)?;
        self.run_connect().await
    }

    async fn run_connect(&self) -> Result<(), ConnectionError> {
        let max_attempts = self.options.max_attempts.max(1);
        let mut rotated = false;
        let mut last_err = ConnectionError::NotConnected;

        for attempt in 1..=max_attempts {
            let settings = self.settings.load();
            // Dropping the old transport closes its channel.
            self.publish(ConnectionState {
                target: settings.address.clone(),
                status: LinkStatus::Connecting,
                retries: attempt - 1,
                last_error: self.state().last_error.clone(),
                transport: None,
            });

            info!(target_addr = %settings.address, attempt, max_attempts, "Connecting to coordination service");

            let err = match self.dial_and_probe(&settings).await {
                Ok(transport) => {
                    self.publish(ConnectionState {
                        target: settings.address.clone(),
                        status: LinkStatus::Connected,
                        retries: 0,
                        last_error: None,
                        transport: Some(transport),
                    });
                    info!(target_addr = %settings.address, "Connected to coordination service");
                    return Ok(());
                }
                Err(err) => err,
            };

            warn!(attempt, error = %err, "Connection attempt failed");
            self.publish(ConnectionState {
                target: settings.address.clone(),
                status: LinkStatus::Faulted,
                retries: attempt,
                last_error: Some(err.to_string()),
                transport: None,
            });

            let auth_failure = matches!(err, ConnectionError::Authentication(_));
            last_err = err;

            if auth_failure && attempt == 1 && !rotated {
                if let Some(rotation) = &self.rotation {
                    rotated = true;
                    match self.rotate_credentials(rotation).await {
                        Ok(_) => continue,
                        Err(e) => {
                            self.settle_disconnected(&settings.address, max_attempts, &e);
                            return Err(e);
                        }
                    }
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.options.retry_delay).await;
            }
        }

        let target = self.settings.load().address.clone();
        self.settle_disconnected(&target, max_attempts, &last_err);
        Err(last_err)
    }

    fn settle_disconnected(&self, target: &str, retries: u32, err: &ConnectionError) {
        self.publish(ConnectionState {
            target: target.to_string(),
            status: LinkStatus::Disconnected,
            retries,
            last_error: Some(err.to_string()),
            transport: None,
        });
    }

    async fn dial_and_probe(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<Arc<dyn AdminTransport>, ConnectionError> {
        let transport = self.connector.dial(settings, &self.trust).await?;
        let probe = ListApiKeysRequest {}.encode_to_vec();

        match transport.unary(PROBE_METHOD, probe, &settings.api_key).await {
            Ok(_) => Ok(transport),
            Err(status) if is_auth_failure(&status) => {
                Err(ConnectionError::Authentication(status.message().to_string()))
            }
            Err(status) => Err(ConnectionError::Probe(status.to_string())),
        }
    }

    /// Mint a new key, persist it and publish it to the live settings.
    /// Returns `Ok(None)` when another rotation is already underway.
    async fn rotate_credentials(
        &self,
        rotation: &Rotation,
    ) -> Result<Option<String>, ConnectionError> {
        let Some(_guard) = FlagGuard::try_acquire(&self.rotating) else {
            debug!("Api key rotation already in progress");
            return Ok(None);
        };

        info!("Rotating api key after authentication failure");
        let key = rotation
            .rotator
            .rotate_api_key()
            .await
            .map_err(|e| ConnectionError::Rotation(e.to_string()))?;

        if let Err(e) = rotation.store.save_api_key(&key).await {
            warn!(error = %e, "Failed to persist rotated api key");
        }
        self.settings.set_api_key(key.clone());

        info!(prefix = api_key_prefix(&key), "Api key rotated");
        Ok(Some(key))
    }

    /// Operator-requested rotation. The new key applies from the next call;
    /// reconnect to re-probe with it.
    pub async fn rotate_api_key(&self) -> Result<String, ConnectionError> {
        let rotation = self.rotation.as_ref().ok_or_else(|| {
            ConnectionError::Rotation("keys can only be minted for a colocated service".into())
        })?;
        self.rotate_credentials(rotation)
            .await?
            .ok_or_else(|| ConnectionError::Rotation("another rotation is in progress".into()))
    }

    /// Issue one unary call on the live channel with the current key.
    pub async fn invoke(
        &self,
        method: &'static str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, ConnectionError> {
        let transport = self
            .state()
            .transport
            .clone()
            .ok_or(ConnectionError::NotConnected)?;
        let settings = self.settings.load();

        let started = Instant::now();
        let result = transport.unary(method, body, &settings.api_key).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                debug!(method, duration_ms, peer = transport.peer(), "rpc completed");
                Ok(response)
            }
            Err(status) => {
                warn!(
                    method,
                    duration_ms,
                    peer = transport.peer(),
                    code = ?status.code(),
                    detail = status.message(),
                    "rpc failed"
                );
                self.mark_faulted(status.to_string());

                if is_auth_failure(&status) {
                    if let Some(rotation) = &self.rotation {
                        if let Err(e) = self.rotate_credentials(rotation).await {
                            warn!(error = %e, "Api key rotation after rpc failure failed");
                        }
                    }
                }
                Err(ConnectionError::Rpc { method, status })
            }
        }
    }

    fn mark_faulted(&self, error: String) {
        let current = self.state();
        self.publish(ConnectionState {
            status: LinkStatus::Faulted,
            last_error: Some(error),
            ..current.as_ref().clone()
        });
    }

    fn publish(&self, next: ConnectionState) {
        let next = Arc::new(next);
        match self.state.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    pub fn state(&self) -> Arc<ConnectionState> {
        match self.state.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn link_status(&self) -> LinkStatus {
        self.state().status
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> Arc<ConnectionSettings> {
        self.settings.load()
    }

    /// Swap in new settings; they take effect on the next call or reconnect.
    pub fn update_settings(&self, settings: ConnectionSettings) {
        self.settings.replace(settings);
    }

    pub fn is_colocated(&self) -> bool {
        self.rotation.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, ProcessError};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tonic::Status;

    /// Accepts any key while `accept` is `None`.
    #[derive(Default)]
    struct FakeServer {
        accept: Mutex<Option<String>>,
        scripted: Mutex<VecDeque<Status>>,
        bearers: Mutex<Vec<String>>,
    }

    impl FakeServer {
        fn accepting(key: &str) -> Arc<Self> {
            let server = Self::default();
            *server.accept.lock().unwrap() = Some(key.to_string());
            Arc::new(server)
        }
    }

    struct FakeTransport {
        server: Arc<FakeServer>,
    }

    #[async_trait]
    impl AdminTransport for FakeTransport {
        async fn unary(
            &self,
            _method: &'static str,
            _body: Vec<u8>,
            bearer: &str,
        ) -> Result<Vec<u8>, Status> {
            self.server.bearers.lock().unwrap().push(bearer.to_string());
            if let Some(status) = self.server.scripted.lock().unwrap().pop_front() {
                return Err(status);
            }
            match self.server.accept.lock().unwrap().as_deref() {
                Some(key) if key != bearer => Err(Status::unauthenticated("invalid token")),
                _ => Ok(Vec::new()),
            }
        }

        fn peer(&self) -> &str {
            "fake"
        }
    }

    struct FakeConnector {
        server: Arc<FakeServer>,
        dials: AtomicUsize,
        delay: Duration,
        refuse: bool,
    }

    impl FakeConnector {
        fn new(server: Arc<FakeServer>) -> Self {
            Self {
                server,
                dials: AtomicUsize::new(0),
                delay: Duration::ZERO,
                refuse: false,
            }
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn dial(
            &self,
            settings: &ConnectionSettings,
            _trust: &TrustPool,
        ) -> Result<Arc<dyn AdminTransport>, ConnectionError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.refuse {
                return Err(ConnectionError::Dial {
                    target: settings.address.clone(),
                    reason: "connection refused".into(),
                });
            }
            Ok(Arc::new(FakeTransport {
                server: Arc::clone(&self.server),
            }))
        }
    }

    struct FakeRotator {
        key: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl KeyRotator for FakeRotator {
        async fn rotate_api_key(&self) -> Result<String, ProcessError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.key.clone())
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        key: Mutex<Option<String>>,
    }

    #[async_trait]
    impl CredentialStore for MemoryStore {
        async fn load_api_key(&self) -> Result<Option<String>, ConfigError> {
            Ok(self.key.lock().unwrap().clone())
        }

        async fn save_api_key(&self, key: &str) -> Result<(), ConfigError> {
            *self.key.lock().unwrap() = Some(key.to_string());
            Ok(())
        }
    }

    fn settings(key: &str) -> ConnectionSettings {
        ConnectionSettings {
            address: "127.0.0.1:50443".into(),
            api_key: key.into(),
            insecure: true,
            tls: None,
        }
    }

    fn fast() -> ConnectionOptions {
        ConnectionOptions {
            max_attempts: 3,
            retry_delay: Duration::ZERO,
            startup_grace: Duration::ZERO,
        }
    }

    fn rotation(key: &str) -> (Arc<FakeRotator>, Arc<MemoryStore>, Rotation) {
        let rotator = Arc::new(FakeRotator {
            key: key.into(),
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(MemoryStore::default());
        let rotation = Rotation {
            rotator: rotator.clone(),
            store: store.clone(),
        };
        (rotator, store, rotation)
    }

    #[tokio::test]
    async fn auth_failure_on_first_attempt_rotates_once() {
        let server = FakeServer::accepting("fresh.key");
        let connector = Arc::new(FakeConnector::new(server.clone()));
        let (rotator, store, rotation) = rotation("fresh.key");
        let manager = ConnectionManager::new(settings("stale.key"), connector.clone(), Some(rotation))
            .with_options(fast());

        manager.connect().await.unwrap();

        assert_eq!(rotator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(connector.dials.load(Ordering::SeqCst), 2);
        assert_eq!(manager.link_status(), LinkStatus::Connected);
        assert_eq!(manager.settings().api_key, "fresh.key");
        assert_eq!(store.key.lock().unwrap().as_deref(), Some("fresh.key"));
        assert_eq!(manager.state().retries, 0);
    }

    #[tokio::test]
    async fn rotation_happens_at_most_once_per_sequence() {
        // The rotated key is still rejected: the loop falls back to plain retries.
        let server = FakeServer::accepting("never.matches");
        let connector = Arc::new(FakeConnector::new(server));
        let (rotator, _store, rotation) = rotation("fresh.key");
        let manager = ConnectionManager::new(settings("stale.key"), connector.clone(), Some(rotation))
            .with_options(fast());

        let err = manager.connect().await.unwrap_err();

        assert!(matches!(err, ConnectionError::Authentication(_)));
        assert_eq!(rotator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(connector.dials.load(Ordering::SeqCst), 3);
        assert_eq!(manager.link_status(), LinkStatus::Disconnected);
    }

    #[tokio::test]
    async fn auth_failure_after_first_attempt_does_not_rotate() {
        let server = FakeServer::accepting("fresh.key");
        server
            .scripted
            .lock()
            .unwrap()
            .push_back(Status::unavailable("warming up"));
        let connector = Arc::new(FakeConnector::new(server));
        let (rotator, _store, rotation) = rotation("fresh.key");
        let manager = ConnectionManager::new(settings("stale.key"), connector.clone(), Some(rotation))
            .with_options(fast());

        let err = manager.connect().await.unwrap_err();

        assert!(matches!(err, ConnectionError::Authentication(_)));
        assert_eq!(rotator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(connector.dials.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn remote_deployment_never_rotates() {
        let server = FakeServer::accepting("fresh.key");
        let connector = Arc::new(FakeConnector::new(server));
        let manager = ConnectionManager::new(settings("stale.key"), connector.clone(), None)
            .with_options(fast());

        assert!(manager.connect().await.is_err());
        assert!(!manager.is_colocated());
        assert_eq!(connector.dials.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dial_failures_are_bounded() {
        let mut connector = FakeConnector::new(Arc::new(FakeServer::default()));
        connector.refuse = true;
        let connector = Arc::new(connector);
        let manager = ConnectionManager::new(settings("k.k"), connector.clone(), None)
            .with_options(fast());

        let err = manager.reconnect().await.unwrap_err();

        assert!(matches!(err, ConnectionError::Dial { .. }));
        assert_eq!(connector.dials.load(Ordering::SeqCst), 3);
        let state = manager.state();
        assert_eq!(state.status, LinkStatus::Disconnected);
        assert!(state.last_error.as_deref().unwrap_or_default().contains("refused"));
    }

    #[tokio::test]
    async fn overlapping_connect_fails_fast_without_dialing() {
        let mut connector = FakeConnector::new(Arc::new(FakeServer::default()));
        connector.delay = Duration::from_millis(200);
        let connector = Arc::new(connector);
        let manager = Arc::new(
            ConnectionManager::new(settings("k.k"), connector.clone(), None).with_options(fast()),
        );

        let first = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.is_connecting());

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::AlreadyConnecting));
        assert!(err.is_retryable());

        first.await.unwrap().unwrap();
        assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
        assert!(!manager.is_connecting());
    }

    #[tokio::test]
    async fn each_call_reads_the_current_key() {
        let server = Arc::new(FakeServer::default());
        let connector = Arc::new(FakeConnector::new(server.clone()));
        let manager = ConnectionManager::new(settings("first.key"), connector, None)
            .with_options(fast());
        manager.connect().await.unwrap();

        manager.invoke("ListUsers", Vec::new()).await.unwrap();
        manager.update_settings(settings("second.key"));
        manager.invoke("ListUsers", Vec::new()).await.unwrap();

        let bearers = server.bearers.lock().unwrap().clone();
        assert_eq!(bearers, vec!["first.key", "first.key", "second.key"]);
    }

    #[tokio::test]
    async fn invoke_without_channel_is_not_connected() {
        let connector = Arc::new(FakeConnector::new(Arc::new(FakeServer::default())));
        let manager = ConnectionManager::new(settings("k.k"), connector, None);
        let err = manager.invoke("ListUsers", Vec::new()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::NotConnected));
    }

    #[tokio::test]
    async fn auth_error_on_call_heals_credentials() {
        let server = FakeServer::accepting("first.key");
        let connector = Arc::new(FakeConnector::new(server.clone()));
        let (rotator, store, rotation) = rotation("second.key");
        let manager = ConnectionManager::new(settings("first.key"), connector, Some(rotation))
            .with_options(fast());
        manager.connect().await.unwrap();

        *server.accept.lock().unwrap() = Some("second.key".into());
        let err = manager.invoke("ListNodes", Vec::new()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Rpc { method: "ListNodes", .. }));
        assert_eq!(manager.link_status(), LinkStatus::Faulted);
        assert_eq!(rotator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.key.lock().unwrap().as_deref(), Some("second.key"));

        manager.invoke("ListNodes", Vec::new()).await.unwrap();
    }

    #[tokio::test]
    async fn manual_rotation_needs_a_rotator() {
        let connector = Arc::new(FakeConnector::new(Arc::new(FakeServer::default())));
        let remote = ConnectionManager::new(settings("k.k"), connector.clone(), None);
        let err = remote.rotate_api_key().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Rotation(_)));

        let (rotator, store, rotation) = rotation("minted.key");
        let colocated = ConnectionManager::new(settings("k.k"), connector, Some(rotation));
        assert_eq!(colocated.rotate_api_key().await.unwrap(), "minted.key");
        assert_eq!(colocated.settings().api_key, "minted.key");
        assert_eq!(store.key.lock().unwrap().as_deref(), Some("minted.key"));
        assert_eq!(rotator.calls.load(Ordering::SeqCst), 1);
    }
}
