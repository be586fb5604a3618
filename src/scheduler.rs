//! Recurring background work: status snapshots, liveness enforcement and
//! upgrade checks.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerSection;
use crate::error::Result;
use crate::release::ReleaseManager;
use crate::rpc::{ConnectionManager, LinkStatus};
use crate::status::{HostSampler, ServiceStatus, ServiceView, StatusCache, StatusSnapshot};
use crate::supervisor::{ProcessSupervisor, UNKNOWN_VERSION};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const LOG_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub status: Duration,
    pub liveness: Duration,
    pub upgrade: Duration,
    pub staleness_window: Duration,
    pub liveness_threshold: u32,
}

impl From<&SchedulerSection> for Timings {
    fn from(section: &SchedulerSection) -> Self {
        Self {
            status: Duration::from_secs(section.status_interval_secs.max(1)),
            liveness: Duration::from_secs(section.liveness_interval_secs.max(1)),
            upgrade: Duration::from_secs(section.upgrade_interval_secs.max(1)),
            staleness_window: Duration::from_secs(section.staleness_window_secs),
            liveness_threshold: section.liveness_failure_threshold.max(1),
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self::from(&SchedulerSection::default())
    }
}

/// Process control the liveness task needs.
#[async_trait]
pub trait Supervised: Send + Sync {
    async fn is_running(&self) -> bool;
    async fn stop(&self) -> Result<()>;
    async fn start(&self) -> Result<()>;

    /// A failed stop aborts the restart.
    async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }
}

#[async_trait]
impl Supervised for ProcessSupervisor {
    async fn is_running(&self) -> bool {
        ProcessSupervisor::is_running(self).await
    }

    async fn stop(&self) -> Result<()> {
        ProcessSupervisor::stop(self).await
    }

    async fn start(&self) -> Result<()> {
        ProcessSupervisor::start(self).await
    }

    async fn restart(&self) -> Result<()> {
        ProcessSupervisor::restart(self).await
    }
}

/// Consecutive failed liveness probes.
#[derive(Debug)]
pub struct LivenessWatch {
    threshold: u32,
    failures: u32,
}

impl LivenessWatch {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record one probe. Returns true when the threshold was just reached;
    /// the counter starts over at that point.
    pub fn observe(&mut self, alive: bool) -> bool {
        if alive {
            self.failures = 0;
            return false;
        }
        self.failures += 1;
        if self.failures >= self.threshold {
            self.failures = 0;
            return true;
        }
        false
    }
}

/// Probe once; restart the service when the threshold is reached.
/// Returns whether a restart was issued.
pub async fn check_liveness(watch: &mut LivenessWatch, target: &dyn Supervised) -> bool {
    let alive = target.is_running().await;
    if !watch.observe(alive) {
        if !alive {
            warn!(failures = watch.failures(), "Service liveness probe failed");
        }
        return false;
    }

    warn!("Service not running after repeated probes, restarting");
    match target.restart().await {
        Ok(()) => info!("Service restarted"),
        Err(e) => error!(error = %e, "Service restart failed"),
    }
    true
}

/// Everything the background tasks read from or act on.
#[derive(Clone)]
pub struct Targets {
    pub status: Arc<StatusCache>,
    pub supervisor: Option<Arc<ProcessSupervisor>>,
    pub releases: Arc<ReleaseManager>,
    pub connection: Arc<ConnectionManager>,
}

impl Targets {
    pub async fn service_view(&self) -> ServiceView {
        let latest_version = self.releases.latest_known().map(|r| r.tag_name.clone());

        match &self.supervisor {
            Some(supervisor) => {
                let last_error = supervisor.last_error();
                let status = if supervisor.is_running().await {
                    ServiceStatus::Running
                } else if last_error.is_some() {
                    ServiceStatus::Errored
                } else {
                    ServiceStatus::Stopped
                };
                ServiceView {
                    status,
                    last_error,
                    version: supervisor.version(),
                    latest_version,
                    log_tail: supervisor.logs().tail(LOG_TAIL_LINES),
                }
            }
            None => {
                let state = self.connection.state();
                let status = match state.status {
                    LinkStatus::Connected => ServiceStatus::Connected,
                    _ => ServiceStatus::Disconnected,
                };
                ServiceView {
                    status,
                    last_error: state.last_error.clone(),
                    version: UNKNOWN_VERSION.to_string(),
                    latest_version,
                    log_tail: Vec::new(),
                }
            }
        }
    }

    /// Sample the host and publish a new snapshot.
    pub async fn refresh_status(&self, sampler: &mut HostSampler) -> StatusSnapshot {
        let host = sampler.sample();
        let view = self.service_view().await;
        let previous = self.status.peek();
        let snapshot = StatusSnapshot::build(previous.as_deref(), host, view, Utc::now());
        self.status.publish(snapshot.clone());
        snapshot
    }
}

pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl Scheduler {
    /// Spawn the recurring tasks. Liveness and upgrade checks only run when
    /// the service is supervised here; the liveness task continues counting
    /// from `liveness`.
    pub fn start(targets: Targets, timings: Timings, liveness: LivenessWatch) -> Self {
        let (shutdown, _) = watch::channel(false);
        let mut tasks = JoinSet::new();

        tasks.spawn(status_loop(
            targets.clone(),
            timings.status,
            timings.staleness_window,
            shutdown.subscribe(),
        ));

        if let Some(supervisor) = targets.supervisor.clone() {
            tasks.spawn(liveness_loop(
                supervisor,
                timings.liveness,
                liveness,
                shutdown.subscribe(),
            ));
            tasks.spawn(upgrade_loop(
                Arc::clone(&targets.releases),
                timings.upgrade,
                shutdown.subscribe(),
            ));
        }

        info!(
            status = ?timings.status,
            liveness = ?timings.liveness,
            upgrade = ?timings.upgrade,
            "Scheduler started"
        );
        Self { shutdown, tasks }
    }

    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        let drained = tokio::time::timeout(STOP_TIMEOUT, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Scheduler tasks did not stop in time, aborting");
            self.tasks.abort_all();
        }
        debug!("Scheduler stopped");
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn status_loop(
    targets: Targets,
    period: Duration,
    staleness_window: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sampler = HostSampler::new();
    let mut interval = ticker(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if targets.status.is_stale(staleness_window) {
                    debug!("No recent status readers, skipping snapshot");
                    continue;
                }
                targets.refresh_status(&mut sampler).await;
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn liveness_loop(
    target: Arc<dyn Supervised>,
    period: Duration,
    mut watch: LivenessWatch,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = ticker(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                check_liveness(&mut watch, target.as_ref()).await;
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn upgrade_loop(
    releases: Arc<ReleaseManager>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = ticker(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = releases.check_for_update().await {
                    warn!(error = %e, "Upgrade check failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConnectionError, ProcessError, ReleaseError};
    use crate::release::{Release, ReleaseSource};
    use crate::rpc::{AdminTransport, ConnectionSettings, Connector, TrustPool};
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeService {
        alive: AtomicBool,
        stop_fails: AtomicBool,
        checks: AtomicUsize,
        stops: AtomicUsize,
        starts: AtomicUsize,
    }

    impl FakeService {
        fn dead() -> Self {
            Self {
                alive: AtomicBool::new(false),
                stop_fails: AtomicBool::new(false),
                checks: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                starts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Supervised for FakeService {
        async fn is_running(&self) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.alive.load(Ordering::SeqCst)
        }

        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.stop_fails.load(Ordering::SeqCst) {
                return Err(ProcessError::StopTimeout(Duration::from_secs(5)).into());
            }
            Ok(())
        }

        async fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn three_failed_checks_restart_once() {
        let service = FakeService::dead();
        let mut watch = LivenessWatch::new(3);

        assert!(!check_liveness(&mut watch, &service).await);
        assert!(!check_liveness(&mut watch, &service).await);
        assert_eq!(service.starts.load(Ordering::SeqCst), 0);
        assert!(check_liveness(&mut watch, &service).await);

        assert_eq!(service.stops.load(Ordering::SeqCst), 1);
        assert_eq!(service.starts.load(Ordering::SeqCst), 1);
        assert_eq!(watch.failures(), 0);
    }

    #[tokio::test]
    async fn failed_stop_skips_start() {
        let service = FakeService::dead();
        service.stop_fails.store(true, Ordering::SeqCst);

        assert!(service.restart().await.is_err());
        assert_eq!(service.stops.load(Ordering::SeqCst), 1);
        assert_eq!(service.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn liveness_task_continues_startup_count() {
        let service = Arc::new(FakeService::dead());
        let mut carried = LivenessWatch::new(3);
        carried.observe(false);
        carried.observe(false);

        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(liveness_loop(
            service.clone(),
            Duration::from_millis(50),
            carried,
            rx,
        ));

        for _ in 0..100 {
            if service.starts.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let checks = service.checks.load(Ordering::SeqCst);
        let _ = shutdown.send(true);
        task.await.unwrap();

        assert_eq!(service.starts.load(Ordering::SeqCst), 1);
        assert_eq!(checks, 1);
    }

    #[test]
    fn successful_check_resets_counter() {
        let mut watch = LivenessWatch::new(3);
        assert!(!watch.observe(false));
        assert!(!watch.observe(false));
        assert!(!watch.observe(true));
        assert_eq!(watch.failures(), 0);
        assert!(!watch.observe(false));
        assert_eq!(watch.failures(), 1);
    }

    #[test]
    fn timings_follow_config() {
        let timings = Timings::default();
        assert_eq!(timings.status, Duration::from_secs(2));
        assert_eq!(timings.liveness, Duration::from_secs(30));
        assert_eq!(timings.upgrade, Duration::from_secs(86_400));
        assert_eq!(timings.staleness_window, Duration::from_secs(180));
        assert_eq!(timings.liveness_threshold, 3);
    }

    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn dial(
            &self,
            settings: &ConnectionSettings,
            _trust: &TrustPool,
        ) -> std::result::Result<Arc<dyn AdminTransport>, ConnectionError> {
            Err(ConnectionError::Dial {
                target: settings.address.clone(),
                reason: "unreachable".into(),
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

    fn remote_targets() -> Targets {
        let settings = ConnectionSettings {
            address: "10.0.0.1:50443".into(),
            api_key: "k.k".into(),
            insecure: true,
            tls: None,
        };
        Targets {
            status: Arc::new(StatusCache::new()),
            supervisor: None,
            releases: Arc::new(ReleaseManager::new(
                Arc::new(EmptyFeed),
                "/nonexistent/headscale",
                std::env::temp_dir(),
                "",
            )),
            connection: Arc::new(ConnectionManager::new(settings, Arc::new(Unreachable), None)),
        }
    }

    fn fast() -> Timings {
        Timings {
            status: Duration::from_millis(20),
            liveness: Duration::from_secs(60),
            upgrade: Duration::from_secs(60),
            staleness_window: Duration::from_secs(180),
            liveness_threshold: 3,
        }
    }

    #[tokio::test]
    async fn status_refreshes_while_read() {
        let targets = remote_targets();
        targets.status.touch();
        let scheduler = Scheduler::start(targets.clone(), fast(), LivenessWatch::new(3));

        let mut snapshot = None;
        for _ in 0..50 {
            snapshot = targets.status.peek();
            if snapshot.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        scheduler.stop().await;

        let snapshot = snapshot.expect("a snapshot was published");
        assert_eq!(snapshot.service, ServiceStatus::Disconnected);
        assert_eq!(snapshot.version, UNKNOWN_VERSION);
    }

    #[tokio::test]
    async fn status_skipped_without_readers() {
        let targets = remote_targets();
        let scheduler = Scheduler::start(targets.clone(), fast(), LivenessWatch::new(3));
        tokio::time::sleep(Duration::from_millis(120)).await;
        scheduler.stop().await;
        assert!(targets.status.peek().is_none());
    }
}
