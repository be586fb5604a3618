//! Aggregated host and service health, recomputed on a timer and served
//! from cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};
use sysinfo::{Disks, Networks, System};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Running,
    Stopped,
    Errored,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    pub cpu_percent: f32,
    pub memory_total: u64,
    pub memory_used: u64,
    pub swap_total: u64,
    pub swap_used: u64,
    pub disk_total: u64,
    pub disk_available: u64,
    pub load_one: f64,
    pub load_five: f64,
    pub load_fifteen: f64,
    pub uptime_secs: u64,
    pub net_received_total: u64,
    pub net_transmitted_total: u64,
    /// Bytes per second since the previous snapshot.
    pub net_received_rate: f64,
    pub net_transmitted_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub taken_at: DateTime<Utc>,
    pub host: HostMetrics,
    pub service: ServiceStatus,
    pub last_error: Option<String>,
    pub version: String,
    pub latest_version: Option<String>,
    /// Most recent service output lines, oldest first.
    #[serde(default)]
    pub log_tail: Vec<String>,
}

/// Service-side inputs of a snapshot.
#[derive(Debug, Clone)]
pub struct ServiceView {
    pub status: ServiceStatus,
    pub last_error: Option<String>,
    pub version: String,
    pub latest_version: Option<String>,
    pub log_tail: Vec<String>,
}

/// Bytes per second between two counter readings. Counter resets and
/// non-positive intervals yield zero.
pub fn rate(previous: u64, current: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 || current < previous {
        return 0.0;
    }
    (current - previous) as f64 / secs
}

impl StatusSnapshot {
    /// Combine a host sample with service state, deriving throughput from
    /// `previous` when there is one.
    pub fn build(
        previous: Option<&StatusSnapshot>,
        mut host: HostMetrics,
        service: ServiceView,
        taken_at: DateTime<Utc>,
    ) -> Self {
        if let Some(prev) = previous {
            let elapsed = (taken_at - prev.taken_at).to_std().unwrap_or_default();
            host.net_received_rate = rate(
                prev.host.net_received_total,
                host.net_received_total,
                elapsed,
            );
            host.net_transmitted_rate = rate(
                prev.host.net_transmitted_total,
                host.net_transmitted_total,
                elapsed,
            );
        }

        Self {
            taken_at,
            host,
            service: service.status,
            last_error: service.last_error,
            version: service.version,
            latest_version: service.latest_version,
            log_tail: service.log_tail,
        }
    }
}

/// Reads host counters. Keeps the `System` between samples so CPU usage
/// has a previous reading to diff against.
pub struct HostSampler {
    system: System,
}

impl HostSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self { system }
    }

    pub fn sample(&mut self) -> HostMetrics {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_available) = root_disk_usage(
            disks
                .list()
                .iter()
                .map(|d| (d.mount_point(), d.total_space(), d.available_space())),
        );

        let networks = Networks::new_with_refreshed_list();
        let (rx, tx) = networks.iter().fold((0, 0), |(rx, tx), (_, data)| {
            (rx + data.total_received(), tx + data.total_transmitted())
        });

        let load = System::load_average();

        HostMetrics {
            cpu_percent: self.system.global_cpu_usage(),
            memory_total: self.system.total_memory(),
            memory_used: self.system.used_memory(),
            swap_total: self.system.total_swap(),
            swap_used: self.system.used_swap(),
            disk_total,
            disk_available,
            load_one: load.one,
            load_five: load.five,
            load_fifteen: load.fifteen,
            uptime_secs: System::uptime(),
            net_received_total: rx,
            net_transmitted_total: tx,
            net_received_rate: 0.0,
            net_transmitted_rate: 0.0,
        }
    }
}

/// Total and available bytes of the filesystem mounted at `/`, or zeros
/// when there is none.
pub fn root_disk_usage<'a>(mounts: impl IntoIterator<Item = (&'a Path, u64, u64)>) -> (u64, u64) {
    mounts
        .into_iter()
        .find(|(mount, _, _)| *mount == Path::new("/"))
        .map(|(_, total, available)| (total, available))
        .unwrap_or((0, 0))
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot shared with `meshwarden status` running in another process.
/// Readers touch `<path>.read` so the writer knows someone is looking.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn marker(&self) -> PathBuf {
        self.path.with_extension("read")
    }

    pub fn write(&self, snapshot: &StatusSnapshot) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)
    }

    /// Record the read, then load the published snapshot. The read counts
    /// even when nothing is published yet, so a fresh writer starts
    /// producing.
    pub fn read(&self) -> Option<StatusSnapshot> {
        if let Err(e) = self.mark_read() {
            tracing::debug!(error = %e, "Failed to record status read");
        }
        let content = fs::read(&self.path).ok()?;
        serde_json::from_slice(&content).ok()
    }

    fn mark_read(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(self.marker(), b"")
    }

    /// When a reader last loaded the file.
    pub fn last_read(&self) -> Option<SystemTime> {
        fs::metadata(self.marker()).and_then(|m| m.modified()).ok()
    }
}

/// Latest snapshot plus the time it was last asked for.
#[derive(Default)]
pub struct StatusCache {
    current: RwLock<Option<Arc<StatusSnapshot>>>,
    last_read: Mutex<Option<Instant>>,
    file: Option<StatusFile>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also publish every snapshot to `file`, and count its readers.
    pub fn with_file(mut self, file: StatusFile) -> Self {
        self.file = Some(file);
        self
    }

    /// Serve the cached snapshot and record the read.
    pub fn get(&self) -> Option<Arc<StatusSnapshot>> {
        self.touch();
        self.peek()
    }

    /// The cached snapshot, without counting as a read.
    pub fn peek(&self) -> Option<Arc<StatusSnapshot>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn touch(&self) {
        let now = Some(Instant::now());
        match self.last_read.lock() {
            Ok(mut guard) => *guard = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    pub fn publish(&self, snapshot: StatusSnapshot) {
        if let Some(file) = &self.file {
            if let Err(e) = file.write(&snapshot) {
                tracing::warn!(path = %file.path().display(), error = %e, "Failed to write status file");
            }
        }
        let next = Some(Arc::new(snapshot));
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// True when nobody read the status within `window`.
    pub fn is_stale(&self, window: Duration) -> bool {
        let last = match self.last_read.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        if matches!(last, Some(at) if at.elapsed() <= window) {
            return false;
        }

        let file_read = self.file.as_ref().and_then(StatusFile::last_read);
        match file_read.map(|at| SystemTime::now().duration_since(at)) {
            Some(Ok(age)) => age > window,
            // mtime ahead of the wall clock
            Some(Err(_)) => false,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> ServiceView {
        ServiceView {
            status: ServiceStatus::Running,
            last_error: None,
            version: "v0.23.0".into(),
            latest_version: None,
            log_tail: Vec::new(),
        }
    }

    fn host(rx: u64, tx: u64) -> HostMetrics {
        HostMetrics {
            net_received_total: rx,
            net_transmitted_total: tx,
            ..Default::default()
        }
    }

    #[test]
    fn throughput_is_delta_over_elapsed() {
        let t0 = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let t1 = t0 + chrono::Duration::seconds(2);

        let first = StatusSnapshot::build(None, host(10_000, 500), view(), t0);
        assert_eq!(first.host.net_received_rate, 0.0);

        let second = StatusSnapshot::build(Some(&first), host(12_000, 900), view(), t1);
        assert_eq!(second.host.net_received_rate, 1000.0);
        assert_eq!(second.host.net_transmitted_rate, 200.0);
    }

    #[test]
    fn counter_reset_gives_zero_rate() {
        assert_eq!(rate(5_000, 100, Duration::from_secs(2)), 0.0);
        assert_eq!(rate(0, 100, Duration::ZERO), 0.0);
    }

    #[test]
    fn cache_tracks_reads() {
        let cache = StatusCache::new();
        assert!(cache.is_stale(Duration::from_secs(180)));
        assert!(cache.get().is_none());
        assert!(!cache.is_stale(Duration::from_secs(180)));

        let t0 = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        cache.publish(StatusSnapshot::build(None, host(1, 1), view(), t0));
        assert_eq!(cache.peek().map(|s| s.version.clone()), Some("v0.23.0".into()));
    }

    #[test]
    fn stale_after_window() {
        let cache = StatusCache::new();
        cache.touch();
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.is_stale(Duration::from_millis(5)));
        assert!(!cache.is_stale(Duration::from_secs(60)));
    }

    #[test]
    fn file_readers_keep_cache_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let file = StatusFile::new(dir.path().join("status.json"));
        let cache = StatusCache::new().with_file(file.clone());
        assert!(cache.is_stale(Duration::from_secs(180)));

        let t0 = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        cache.publish(StatusSnapshot::build(None, host(7, 8), view(), t0));
        assert!(cache.is_stale(Duration::from_secs(180)));

        let read = file.read().unwrap();
        assert_eq!(read.host.net_received_total, 7);
        assert!(!cache.is_stale(Duration::from_secs(180)));
    }

    #[test]
    fn reading_before_first_publish_counts() {
        let dir = tempfile::tempdir().unwrap();
        let file = StatusFile::new(dir.path().join("state").join("status.json"));
        let cache = StatusCache::new().with_file(file.clone());
        assert!(cache.is_stale(Duration::from_secs(180)));

        assert!(file.read().is_none());
        assert!(!cache.is_stale(Duration::from_secs(180)));
    }

    #[test]
    fn disk_usage_comes_from_root_mount() {
        let mounts = [
            (Path::new("/boot"), 500, 400),
            (Path::new("/"), 10_000, 2_500),
            (Path::new("/mnt/data"), 90_000, 80_000),
        ];
        assert_eq!(root_disk_usage(mounts), (10_000, 2_500));
        assert_eq!(root_disk_usage([(Path::new("/boot"), 500, 400)]), (0, 0));
    }

    #[test]
    fn log_tail_survives_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = StatusFile::new(dir.path().join("status.json"));
        let t0 = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let service = ServiceView {
            log_tail: vec!["listening on 127.0.0.1:50443".into()],
            ..view()
        };
        file.write(&StatusSnapshot::build(None, host(0, 0), service, t0)).unwrap();

        let read = file.read().unwrap();
        assert_eq!(read.log_tail, vec!["listening on 127.0.0.1:50443".to_string()]);
    }

    #[test]
    fn snapshot_serializes_lowercase_status() {
        let t0 = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let snap = StatusSnapshot::build(None, host(0, 0), view(), t0);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["service"], "running");
    }
}
