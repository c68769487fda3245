//! Disk-space admission gate.
//!
//! A process-wide flag that refuses new captures while free space on the
//! output volume is below the configured threshold. Denial is sticky: it
//! only clears when a later check observes enough free space.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sysinfo::Disks;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::notification::{NotificationDispatcher, NotificationMessage};
use crate::{Error, Result};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Reports free space for the volume holding a path.
#[async_trait]
pub trait DiskProbe: Send + Sync {
    async fn available_bytes(&self, path: &Path) -> Result<u64>;
}

/// [`DiskProbe`] backed by `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoDiskProbe;

#[async_trait]
impl DiskProbe for SysinfoDiskProbe {
    async fn available_bytes(&self, path: &Path) -> Result<u64> {
        let path = existing_ancestor(path);
        tokio::task::spawn_blocking(move || {
            let disks = Disks::new_with_refreshed_list();
            let mounts = disks
                .list()
                .iter()
                .map(|disk| (disk.mount_point().to_path_buf(), disk.available_space()));
            best_mount(&path, mounts)
                .ok_or_else(|| Error::Other(format!("No disk found for path {}", path.display())))
        })
        .await
        .map_err(|e| Error::Other(format!("Disk probe task failed: {e}")))?
    }
}

/// The output directory may not exist yet; measure its closest existing parent.
fn existing_ancestor(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    absolute
        .ancestors()
        .find(|p| p.exists())
        .map(|p| p.canonicalize().unwrap_or_else(|_| p.to_path_buf()))
        .unwrap_or(absolute)
}

/// Free space of the disk whose mount point is the longest prefix of `path`.
fn best_mount(path: &Path, mounts: impl IntoIterator<Item = (PathBuf, u64)>) -> Option<u64> {
    let mut best: Option<(usize, u64)> = None;
    for (mount, available) in mounts {
        if !path.starts_with(&mount) {
            continue;
        }
        let depth = mount.components().count();
        if best.is_none_or(|(len, _)| depth > len) {
            best = Some((depth, available));
        }
    }
    best.map(|(_, available)| available)
}

/// Persistent, user-facing warning surface.
pub trait WarningSink: Send + Sync {
    fn raise(&self, message: &str);
    fn clear(&self);
}

/// Default sink: the warning goes to the log.
#[derive(Debug, Default)]
pub struct LogWarningSink;

impl WarningSink for LogWarningSink {
    fn raise(&self, message: &str) {
        warn!(target: "srec_watch::ui", "{message}");
    }

    fn clear(&self) {
        info!(target: "srec_watch::ui", "Disk space warning cleared");
    }
}

pub struct AdmissionGate {
    allowed: AtomicBool,
    closed: AtomicBool,
    threshold_bytes: u64,
    throttle: Duration,
    last_warned: Mutex<Option<Instant>>,
    probe: Arc<dyn DiskProbe>,
    dispatcher: Arc<NotificationDispatcher>,
    warnings: Arc<dyn WarningSink>,
}

impl AdmissionGate {
    pub fn new(
        threshold_bytes: u64,
        throttle: Duration,
        probe: Arc<dyn DiskProbe>,
        dispatcher: Arc<NotificationDispatcher>,
        warnings: Arc<dyn WarningSink>,
    ) -> Self {
        Self {
            allowed: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            threshold_bytes,
            throttle,
            last_warned: Mutex::new(None),
            probe,
            dispatcher,
            warnings,
        }
    }

    /// Probe `path` and update the admission flag. Returns whether captures may start.
    ///
    /// A failed probe leaves the flag untouched. A closed gate is not probed.
    pub async fn check_free_space(&self, path: &Path) -> bool {
        if self.is_closed() {
            return false;
        }
        let available = match self.probe.available_bytes(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Disk space probe failed");
                return self.is_allowed();
            }
        };

        if available < self.threshold_bytes {
            if self.allowed.swap(false, Ordering::AcqRel) {
                warn!(
                    available,
                    threshold = self.threshold_bytes,
                    "Free disk space below threshold, new captures paused"
                );
            }
            self.warn_throttled(available);
            return false;
        }

        if !self.allowed.swap(true, Ordering::AcqRel) {
            info!(available, "Free disk space recovered, captures allowed again");
            self.warnings.clear();
        } else {
            debug!(available, "Disk space OK");
        }
        true
    }

    pub fn is_allowed(&self) -> bool {
        !self.is_closed() && self.allowed.load(Ordering::Acquire)
    }

    /// Refuse new captures until the next check above threshold.
    pub fn deny(&self) {
        self.allowed.store(false, Ordering::Release);
    }

    /// Refuse new captures for good. Free space no longer matters.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.allowed.store(false, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn threshold_bytes(&self) -> u64 {
        self.threshold_bytes
    }

    fn warn_throttled(&self, available: u64) {
        let now = Instant::now();
        {
            let mut last = self.last_warned.lock();
            if last.is_some_and(|at| now.duration_since(at) < self.throttle) {
                return;
            }
            *last = Some(now);
        }

        let free_gb = available as f64 / BYTES_PER_GB;
        let threshold_gb = self.threshold_bytes as f64 / BYTES_PER_GB;
        let message = NotificationMessage::disk_low(free_gb, threshold_gb);
        self.warnings.raise(&message.body);
        self.dispatcher.publish(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::DispatcherConfig;
    use std::sync::atomic::AtomicU64;

    const GB: u64 = 1024 * 1024 * 1024;

    struct FakeProbe {
        free: AtomicU64,
        fail: AtomicBool,
    }

    impl FakeProbe {
        fn new(free: u64) -> Arc<Self> {
            Arc::new(Self {
                free: AtomicU64::new(free),
                fail: AtomicBool::new(false),
            })
        }

        fn set(&self, free: u64) {
            self.free.store(free, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DiskProbe for FakeProbe {
        async fn available_bytes(&self, _path: &Path) -> Result<u64> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Other("probe unavailable".to_string()));
            }
            Ok(self.free.load(Ordering::SeqCst))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        raised: Mutex<Vec<String>>,
        cleared: AtomicU64,
    }

    impl WarningSink for RecordingSink {
        fn raise(&self, message: &str) {
            self.raised.lock().push(message.to_string());
        }

        fn clear(&self) {
            self.cleared.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn gate(probe: Arc<FakeProbe>) -> (AdmissionGate, Arc<NotificationDispatcher>, Arc<RecordingSink>) {
        let dispatcher = Arc::new(NotificationDispatcher::new(DispatcherConfig::default()));
        let sink = Arc::new(RecordingSink::default());
        let gate = AdmissionGate::new(GB, Duration::from_secs(60), probe, dispatcher.clone(), sink.clone());
        (gate, dispatcher, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_denial_is_sticky_until_recovery() {
        let probe = FakeProbe::new(GB / 2);
        let (gate, _, sink) = gate(probe.clone());
        let path = Path::new("downloads");

        assert!(!gate.check_free_space(path).await);
        assert!(!gate.is_allowed());
        assert!(!gate.check_free_space(path).await);

        probe.set(2 * GB);
        assert!(gate.check_free_space(path).await);
        assert!(gate.is_allowed());
        assert_eq!(sink.cleared.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_warning_is_throttled() {
        let probe = FakeProbe::new(GB / 2);
        let (gate, dispatcher, sink) = gate(probe);
        let path = Path::new("downloads");

        gate.check_free_space(path).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        gate.check_free_space(path).await;
        assert_eq!(dispatcher.stats().published, 1);
        assert_eq!(sink.raised.lock().len(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        gate.check_free_space(path).await;
        assert_eq!(dispatcher.stats().published, 2);
        assert_eq!(sink.raised.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_probe_failure_keeps_state() {
        let probe = FakeProbe::new(2 * GB);
        let (gate, _, _) = gate(probe.clone());
        let path = Path::new("downloads");

        probe.fail.store(true, Ordering::SeqCst);
        assert!(gate.check_free_space(path).await);

        gate.deny();
        assert!(!gate.check_free_space(path).await);

        probe.fail.store(false, Ordering::SeqCst);
        assert!(gate.check_free_space(path).await);
    }

    #[tokio::test]
    async fn test_closed_gate_ignores_recovered_space() {
        let probe = FakeProbe::new(2 * GB);
        let (gate, _, sink) = gate(probe);
        let path = Path::new("downloads");

        assert!(gate.check_free_space(path).await);
        gate.close();
        assert!(gate.is_closed());
        assert!(!gate.is_allowed());
        assert!(!gate.check_free_space(path).await);
        assert!(!gate.is_allowed());
        assert_eq!(sink.cleared.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_best_mount_prefers_longest_prefix() {
        let mounts = vec![
            (PathBuf::from("/"), 10),
            (PathBuf::from("/data"), 20),
            (PathBuf::from("/data/media"), 30),
            (PathBuf::from("/dat"), 40),
        ];
        assert_eq!(best_mount(Path::new("/data/media/rec"), mounts.clone()), Some(30));
        assert_eq!(best_mount(Path::new("/database"), mounts.clone()), Some(10));
        assert_eq!(best_mount(Path::new("/data/other"), mounts), Some(20));
        assert_eq!(best_mount(Path::new("relative"), Vec::new()), None);
    }
}
