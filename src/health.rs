use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use crate::config::HealthConfig;
use crate::error::ThreatPulseError;
use crate::queue::ScanQueue;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WorkerStatus {
    Idle = 0,
    Processing = 1,
    Stopped = 2,
}

impl WorkerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerStatus::Idle,
            1 => WorkerStatus::Processing,
            _ => WorkerStatus::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthClass {
    Healthy,
    Warning,
    Unhealthy,
}

/// Live health of one worker. Written only by the owning worker thread; the
/// monitor and snapshot readers only load.
#[derive(Debug)]
pub struct WorkerHealth {
    worker_id: usize,
    status: AtomicU8,
    last_heartbeat_ms: AtomicI64,
    files_processed: AtomicU64,
    current_file: Mutex<Option<PathBuf>>,
}

impl WorkerHealth {
    pub fn new(worker_id: usize) -> Self {
        WorkerHealth {
            worker_id,
            status: AtomicU8::new(WorkerStatus::Idle as u8),
            last_heartbeat_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            files_processed: AtomicU64::new(0),
            current_file: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn heartbeat(&self) {
        self.last_heartbeat_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    pub fn start_file(&self, path: &Path) {
        *self.current_file.lock().unwrap() = Some(path.to_path_buf());
        self.status
            .store(WorkerStatus::Processing as u8, Ordering::Release);
        self.heartbeat();
    }

    pub fn finish_file(&self) {
        *self.current_file.lock().unwrap() = None;
        self.files_processed.fetch_add(1, Ordering::Relaxed);
        self.status.store(WorkerStatus::Idle as u8, Ordering::Release);
        self.heartbeat();
    }

    /// Back to idle without counting a file, for a lost claim or a store error.
    pub fn release_file(&self) {
        *self.current_file.lock().unwrap() = None;
        self.status.store(WorkerStatus::Idle as u8, Ordering::Release);
        self.heartbeat();
    }

    pub fn files_processed(&self) -> u64 {
        self.files_processed.load(Ordering::Relaxed)
    }

    pub fn mark_stopped(&self) {
        *self.current_file.lock().unwrap() = None;
        self.status.store(WorkerStatus::Stopped as u8, Ordering::Release);
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn last_heartbeat_ms(&self) -> i64 {
        self.last_heartbeat_ms.load(Ordering::Acquire)
    }

    pub fn classify(&self, now_ms: i64, warning_after: Duration, unhealthy_after: Duration) -> HealthClass {
        let silent_ms = now_ms.saturating_sub(self.last_heartbeat_ms());
        let silent = Duration::from_millis(u64::try_from(silent_ms).unwrap_or(0));
        if silent >= unhealthy_after {
            HealthClass::Unhealthy
        } else if silent >= warning_after {
            HealthClass::Warning
        } else {
            HealthClass::Healthy
        }
    }

    fn snapshot(&self, now_ms: i64, config: &HealthConfig) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_id: self.worker_id,
            status: self.status(),
            health: self.classify(
                now_ms,
                Duration::from_secs(config.warning_after_secs),
                Duration::from_secs(config.unhealthy_after_secs),
            ),
            last_heartbeat_ms: self.last_heartbeat_ms(),
            current_file: self
                .current_file
                .lock()
                .unwrap()
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            files_processed: self.files_processed.load(Ordering::Relaxed),
        }
    }
}

/// Fixed-capacity window of recent samples.
#[derive(Debug, Clone)]
pub struct RollingWindow<T> {
    samples: VecDeque<T>,
    capacity: usize,
}

impl<T: Copy + Into<f64> + PartialOrd> RollingWindow<T> {
    pub fn new(capacity: usize) -> Self {
        RollingWindow {
            samples: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, sample: T) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: f64 = self.samples.iter().map(|s| (*s).into()).sum();
        Some(sum / self.samples.len() as f64)
    }

    pub fn median(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().map(|s| (*s).into()).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Some((sorted[mid - 1] + sorted[mid]) / 2.0)
        } else {
            Some(sorted[mid])
        }
    }
}

/// Aggregate counters and rolling samples shared by workers and the monitor.
pub struct PipelineStats {
    started: Instant,
    pub files_processed: AtomicU64,
    pub files_matched: AtomicU64,
    pub files_failed: AtomicU64,
    pub files_excluded: AtomicU64,
    pub enqueue_failures: AtomicU64,
    durations_ms: Mutex<RollingWindow<u32>>,
    queue_depths: Mutex<RollingWindow<u32>>,
}

impl PipelineStats {
    pub fn new(config: &HealthConfig) -> Self {
        PipelineStats {
            started: Instant::now(),
            files_processed: AtomicU64::new(0),
            files_matched: AtomicU64::new(0),
            files_failed: AtomicU64::new(0),
            files_excluded: AtomicU64::new(0),
            enqueue_failures: AtomicU64::new(0),
            durations_ms: Mutex::new(RollingWindow::new(config.duration_window)),
            queue_depths: Mutex::new(RollingWindow::new(config.queue_depth_window)),
        }
    }

    pub fn record_duration(&self, duration: Duration) {
        let ms = u32::try_from(duration.as_millis()).unwrap_or(u32::MAX);
        self.durations_ms.lock().unwrap().push(ms);
    }

    pub fn record_queue_depth(&self, depth: usize) {
        let depth = u32::try_from(depth).unwrap_or(u32::MAX);
        self.queue_depths.lock().unwrap().push(depth);
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Files processed per second since the pipeline started.
    pub fn throughput(&self) -> f64 {
        let secs = self.uptime().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.files_processed.load(Ordering::Relaxed) as f64 / secs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub worker_id: usize,
    pub status: WorkerStatus,
    pub health: HealthClass,
    pub last_heartbeat_ms: i64,
    pub current_file: Option<String>,
    pub files_processed: u64,
}

/// Point-in-time view of pipeline performance and worker health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub uptime_secs: u64,
    pub files_processed: u64,
    pub files_matched: u64,
    pub files_failed: u64,
    pub files_excluded: u64,
    pub enqueue_failures: u64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub average_queue_depth: Option<f64>,
    pub throughput_per_sec: f64,
    pub mean_scan_ms: Option<f64>,
    pub median_scan_ms: Option<f64>,
    pub workers: Vec<WorkerSnapshot>,
}

/// The set of live workers. Entries are added at start and cleared at shutdown.
#[derive(Default)]
pub struct HealthRegistry {
    workers: RwLock<Vec<Arc<WorkerHealth>>>,
}

impl HealthRegistry {
    pub fn register(&self, worker_id: usize) -> Arc<WorkerHealth> {
        let health = Arc::new(WorkerHealth::new(worker_id));
        self.workers.write().unwrap().push(Arc::clone(&health));
        health
    }

    pub fn workers(&self) -> Vec<Arc<WorkerHealth>> {
        self.workers.read().unwrap().clone()
    }

    pub fn clear(&self) {
        self.workers.write().unwrap().clear();
    }

    pub fn snapshot(
        &self,
        stats: &PipelineStats,
        queue: &ScanQueue,
        config: &HealthConfig,
    ) -> PerformanceSnapshot {
        let now_ms = Utc::now().timestamp_millis();
        let durations = stats.durations_ms.lock().unwrap().clone();
        let depths = stats.queue_depths.lock().unwrap().clone();

        PerformanceSnapshot {
            uptime_secs: stats.uptime().as_secs(),
            files_processed: stats.files_processed.load(Ordering::Relaxed),
            files_matched: stats.files_matched.load(Ordering::Relaxed),
            files_failed: stats.files_failed.load(Ordering::Relaxed),
            files_excluded: stats.files_excluded.load(Ordering::Relaxed),
            enqueue_failures: stats.enqueue_failures.load(Ordering::Relaxed),
            queue_depth: queue.len(),
            queue_capacity: queue.capacity(),
            average_queue_depth: depths.mean(),
            throughput_per_sec: stats.throughput(),
            mean_scan_ms: durations.mean(),
            median_scan_ms: durations.median(),
            workers: self
                .workers()
                .iter()
                .map(|w| w.snapshot(now_ms, config))
                .collect(),
        }
    }
}

pub struct HealthMonitor;

impl HealthMonitor {
    /// Samples queue depth and classifies workers until `stop` is set. Health
    /// class changes are logged once per transition.
    pub fn spawn(
        registry: Arc<HealthRegistry>,
        stats: Arc<PipelineStats>,
        queue: Arc<ScanQueue>,
        config: HealthConfig,
        stop: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>, ThreatPulseError> {
        let handle = thread::Builder::new()
            .name("health-monitor".into())
            .spawn(move || {
                let interval = Duration::from_secs(config.sample_interval_secs.max(1));
                let warning_after = Duration::from_secs(config.warning_after_secs);
                let unhealthy_after = Duration::from_secs(config.unhealthy_after_secs);
                let mut last_class: HashMap<usize, HealthClass> = HashMap::new();

                info!("Health monitor started");
                while crate::pipeline::sleep_unless_stopped(&stop, interval) {
                    stats.record_queue_depth(queue.len());

                    let now_ms = Utc::now().timestamp_millis();
                    for worker in registry.workers() {
                        if worker.status() == WorkerStatus::Stopped {
                            continue;
                        }
                        let class = worker.classify(now_ms, warning_after, unhealthy_after);
                        let previous = last_class.insert(worker.worker_id(), class);
                        if previous == Some(class) {
                            continue;
                        }
                        let silent_secs = (now_ms - worker.last_heartbeat_ms()) / 1000;
                        match class {
                            HealthClass::Unhealthy => error!(
                                "{}",
                                ThreatPulseError::WorkerUnhealthy {
                                    worker_id: worker.worker_id(),
                                    silent_secs,
                                }
                            ),
                            HealthClass::Warning => warn!(
                                "Worker {} slow: no heartbeat for {}s",
                                worker.worker_id(),
                                silent_secs
                            ),
                            HealthClass::Healthy if previous.is_some() => {
                                info!("Worker {} healthy again", worker.worker_id())
                            }
                            HealthClass::Healthy => {}
                        }
                    }
                }
                info!("Health monitor stopped");
            })?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rolling_window_evicts_oldest() {
        let mut window = RollingWindow::<u32>::new(3);
        assert_eq!(window.mean(), None);
        for v in [10, 20, 30, 40] {
            window.push(v);
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.mean(), Some(30.0));
        assert_eq!(window.median(), Some(30.0));
    }

    #[test]
    fn test_median_even_count() {
        let mut window = RollingWindow::<u32>::new(10);
        for v in [5, 1, 9, 3] {
            window.push(v);
        }
        assert_eq!(window.median(), Some(4.0));
    }

    #[test]
    fn test_classify_by_heartbeat_age() {
        let worker = WorkerHealth::new(0);
        let beat = worker.last_heartbeat_ms();
        let warn = Duration::from_secs(60);
        let bad = Duration::from_secs(300);

        assert_eq!(worker.classify(beat + 1_000, warn, bad), HealthClass::Healthy);
        assert_eq!(worker.classify(beat + 61_000, warn, bad), HealthClass::Warning);
        assert_eq!(worker.classify(beat + 301_000, warn, bad), HealthClass::Unhealthy);
    }

    #[test]
    fn test_worker_lifecycle_status() {
        let worker = WorkerHealth::new(3);
        assert_eq!(worker.status(), WorkerStatus::Idle);
        worker.start_file(Path::new("/cap/x"));
        assert_eq!(worker.status(), WorkerStatus::Processing);
        worker.finish_file();
        assert_eq!(worker.status(), WorkerStatus::Idle);
        assert_eq!(worker.files_processed(), 1);

        worker.start_file(Path::new("/cap/y"));
        worker.release_file();
        assert_eq!(worker.status(), WorkerStatus::Idle);
        assert_eq!(worker.files_processed(), 1);

        worker.mark_stopped();
        assert_eq!(worker.status(), WorkerStatus::Stopped);
    }

    #[test]
    fn test_snapshot_aggregates() {
        let config = HealthConfig::default();
        let registry = HealthRegistry::default();
        let stats = PipelineStats::new(&config);
        let queue = ScanQueue::new(8);

        let w = registry.register(0);
        w.start_file(Path::new("/cap/busy.bin"));
        stats.files_processed.fetch_add(2, Ordering::Relaxed);
        stats.record_duration(Duration::from_millis(100));
        stats.record_duration(Duration::from_millis(300));
        stats.record_queue_depth(4);

        let snap = registry.snapshot(&stats, &queue, &config);
        assert_eq!(snap.files_processed, 2);
        assert_eq!(snap.mean_scan_ms, Some(200.0));
        assert_eq!(snap.median_scan_ms, Some(200.0));
        assert_eq!(snap.average_queue_depth, Some(4.0));
        assert_eq!(snap.queue_capacity, 8);
        assert_eq!(snap.workers.len(), 1);
        assert_eq!(snap.workers[0].status, WorkerStatus::Processing);
        assert_eq!(snap.workers[0].current_file.as_deref(), Some("/cap/busy.bin"));

        registry.clear();
        assert!(registry.workers().is_empty());
    }
}
