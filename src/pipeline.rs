use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::cleanup::{CleanupResult, CleanupScheduler};
use crate::config::{Config, ScannerConfig};
use crate::correlation::{ConnectionResolver, CorrelationEngine, CorrelationRunResult};
use crate::database::Database;
use crate::detection::DetectionEngine;
use crate::error::ThreatPulseError;
use crate::file_state::{FileMetadata, FileState, ScanState};
use crate::health::{HealthMonitor, HealthRegistry, PerformanceSnapshot, PipelineStats};
use crate::policy::ScanPolicy;
use crate::queue::{Enqueued, ScanQueue};
use crate::recovery;
use crate::scanner::{ScanContext, Scanner};
use crate::watcher::DirectoryWatcher;

const STOP_POLL: Duration = Duration::from_millis(100);

/// Sleeps for `duration` in short slices, returning early with `false` once
/// `stop` is set. Returns `true` when the full duration elapsed.
pub fn sleep_unless_stopped(stop: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(STOP_POLL));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admitted {
    Queued,
    AlreadyQueued,
    /// Known path in a state other than pending
    NotPending,
    /// Directory, vanished file or anything else that is not a regular file
    NotAFile,
}

/// Joins each thread, waiting at most `timeout` for each one. Threads still
/// running after their wait are logged and left detached. Returns their names.
fn join_bounded(handles: impl IntoIterator<Item = JoinHandle<()>>, timeout: Duration) -> Vec<String> {
    let mut abandoned = Vec::new();
    for handle in handles {
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        let name = handle.thread().name().unwrap_or("unnamed").to_string();
        if handle.is_finished() {
            if handle.join().is_err() {
                error!("Thread '{}' panicked", name);
            }
        } else {
            warn!("Thread '{}' did not stop within {:?}; abandoning it", name, timeout);
            abandoned.push(name);
        }
    }
    abandoned
}

/// Registers files in the store and hands pending ones to the queue. Shared by
/// the watcher, startup admission and the pending resweep.
pub struct Admission {
    db: Database,
    queue: Arc<ScanQueue>,
    stats: Arc<PipelineStats>,
    enqueue_timeout: Duration,
    priority_timeout: Duration,
}

impl Admission {
    pub fn new(
        db: Database,
        queue: Arc<ScanQueue>,
        stats: Arc<PipelineStats>,
        config: &ScannerConfig,
    ) -> Self {
        Admission {
            db,
            queue,
            stats,
            enqueue_timeout: config.enqueue_timeout(false),
            priority_timeout: config.enqueue_timeout(true),
        }
    }

    /// Registers `path` and enqueues it if it is pending. A full queue returns
    /// `QueueFull`; the row stays pending for the resweep.
    pub fn admit(&self, path: &Path, priority: bool) -> Result<Admitted, ThreatPulseError> {
        if !path.is_file() {
            return Ok(Admitted::NotAFile);
        }

        FileState::add_file_state(&self.db, path, Some(&FileMetadata::from_path(path)))?;
        match FileState::get_file_state(&self.db, path)? {
            Some(state) if state.state == ScanState::Pending => {}
            _ => return Ok(Admitted::NotPending),
        }

        let timeout = if priority {
            self.priority_timeout
        } else {
            self.enqueue_timeout
        };
        match self.queue.enqueue(path, timeout) {
            Ok(Enqueued::Added) => Ok(Admitted::Queued),
            Ok(Enqueued::AlreadyQueued) => Ok(Admitted::AlreadyQueued),
            Err(e) => {
                if matches!(e, ThreatPulseError::QueueFull(_)) {
                    self.stats.enqueue_failures.fetch_add(1, Ordering::Relaxed);
                }
                Err(e)
            }
        }
    }

    /// Admits the regular files already present in `dir`. Returns how many were queued.
    pub fn admit_directory(&self, dir: &Path) -> Result<usize, ThreatPulseError> {
        let mut queued = 0;
        let mut dropped = 0;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            match self.admit(&path, false) {
                Ok(Admitted::Queued) => queued += 1,
                Ok(_) => {}
                Err(ThreatPulseError::QueueFull(_)) => dropped += 1,
                Err(e) => warn!("Startup admission of '{}' failed: {}", path.display(), e),
            }
        }
        if dropped > 0 {
            warn!("{} existing file(s) left pending: queue full", dropped);
        }
        Ok(queued)
    }

    /// Registers files in `dir` that no event announced, then re-enqueues
    /// pending rows. Returns how many were queued.
    pub fn resweep(&self, dir: &Path) -> Result<usize, ThreatPulseError> {
        let unseen = self.admit_directory(dir)?;
        if unseen > 0 {
            info!("Resweep found {} unregistered file(s)", unseen);
        }
        Ok(unseen + self.resweep_pending()?)
    }

    /// Re-enqueues pending rows with priority. Rows whose file has disappeared
    /// are failed so they stop being retried. Returns how many were queued.
    pub fn resweep_pending(&self) -> Result<usize, ThreatPulseError> {
        let pending = FileState::get_files_by_state(&self.db, ScanState::Pending, Some(self.queue.capacity()))?;
        let mut queued = 0;

        for state in pending {
            let path = PathBuf::from(&state.path);
            if !path.exists() {
                if FileState::claim_for_scan(&self.db, &path)? {
                    let msg = ThreatPulseError::FileNotFound(path.clone()).to_string();
                    FileState::update_file_state(&self.db, &path, ScanState::Failed, Some(&msg), None)?;
                    debug!("Pending file vanished: {}", path.display());
                }
                continue;
            }
            match self.admit(&path, true) {
                Ok(Admitted::Queued) => queued += 1,
                Ok(_) => {}
                Err(ThreatPulseError::QueueFull(_)) => break,
                Err(e) => warn!("Resweep of '{}' failed: {}", path.display(), e),
            }
        }

        if queued > 0 {
            info!("Resweep queued {} pending file(s)", queued);
        }
        Ok(queued)
    }
}

/// Owns every component of the running service. Constructed explicitly and
/// driven through `start` / `stop`.
pub struct Pipeline {
    config: Config,
    db: Database,
    engine: Arc<dyn DetectionEngine>,
    watch_dir: PathBuf,
    queue: Arc<ScanQueue>,
    stats: Arc<PipelineStats>,
    registry: Arc<HealthRegistry>,
    admission: Arc<Admission>,
    cleanup: Arc<CleanupScheduler>,
    correlation: Arc<CorrelationEngine>,
    stop: Arc<AtomicBool>,
    watcher: Option<DirectoryWatcher>,
    threads: Vec<JoinHandle<()>>,
    running: bool,
}

impl Pipeline {
    pub fn new(
        config: Config,
        db: Database,
        engine: Arc<dyn DetectionEngine>,
        resolver: Arc<dyn ConnectionResolver>,
    ) -> Self {
        let watch_dir = PathBuf::from(&config.scanner.watch_dir);
        let queue = Arc::new(ScanQueue::new(config.scanner.queue_size));
        let stats = Arc::new(PipelineStats::new(&config.health));
        let admission = Arc::new(Admission::new(
            db.clone(),
            Arc::clone(&queue),
            Arc::clone(&stats),
            &config.scanner,
        ));
        let cleanup = Arc::new(CleanupScheduler::new(
            db.clone(),
            &watch_dir,
            config.cleanup.clone(),
        ));
        let correlation = Arc::new(CorrelationEngine::new(
            db.clone(),
            config.correlation.clone(),
            resolver,
        ));

        Pipeline {
            config,
            db,
            engine,
            watch_dir,
            queue,
            stats,
            registry: Arc::new(HealthRegistry::default()),
            admission,
            cleanup,
            correlation,
            stop: Arc::new(AtomicBool::new(false)),
            watcher: None,
            threads: Vec::new(),
            running: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Recovers interrupted scans, starts workers and background threads, then
    /// admits existing files and pending rows before watching for new ones.
    /// A failed start stops whatever was already started.
    pub fn start(&mut self) -> Result<(), ThreatPulseError> {
        if self.running {
            return Err(ThreatPulseError::Error("pipeline already running".into()));
        }
        if let Err(e) = self.start_inner() {
            error!("Pipeline start failed: {}", e);
            self.stop();
            return Err(e);
        }
        self.running = true;
        Ok(())
    }

    fn start_inner(&mut self) -> Result<(), ThreatPulseError> {
        fs::create_dir_all(&self.watch_dir)?;
        self.stop = Arc::new(AtomicBool::new(false));

        let recovered = recovery::recover_interrupted_scans(&self.db, &self.config.recovery)?;

        let ctx = Arc::new(ScanContext {
            db: self.db.clone(),
            engine: Arc::clone(&self.engine),
            policy: ScanPolicy::from_config(&self.config.scanner),
            stats: Arc::clone(&self.stats),
            scan_timeout: self.config.scanner.scan_timeout(),
        });
        let worker_count = self.config.scanner.worker_threads();
        for worker_id in 0..worker_count {
            let health = self.registry.register(worker_id);
            self.threads.push(Scanner::spawn_worker(
                worker_id,
                Arc::clone(&ctx),
                Arc::clone(&self.queue),
                health,
                Arc::clone(&self.stop),
                self.config.scanner.dequeue_timeout(),
            )?);
        }

        self.threads.push(HealthMonitor::spawn(
            Arc::clone(&self.registry),
            Arc::clone(&self.stats),
            Arc::clone(&self.queue),
            self.config.health.clone(),
            Arc::clone(&self.stop),
        )?);

        // Watch before listing so a file created in between is seen by one or the other
        self.watcher = Some(DirectoryWatcher::start(
            &self.watch_dir,
            self.config.scanner.settle_delay(),
            Arc::clone(&self.admission),
        )?);

        let existing = self.admission.admit_directory(&self.watch_dir)?;
        let resumed = self.admission.resweep_pending()?;

        if self.config.cleanup.enabled {
            self.threads
                .push(Arc::clone(&self.cleanup).spawn(Arc::clone(&self.stop))?);
        }
        if self.config.correlation.enabled {
            self.threads
                .push(Arc::clone(&self.correlation).spawn(Arc::clone(&self.stop))?);
        }
        if self.config.scanner.resweep_interval_secs > 0 {
            self.threads.push(self.spawn_resweep()?);
        }

        info!(
            "Pipeline started: {} worker(s), {} recovered, {} existing and {} pending file(s) queued, {} rule(s)",
            worker_count,
            recovered,
            existing,
            resumed,
            self.engine.rule_count()
        );
        Ok(())
    }

    fn spawn_resweep(&self) -> Result<JoinHandle<()>, ThreatPulseError> {
        let admission = Arc::clone(&self.admission);
        let watch_dir = self.watch_dir.clone();
        let stop = Arc::clone(&self.stop);
        let interval = Duration::from_secs(self.config.scanner.resweep_interval_secs);
        let handle = thread::Builder::new()
            .name("pending-resweep".into())
            .spawn(move || {
                while sleep_unless_stopped(&stop, interval) {
                    if let Err(e) = admission.resweep(&watch_dir) {
                        error!("Pending resweep failed: {}", e);
                    }
                }
            })?;
        Ok(handle)
    }

    /// Signals every thread to stop and waits up to the shutdown timeout for
    /// them. Files still queued stay pending for the next start.
    pub fn stop(&mut self) {
        if !self.running && self.threads.is_empty() && self.watcher.is_none() {
            return;
        }
        info!("Stopping pipeline");
        self.stop.store(true, Ordering::Release);
        self.watcher = None;

        let timeout = Duration::from_secs(self.config.health.shutdown_timeout_secs);
        join_bounded(self.threads.drain(..), timeout);

        let snapshot = self.performance_snapshot();
        info!(
            "Pipeline stopped: {} processed, {} matched, {} failed, {} excluded, {} enqueue failure(s), {} left queued",
            snapshot.files_processed,
            snapshot.files_matched,
            snapshot.files_failed,
            snapshot.files_excluded,
            snapshot.enqueue_failures,
            snapshot.queue_depth
        );
        self.registry.clear();
        self.running = false;
    }

    pub fn admit(&self, path: &Path, priority: bool) -> Result<Admitted, ThreatPulseError> {
        self.admission.admit(path, priority)
    }

    pub fn performance_snapshot(&self) -> PerformanceSnapshot {
        self.registry
            .snapshot(&self.stats, &self.queue, &self.config.health)
    }

    pub fn run_cleanup_now(&self) -> CleanupResult {
        self.cleanup.run_cleanup()
    }

    pub fn run_correlation_now(&self) -> CorrelationRunResult {
        self.correlation.run_correlation()
    }

    /// Reloads detection rules in place. Scans already running finish with the
    /// rules they started with.
    pub fn reload_rules(&self) -> Result<usize, ThreatPulseError> {
        let count = self.engine.reload()?;
        info!("Reloaded {} detection rule(s)", count);
        Ok(count)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertFilter, Alerts};
    use crate::correlation::SidecarResolver;
    use crate::database::test_support::temp_db;
    use crate::detection::SignatureEngine;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const RULES: &str = r#"
        [[rule]]
        name = "EICAR_Test_File"
        namespace = "test"
        metadata = { severity = "low" }
        strings = [{ id = "$eicar", text = "EICAR-STANDARD-ANTIVIRUS-TEST-FILE" }]
    "#;

    fn test_config(watch: &TempDir) -> Config {
        let mut config = Config::default();
        config.scanner.watch_dir = watch.path().to_string_lossy().into_owned();
        config.scanner.threads = 2;
        config.scanner.settle_delay_ms = 100;
        config.scanner.dequeue_timeout_ms = 50;
        config.health.sample_interval_secs = 1;
        config.health.shutdown_timeout_secs = 5;
        config.cleanup.enabled = false;
        config.cleanup.matched_retention_hours = 0;
        config.correlation.enabled = false;
        config
    }

    fn pipeline(config: Config, db: &Database) -> Pipeline {
        Pipeline::new(
            config,
            db.clone(),
            Arc::new(SignatureEngine::from_toml_str(RULES).unwrap()),
            Arc::new(SidecarResolver),
        )
    }

    fn wait_for_state(db: &Database, path: &Path, state: ScanState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(15);
        while Instant::now() < deadline {
            if let Some(row) = FileState::get_file_state(db, path).unwrap() {
                if row.state == state {
                    return true;
                }
            }
            thread::sleep(Duration::from_millis(25));
        }
        false
    }

    #[test]
    fn test_sleep_unless_stopped() {
        let stop = AtomicBool::new(false);
        assert!(sleep_unless_stopped(&stop, Duration::from_millis(10)));

        stop.store(true, Ordering::Release);
        let started = Instant::now();
        assert!(!sleep_unless_stopped(&stop, Duration::from_secs(60)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_detection_end_to_end() {
        let (_db_dir, db) = temp_db();
        let watch = TempDir::new().unwrap();
        let mut pipeline = pipeline(test_config(&watch), &db);
        pipeline.start().unwrap();
        assert!(pipeline.is_running());

        let path = watch.path().join("eicar.com");
        fs::write(&path, b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*").unwrap();
        pipeline.admit(&path, false).ok();

        assert!(wait_for_state(&db, &path, ScanState::Completed));
        let alerts = Alerts::get_alerts(&db, &AlertFilter::default(), None, None).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_name, "EICAR_Test_File");
        assert_eq!(alerts[0].severity, 3);

        assert_eq!(pipeline.performance_snapshot().workers.len(), 2);

        pipeline.stop();
        assert!(!pipeline.is_running());
        assert_eq!(pipeline.performance_snapshot().files_matched, 1);

        let result = pipeline.run_cleanup_now();
        assert_eq!(result.files_deleted, 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_start_resumes_previous_run() {
        let (_db_dir, db) = temp_db();
        let watch = TempDir::new().unwrap();

        let existing = watch.path().join("existing.bin");
        fs::write(&existing, b"clean").unwrap();

        let interrupted = watch.path().join("interrupted.bin");
        fs::write(&interrupted, b"clean too").unwrap();
        FileState::add_file_state(&db, &interrupted, None).unwrap();
        assert!(FileState::claim_for_scan(&db, &interrupted).unwrap());
        db.get_connection()
            .unwrap()
            .execute("UPDATE file_states SET started_at = started_at - 7200", [])
            .unwrap();

        let vanished = watch.path().join("vanished.bin");
        FileState::add_file_state(&db, &vanished, None).unwrap();

        let mut pipeline = pipeline(test_config(&watch), &db);
        pipeline.start().unwrap();

        assert!(wait_for_state(&db, &existing, ScanState::Completed));
        assert!(wait_for_state(&db, &interrupted, ScanState::Completed));
        assert!(wait_for_state(&db, &vanished, ScanState::Failed));
        pipeline.stop();

        let row = FileState::get_file_state(&db, &interrupted).unwrap().unwrap();
        assert_eq!(row.retry_count, 1);
    }

    #[test]
    fn test_join_bounded_waits_per_thread() {
        let spawn = |name: &str, ms: u64| {
            thread::Builder::new()
                .name(name.into())
                .spawn(move || thread::sleep(Duration::from_millis(ms)))
                .unwrap()
        };
        // The second thread outlives the first wait but not its own
        let handles = vec![spawn("stuck", 3_000), spawn("slow", 800)];
        let abandoned = join_bounded(handles, Duration::from_millis(500));
        assert_eq!(abandoned, vec!["stuck".to_string()]);
    }

    #[test]
    fn test_resweep_registers_unannounced_files() {
        let (_db_dir, db) = temp_db();
        let watch = TempDir::new().unwrap();
        let queue = Arc::new(ScanQueue::new(16));
        let admission = Admission::new(
            db.clone(),
            Arc::clone(&queue),
            Arc::new(PipelineStats::new(&Config::default().health)),
            &ScannerConfig::default(),
        );

        // Created with no watcher running, so no event ever announces it
        let missed = watch.path().join("missed.bin");
        fs::write(&missed, b"x").unwrap();
        assert!(FileState::get_file_state(&db, &missed).unwrap().is_none());

        assert_eq!(admission.resweep(watch.path()).unwrap(), 1);
        assert!(queue.is_queued(&missed));
        let row = FileState::get_file_state(&db, &missed).unwrap().unwrap();
        assert_eq!(row.state, ScanState::Pending);

        // Nothing new the second time
        assert_eq!(admission.resweep(watch.path()).unwrap(), 0);
    }

    #[test]
    fn test_file_created_right_after_start_is_scanned() {
        let (_db_dir, db) = temp_db();
        let watch = TempDir::new().unwrap();
        let mut config = test_config(&watch);
        config.scanner.resweep_interval_secs = 0;
        let mut pipeline = pipeline(config, &db);
        pipeline.start().unwrap();

        let path = watch.path().join("late.bin");
        fs::write(&path, b"clean").unwrap();
        assert!(wait_for_state(&db, &path, ScanState::Completed));
        pipeline.stop();
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let (_db_dir, db) = temp_db();
        let watch = TempDir::new().unwrap();
        let mut pipeline = pipeline(test_config(&watch), &db);
        pipeline.start().unwrap();
        assert!(pipeline.start().is_err());
        assert!(pipeline.is_running());
        pipeline.stop();
    }

    #[test]
    fn test_admit_skips_directories_and_finished_files() {
        let (_db_dir, db) = temp_db();
        let watch = TempDir::new().unwrap();
        let pipeline = pipeline(test_config(&watch), &db);

        assert_eq!(pipeline.admit(watch.path(), false).unwrap(), Admitted::NotAFile);

        let path = watch.path().join("a.bin");
        fs::write(&path, b"x").unwrap();
        assert_eq!(pipeline.admit(&path, false).unwrap(), Admitted::Queued);
        assert_eq!(pipeline.admit(&path, true).unwrap(), Admitted::AlreadyQueued);

        FileState::quarantine_file(&db, &path).unwrap();
        assert_eq!(pipeline.admit(&path, false).unwrap(), Admitted::NotPending);
    }
}
