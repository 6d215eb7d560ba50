// Per-file lifecycle driven by a worker:
//   1. Claim       pending -> scanning, atomically in the store. Losing the claim
//                  means another worker (or an operator) owns the file: skip it.
//   2. Policy      too large -> failed without reading; excluded -> completed with
//                  the exclusion reason and no alerts.
//   3. Hash        md5 + sha256 in one pass.
//   4. Detect      engine scan with a per-file deadline.
//   5. Persist     hashes, alerts and the terminal state in one transaction.
//
// Per-file problems end as a failed row with an error message. Store errors
// leave the row in scanning; crash recovery returns it to pending on the
// next start.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::alerts::{Alerts, NewAlert};
use crate::database::Database;
use crate::detection::DetectionEngine;
use crate::error::ThreatPulseError;
use crate::file_state::{FileState, ScanState};
use crate::hash::{FileDigests, Hash};
use crate::health::{PipelineStats, WorkerHealth};
use crate::policy::{PolicyDecision, ScanPolicy};
use crate::queue::ScanQueue;

/// What happened to one dequeued file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// The file was not pending, so this worker did not own it
    Skipped,
    Completed { alerts: usize },
    Excluded(String),
    Failed(String),
}

/// Everything a worker needs to process files. Shared by all workers.
pub struct ScanContext {
    pub db: Database,
    pub engine: Arc<dyn DetectionEngine>,
    pub policy: ScanPolicy,
    pub stats: Arc<PipelineStats>,
    pub scan_timeout: Duration,
}

pub struct Scanner;

impl Scanner {
    pub fn spawn_worker(
        worker_id: usize,
        ctx: Arc<ScanContext>,
        queue: Arc<ScanQueue>,
        health: Arc<WorkerHealth>,
        stop: Arc<AtomicBool>,
        dequeue_timeout: Duration,
    ) -> Result<JoinHandle<()>, ThreatPulseError> {
        let handle = thread::Builder::new()
            .name(format!("scan-worker-{}", worker_id))
            .spawn(move || {
                debug!("Worker {} started", worker_id);
                Self::worker_loop(worker_id, &ctx, &queue, &health, &stop, dequeue_timeout);
                debug!("Worker {} stopped", worker_id);
            })?;
        Ok(handle)
    }

    fn worker_loop(
        worker_id: usize,
        ctx: &ScanContext,
        queue: &ScanQueue,
        health: &WorkerHealth,
        stop: &AtomicBool,
        dequeue_timeout: Duration,
    ) {
        while !stop.load(Ordering::Acquire) {
            health.heartbeat();

            let Some(path) = queue.dequeue(dequeue_timeout) else {
                continue;
            };

            health.start_file(&path);
            let started = Instant::now();

            match Self::process_file(ctx, &path) {
                Ok(FileOutcome::Skipped) => health.release_file(),
                Ok(outcome) => {
                    health.finish_file();
                    ctx.stats.files_processed.fetch_add(1, Ordering::Relaxed);
                    ctx.stats.record_duration(started.elapsed());
                    match outcome {
                        FileOutcome::Completed { alerts } if alerts > 0 => {
                            ctx.stats.files_matched.fetch_add(1, Ordering::Relaxed);
                        }
                        FileOutcome::Excluded(_) => {
                            ctx.stats.files_excluded.fetch_add(1, Ordering::Relaxed);
                        }
                        FileOutcome::Failed(_) => {
                            ctx.stats.files_failed.fetch_add(1, Ordering::Relaxed);
                        }
                        _ => {}
                    }
                }
                Err(e) => {
                    error!(
                        "Worker {}: error processing '{}': {}",
                        worker_id,
                        path.display(),
                        e
                    );
                    health.release_file();
                }
            }
        }

        health.mark_stopped();
    }

    /// Claims, scans and persists one file.
    pub fn process_file(ctx: &ScanContext, path: &Path) -> Result<FileOutcome, ThreatPulseError> {
        if !FileState::claim_for_scan(&ctx.db, path)? {
            debug!("Not pending, skipping: {}", path.display());
            return Ok(FileOutcome::Skipped);
        }

        let started = Instant::now();
        let elapsed_ms = |started: Instant| u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let size = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                let err = match e.kind() {
                    ErrorKind::NotFound => ThreatPulseError::FileNotFound(path.to_path_buf()),
                    _ => ThreatPulseError::IoError(e),
                };
                return Self::finish_failed(ctx, path, None, &err, elapsed_ms(started));
            }
        };

        match ctx.policy.evaluate(path, size) {
            PolicyDecision::Scan => {}
            PolicyDecision::TooLarge { size, limit } => {
                let err = ThreatPulseError::FileTooLarge {
                    path: path.to_path_buf(),
                    size,
                    limit,
                };
                return Self::finish_failed(ctx, path, None, &err, elapsed_ms(started));
            }
            PolicyDecision::Excluded(detail) => {
                let reason = ThreatPulseError::ExcludedByPolicy(detail).to_string();
                info!("{}: {}", path.display(), reason);
                Self::persist(
                    &ctx.db,
                    path,
                    ScanState::Completed,
                    Some(&reason),
                    elapsed_ms(started),
                    None,
                    &[],
                )?;
                return Ok(FileOutcome::Excluded(reason));
            }
        }

        let digests = match Hash::compute_digests(path) {
            Ok(digests) => digests,
            Err(e) => return Self::finish_failed(ctx, path, None, &e, elapsed_ms(started)),
        };

        match ctx.engine.scan(path, ctx.scan_timeout) {
            Ok(outcome) => {
                let alerts: Vec<NewAlert> = outcome
                    .matches
                    .iter()
                    .map(|m| NewAlert::from_match(path, &digests, m))
                    .collect();

                Self::persist(
                    &ctx.db,
                    path,
                    ScanState::Completed,
                    None,
                    elapsed_ms(started),
                    Some(&digests),
                    &alerts,
                )?;

                if alerts.is_empty() {
                    debug!("Clean: {}", path.display());
                } else {
                    let rules: Vec<&str> = alerts.iter().map(|a| a.rule_name.as_str()).collect();
                    warn!(
                        "Detection in '{}' (sha256 {}): {}",
                        path.display(),
                        Hash::short_hash(Some(&digests.sha256)),
                        rules.join(", ")
                    );
                }
                Ok(FileOutcome::Completed {
                    alerts: alerts.len(),
                })
            }
            Err(e) => Self::finish_failed(ctx, path, Some(&digests), &e, elapsed_ms(started)),
        }
    }

    fn finish_failed(
        ctx: &ScanContext,
        path: &Path,
        digests: Option<&FileDigests>,
        err: &ThreatPulseError,
        duration_ms: u64,
    ) -> Result<FileOutcome, ThreatPulseError> {
        let msg = err.to_string();
        warn!("Scan failed for '{}': {}", path.display(), msg);
        Self::persist(
            &ctx.db,
            path,
            ScanState::Failed,
            Some(&msg),
            duration_ms,
            digests,
            &[],
        )?;
        Ok(FileOutcome::Failed(msg))
    }

    /// Writes digests, alerts and the terminal state as a single transaction.
    fn persist(
        db: &Database,
        path: &Path,
        state: ScanState,
        message: Option<&str>,
        duration_ms: u64,
        digests: Option<&FileDigests>,
        alerts: &[NewAlert],
    ) -> Result<(), ThreatPulseError> {
        let conn = db.get_connection()?;
        Database::immediate_transaction(&conn, |c| {
            if let Some(d) = digests {
                FileState::set_file_hashes_locked(c, path, d.size, &d.md5, &d.sha256)?;
            }
            for alert in alerts {
                Alerts::insert_alert_locked(c, alert)?;
            }
            let updated =
                FileState::update_file_state_locked(c, path, state, message, Some(duration_ms))?;
            if !updated {
                // Row vanished or was quarantined mid-scan: keep alerts out of the store too
                return Err(ThreatPulseError::StoreError(format!(
                    "could not move '{}' to {}",
                    path.display(),
                    state
                )));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertFilter;
    use crate::config::{HealthConfig, ScannerConfig};
    use crate::database::test_support::temp_db;
    use crate::detection::SignatureEngine;
    use crate::file_state::FileMetadata;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const RULES: &str = r#"
        [[rule]]
        name = "Test_Signature"
        namespace = "unit"
        metadata = { severity = "high" }
        strings = [{ id = "$sig", text = "THREATPULSE-TEST-SIGNATURE" }]
    "#;

    fn context(db: &Database, scanner: ScannerConfig) -> ScanContext {
        ScanContext {
            db: db.clone(),
            engine: Arc::new(SignatureEngine::from_toml_str(RULES).unwrap()),
            policy: ScanPolicy::from_config(&scanner),
            stats: Arc::new(PipelineStats::new(&HealthConfig::default())),
            scan_timeout: Duration::from_secs(10),
        }
    }

    fn register(db: &Database, dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        FileState::add_file_state(db, &path, Some(&FileMetadata::from_path(&path))).unwrap();
        path
    }

    #[test]
    fn test_match_creates_alert_and_completes() {
        let (_db_dir, db) = temp_db();
        let files = TempDir::new().unwrap();
        let ctx = context(&db, ScannerConfig::default());
        let path = register(&db, &files, "evil.exe", b"xx THREATPULSE-TEST-SIGNATURE xx");

        let outcome = Scanner::process_file(&ctx, &path).unwrap();
        assert_eq!(outcome, FileOutcome::Completed { alerts: 1 });

        let state = FileState::get_file_state(&db, &path).unwrap().unwrap();
        assert_eq!(state.state, ScanState::Completed);
        assert!(state.sha256.is_some());
        assert!(state.scan_duration_ms.is_some());

        let alerts = Alerts::get_alerts(&db, &AlertFilter::default(), None, None).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_name, "Test_Signature");
        assert_eq!(alerts[0].severity, 7);
        assert_eq!(alerts[0].sha256, state.sha256);
    }

    #[test]
    fn test_clean_file_completes_without_alert() {
        let (_db_dir, db) = temp_db();
        let files = TempDir::new().unwrap();
        let ctx = context(&db, ScannerConfig::default());
        let path = register(&db, &files, "clean.txt", b"nothing to see");

        assert_eq!(
            Scanner::process_file(&ctx, &path).unwrap(),
            FileOutcome::Completed { alerts: 0 }
        );
        assert!(Alerts::get_alerts(&db, &AlertFilter::default(), None, None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_policy_exclusion_completes_with_reason() {
        let (_db_dir, db) = temp_db();
        let files = TempDir::new().unwrap();
        let ctx = context(
            &db,
            ScannerConfig {
                allowed_extensions: vec!["exe".into()],
                ..Default::default()
            },
        );
        let path = register(&db, &files, "readme.txt", b"THREATPULSE-TEST-SIGNATURE");

        let outcome = Scanner::process_file(&ctx, &path).unwrap();
        assert!(matches!(outcome, FileOutcome::Excluded(_)));

        let state = FileState::get_file_state(&db, &path).unwrap().unwrap();
        assert_eq!(state.state, ScanState::Completed);
        assert!(state
            .error_message
            .unwrap()
            .starts_with("excluded by policy"));
        assert!(Alerts::get_alerts(&db, &AlertFilter::default(), None, None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_too_large_fails_fast() {
        let (_db_dir, db) = temp_db();
        let files = TempDir::new().unwrap();
        let ctx = context(
            &db,
            ScannerConfig {
                max_file_size_mb: 1,
                ..Default::default()
            },
        );
        let path = register(&db, &files, "huge.bin", &vec![0u8; 1024 * 1024 + 1]);

        let outcome = Scanner::process_file(&ctx, &path).unwrap();
        assert!(matches!(outcome, FileOutcome::Failed(ref msg) if msg.starts_with("File too large")));

        let state = FileState::get_file_state(&db, &path).unwrap().unwrap();
        assert_eq!(state.state, ScanState::Failed);
        assert_eq!(state.sha256, None);
    }

    #[test]
    fn test_vanished_file_fails() {
        let (_db_dir, db) = temp_db();
        let files = TempDir::new().unwrap();
        let ctx = context(&db, ScannerConfig::default());
        let path = register(&db, &files, "gone.bin", b"x");
        fs::remove_file(&path).unwrap();

        let outcome = Scanner::process_file(&ctx, &path).unwrap();
        assert!(matches!(outcome, FileOutcome::Failed(ref msg) if msg.starts_with("File not found")));
    }

    #[test]
    fn test_already_claimed_file_is_skipped() {
        let (_db_dir, db) = temp_db();
        let files = TempDir::new().unwrap();
        let ctx = context(&db, ScannerConfig::default());
        let path = register(&db, &files, "a.bin", b"x");
        assert!(FileState::claim_for_scan(&db, &path).unwrap());

        assert_eq!(Scanner::process_file(&ctx, &path).unwrap(), FileOutcome::Skipped);
    }

    #[test]
    fn test_worker_drains_queue_and_stops() {
        let (_db_dir, db) = temp_db();
        let files = TempDir::new().unwrap();
        let ctx = Arc::new(context(&db, ScannerConfig::default()));
        let queue = Arc::new(ScanQueue::new(8));
        let stop = Arc::new(AtomicBool::new(false));
        let health = Arc::new(WorkerHealth::new(0));

        let paths: Vec<PathBuf> = (0..3)
            .map(|i| register(&db, &files, &format!("f{i}.bin"), b"THREATPULSE-TEST-SIGNATURE"))
            .collect();
        for p in &paths {
            queue.enqueue(p, Duration::from_millis(50)).unwrap();
        }

        let handle = Scanner::spawn_worker(
            0,
            Arc::clone(&ctx),
            Arc::clone(&queue),
            Arc::clone(&health),
            Arc::clone(&stop),
            Duration::from_millis(20),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while ctx.stats.files_processed.load(Ordering::Relaxed) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        stop.store(true, Ordering::Release);
        handle.join().unwrap();

        assert_eq!(ctx.stats.files_processed.load(Ordering::Relaxed), 3);
        assert_eq!(ctx.stats.files_matched.load(Ordering::Relaxed), 3);
        assert_eq!(health.files_processed(), 3);
        assert_eq!(health.status(), crate::health::WorkerStatus::Stopped);
    }

    #[test]
    fn test_lost_claim_not_counted_for_worker() {
        let (_db_dir, db) = temp_db();
        let files = TempDir::new().unwrap();
        let ctx = Arc::new(context(&db, ScannerConfig::default()));
        let queue = Arc::new(ScanQueue::new(8));
        let stop = Arc::new(AtomicBool::new(false));
        let health = Arc::new(WorkerHealth::new(0));

        let owned = register(&db, &files, "owned.bin", b"x");
        assert!(FileState::claim_for_scan(&db, &owned).unwrap());
        let free = register(&db, &files, "free.bin", b"y");
        queue.enqueue(&owned, Duration::from_millis(50)).unwrap();
        queue.enqueue(&free, Duration::from_millis(50)).unwrap();

        let handle = Scanner::spawn_worker(
            0,
            Arc::clone(&ctx),
            Arc::clone(&queue),
            Arc::clone(&health),
            Arc::clone(&stop),
            Duration::from_millis(20),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while ctx.stats.files_processed.load(Ordering::Relaxed) < 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        stop.store(true, Ordering::Release);
        handle.join().unwrap();

        assert!(queue.is_empty());
        assert_eq!(ctx.stats.files_processed.load(Ordering::Relaxed), 1);
        assert_eq!(health.files_processed(), 1);
    }
}
