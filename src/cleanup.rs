use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use log::{debug, error, info, warn, Level};
use logging_timer::timer;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use sysinfo::Disks;

use crate::alerts::Alerts;
use crate::config::CleanupConfig;
use crate::database::Database;
use crate::error::ThreatPulseError;
use crate::file_state::{FileState, ScanState};

/// Which retention period applies to a file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RetentionClass {
    /// At least one alert, or quarantined by an operator
    Matched,
    /// Terminal state without alerts
    Clean,
    /// No state row yet, or still pending
    Unprocessed,
    /// Being scanned right now; never deleted
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub mount_point: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupResult {
    pub files_scanned: usize,
    pub files_deleted: usize,
    pub space_freed_bytes: u64,
    pub errors: Vec<String>,
    pub disk_usage: Option<DiskUsage>,
    pub states_purged: usize,
}

pub struct CleanupScheduler {
    db: Database,
    watch_dir: PathBuf,
    config: CleanupConfig,
}

impl CleanupScheduler {
    pub fn new(db: Database, watch_dir: &Path, config: CleanupConfig) -> Self {
        CleanupScheduler {
            db,
            watch_dir: watch_dir.to_path_buf(),
            config,
        }
    }

    pub fn classify(conn: &Connection, path: &Path) -> Result<RetentionClass, ThreatPulseError> {
        let state = FileState::get_file_state_conn(conn, path)?;
        let class = match state.map(|s| s.state) {
            Some(ScanState::Scanning) => RetentionClass::InProgress,
            Some(ScanState::Quarantined) => RetentionClass::Matched,
            _ if Alerts::count_alerts_for_path(conn, path)? > 0 => RetentionClass::Matched,
            Some(s) if s.is_terminal() => RetentionClass::Clean,
            _ => RetentionClass::Unprocessed,
        };
        Ok(class)
    }

    fn retention_for(&self, class: RetentionClass) -> Option<Duration> {
        let hours = match class {
            RetentionClass::Matched => self.config.matched_retention_hours,
            RetentionClass::Clean | RetentionClass::Unprocessed => self.config.clean_retention_hours,
            RetentionClass::InProgress => return None,
        };
        Some(Duration::from_secs(hours.saturating_mul(3600)))
    }

    /// One retention sweep over the watched directory. Per-file failures are
    /// collected in `errors` and never abort the sweep.
    pub fn run_cleanup(&self) -> CleanupResult {
        let _tmr = timer!(Level::Trace; "CleanupScheduler::run_cleanup", "{}", self.watch_dir.display());
        let mut result = CleanupResult::default();

        if let Err(e) = self.sweep(&mut result) {
            error!("Cleanup sweep of '{}' failed: {}", self.watch_dir.display(), e);
            result.errors.push(e.to_string());
        }

        if self.config.state_retention_hours > 0 {
            match FileState::cleanup_completed_states(&self.db, self.config.state_retention_hours) {
                Ok(purged) => result.states_purged = purged,
                Err(e) => {
                    error!("Purging old state rows failed: {}", e);
                    result.errors.push(e.to_string());
                }
            }
        }

        result.disk_usage = Self::disk_usage(&self.watch_dir);
        if let Some(usage) = &result.disk_usage {
            if usage.used_percent >= self.config.disk_critical_percent {
                error!(
                    "Disk usage critical on {}: {:.1}% used",
                    usage.mount_point, usage.used_percent
                );
            } else if usage.used_percent >= self.config.disk_warning_percent {
                warn!(
                    "Disk usage high on {}: {:.1}% used",
                    usage.mount_point, usage.used_percent
                );
            }
        }

        info!(
            "Cleanup: {} file(s) checked, {} deleted, {} bytes freed, {} error(s)",
            result.files_scanned,
            result.files_deleted,
            result.space_freed_bytes,
            result.errors.len()
        );
        result
    }

    fn sweep(&self, result: &mut CleanupResult) -> Result<(), ThreatPulseError> {
        let conn = self.db.get_connection()?;
        let now = SystemTime::now();

        for entry in fs::read_dir(&self.watch_dir)? {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    result.errors.push(e.to_string());
                    continue;
                }
            };
            if !path.is_file() {
                continue;
            }
            result.files_scanned += 1;

            if let Err(e) = self.consider(&conn, &path, now, result) {
                warn!("Cleanup skipped '{}': {}", path.display(), e);
                result.errors.push(e.to_string());
            }
        }
        Ok(())
    }

    fn consider(
        &self,
        conn: &Connection,
        path: &Path,
        now: SystemTime,
        result: &mut CleanupResult,
    ) -> Result<(), ThreatPulseError> {
        let io_err = |source: io::Error| ThreatPulseError::CleanupIOError {
            path: path.to_path_buf(),
            source,
        };

        let class = Self::classify(conn, path)?;
        let Some(retention) = self.retention_for(class) else {
            debug!("Cleanup: '{}' is being scanned, skipping", path.display());
            return Ok(());
        };

        let meta = fs::metadata(path).map_err(io_err)?;
        let modified = meta.modified().map_err(io_err)?;
        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age < retention {
            return Ok(());
        }

        // A worker may have claimed the file since classification
        if let Some(state) = FileState::get_file_state_conn(conn, path)? {
            if state.state == ScanState::Scanning {
                debug!("Cleanup: '{}' claimed mid-sweep, skipping", path.display());
                return Ok(());
            }
        }

        fs::remove_file(path).map_err(io_err)?;
        result.files_deleted += 1;
        result.space_freed_bytes += meta.len();
        debug!(
            "Deleted {} file '{}' (age {}h)",
            class,
            path.display(),
            age.as_secs() / 3600
        );
        Ok(())
    }

    /// Usage of the volume holding `path`: the disk with the longest mount point
    /// that prefixes it.
    pub fn disk_usage(path: &Path) -> Option<DiskUsage> {
        let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().components().count())?;

        let total = disk.total_space();
        if total == 0 {
            return None;
        }
        let available = disk.available_space();
        Some(DiskUsage {
            mount_point: disk.mount_point().to_string_lossy().into_owned(),
            total_bytes: total,
            available_bytes: available,
            used_percent: total.saturating_sub(available) as f64 / total as f64 * 100.0,
        })
    }

    /// Sweeps every `interval_minutes` until `stop` is set.
    pub fn spawn(self: Arc<Self>, stop: Arc<AtomicBool>) -> Result<JoinHandle<()>, ThreatPulseError> {
        let interval = Duration::from_secs(self.config.interval_minutes.max(1).saturating_mul(60));
        let handle = thread::Builder::new()
            .name("cleanup".into())
            .spawn(move || {
                info!("Cleanup scheduler started (every {:?})", interval);
                while crate::pipeline::sleep_unless_stopped(&stop, interval) {
                    self.run_cleanup();
                }
                info!("Cleanup scheduler stopped");
            })?;
        Ok(handle)
    }
}
