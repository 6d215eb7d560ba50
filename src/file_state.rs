use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use log::{debug, info, warn, Level};
use logging_timer::timer;
use rusqlite::{named_params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

use crate::database::Database;
use crate::error::ThreatPulseError;

/// Lifecycle state of a file. Stored as lower-case text in `file_states.state`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ScanState {
    Pending,
    Scanning,
    Completed,
    Failed,
    Quarantined,
}

impl ScanState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanState::Completed | ScanState::Failed | ScanState::Quarantined
        )
    }

    /// Transitions allowed through [`FileState::update_file_state`].
    ///
    /// `Scanning -> Pending` is absent: only
    /// [`FileState::recover_interrupted_scans`] may move a file backwards.
    pub fn can_transition_to(&self, next: ScanState) -> bool {
        match (self, next) {
            (ScanState::Quarantined, ScanState::Quarantined) => false,
            (_, ScanState::Quarantined) => true,
            (ScanState::Pending, ScanState::Scanning) => true,
            (ScanState::Scanning, ScanState::Completed) => true,
            (ScanState::Scanning, ScanState::Failed) => true,
            _ => false,
        }
    }

    fn from_column(value: &str) -> ScanState {
        value.parse().unwrap_or_else(|_| {
            warn!(
                "Invalid ScanState value in database: '{}', defaulting to Pending",
                value
            );
            ScanState::Pending
        })
    }
}

/// Optional facts about a file known at registration time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileMetadata {
    pub size: Option<u64>,
    pub md5: Option<String>,
    pub sha256: Option<String>,
}

impl FileMetadata {
    pub fn from_path(path: &Path) -> Self {
        FileMetadata {
            size: std::fs::metadata(path).ok().map(|m| m.len()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileState {
    pub path: String,
    pub size: Option<i64>,
    pub md5: Option<String>,
    pub sha256: Option<String>,
    pub state: ScanState,
    pub error_message: Option<String>,
    pub scan_duration_ms: Option<i64>,
    pub discovered_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub retry_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateStatistics {
    pub counts: HashMap<ScanState, i64>,
    pub total: i64,
    /// Mean of `scan_duration_ms` over completed and failed rows
    pub average_scan_duration_ms: Option<f64>,
}

impl StateStatistics {
    pub fn count(&self, state: ScanState) -> i64 {
        self.counts.get(&state).copied().unwrap_or(0)
    }
}

const SELECT_COLUMNS: &str = "path, size, md5, sha256, state, error_message, scan_duration_ms,
    discovered_at, started_at, completed_at, retry_count";

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl FileState {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let state: String = row.get(4)?;
        Ok(FileState {
            path: row.get(0)?,
            size: row.get(1)?,
            md5: row.get(2)?,
            sha256: row.get(3)?,
            state: ScanState::from_column(&state),
            error_message: row.get(5)?,
            scan_duration_ms: row.get(6)?,
            discovered_at: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
            retry_count: row.get(10)?,
        })
    }

    /// Registers a file as pending. A path that already has a row is left as is.
    /// Returns true when a row for the path exists afterwards.
    pub fn add_file_state(
        db: &Database,
        path: &Path,
        metadata: Option<&FileMetadata>,
    ) -> Result<bool, ThreatPulseError> {
        let conn = db.get_connection()?;
        let default_meta = FileMetadata::default();
        let meta = metadata.unwrap_or(&default_meta);
        let size = meta.size.and_then(|s| i64::try_from(s).ok());

        let inserted = conn.execute(
            "INSERT INTO file_states (path, size, md5, sha256, state, discovered_at)
             VALUES (:path, :size, :md5, :sha256, 'pending', :now)
             ON CONFLICT(path) DO NOTHING",
            named_params! {
                ":path":   path_key(path),
                ":size":   size,
                ":md5":    meta.md5,
                ":sha256": meta.sha256,
                ":now":    Utc::now().timestamp(),
            },
        )?;

        if inserted > 0 {
            debug!("Registered new file: {}", path.display());
        }

        Ok(true)
    }

    /// Atomically claims a pending file for scanning. Exactly one of any number of
    /// concurrent callers for the same path gets `true`.
    pub fn claim_for_scan(db: &Database, path: &Path) -> Result<bool, ThreatPulseError> {
        let conn = db.get_connection()?;
        let changed = conn.execute(
            "UPDATE file_states
             SET state = 'scanning', started_at = :now
             WHERE path = :path AND state = 'pending'",
            named_params! {
                ":path": path_key(path),
                ":now":  Utc::now().timestamp(),
            },
        )?;
        Ok(changed == 1)
    }

    /// Moves a file to `new_state`, setting `started_at` on entering scanning and
    /// `completed_at` on entering a terminal state. Unknown paths and illegal
    /// transitions are logged and reported as `false`.
    pub fn update_file_state(
        db: &Database,
        path: &Path,
        new_state: ScanState,
        error: Option<&str>,
        duration_ms: Option<u64>,
    ) -> Result<bool, ThreatPulseError> {
        let conn = db.get_connection()?;
        Database::immediate_transaction(&conn, |c| {
            Self::update_file_state_locked(c, path, new_state, error, duration_ms)
        })
    }

    /// Transition body for callers that already hold an immediate transaction,
    /// so a state change can commit together with the alerts that caused it.
    pub fn update_file_state_locked(
        conn: &Connection,
        path: &Path,
        new_state: ScanState,
        error: Option<&str>,
        duration_ms: Option<u64>,
    ) -> Result<bool, ThreatPulseError> {
        let key = path_key(path);
        let current: Option<String> = conn
            .query_row(
                "SELECT state FROM file_states WHERE path = ?",
                [&key],
                |row| row.get(0),
            )
            .optional()?;

        let current = match current {
            Some(state) => ScanState::from_column(&state),
            None => {
                warn!("update_file_state: unknown path '{}'", key);
                return Ok(false);
            }
        };

        if !current.can_transition_to(new_state) {
            warn!(
                "update_file_state: rejected transition {} -> {} for '{}'",
                current, new_state, key
            );
            return Ok(false);
        }

        let now = Utc::now().timestamp();
        let (started_at, completed_at) = match new_state {
            ScanState::Scanning => (Some(now), None),
            s if s.is_terminal() => (None, Some(now)),
            _ => (None, None),
        };
        let duration = duration_ms.and_then(|d| i64::try_from(d).ok());

        conn.execute(
            "UPDATE file_states
             SET state = :state,
                 error_message = :error,
                 scan_duration_ms = COALESCE(:duration, scan_duration_ms),
                 started_at = COALESCE(:started_at, started_at),
                 completed_at = COALESCE(:completed_at, completed_at)
             WHERE path = :path",
            named_params! {
                ":state":        new_state.as_ref(),
                ":error":        error,
                ":duration":     duration,
                ":started_at":   started_at,
                ":completed_at": completed_at,
                ":path":         key,
            },
        )?;

        Ok(true)
    }

    /// Records size and digests computed while scanning.
    pub fn set_file_hashes_locked(
        conn: &Connection,
        path: &Path,
        size: u64,
        md5: &str,
        sha256: &str,
    ) -> Result<(), ThreatPulseError> {
        conn.execute(
            "UPDATE file_states SET size = :size, md5 = :md5, sha256 = :sha256 WHERE path = :path",
            named_params! {
                ":size":   i64::try_from(size).unwrap_or(i64::MAX),
                ":md5":    md5,
                ":sha256": sha256,
                ":path":   path_key(path),
            },
        )?;
        Ok(())
    }

    /// Operator override: moves a file from any state to quarantined.
    pub fn quarantine_file(db: &Database, path: &Path) -> Result<bool, ThreatPulseError> {
        let updated = Self::update_file_state(
            db,
            path,
            ScanState::Quarantined,
            Some("quarantined by operator"),
            None,
        )?;
        if updated {
            info!("Quarantined: {}", path.display());
        }
        Ok(updated)
    }

    pub fn get_file_state(db: &Database, path: &Path) -> Result<Option<FileState>, ThreatPulseError> {
        let conn = db.get_connection()?;
        Self::get_file_state_conn(&conn, path)
    }

    pub fn get_file_state_conn(
        conn: &Connection,
        path: &Path,
    ) -> Result<Option<FileState>, ThreatPulseError> {
        let sql = format!("SELECT {} FROM file_states WHERE path = ?", SELECT_COLUMNS);
        let state = conn
            .query_row(&sql, [path_key(path)], Self::from_row)
            .optional()?;
        Ok(state)
    }

    /// Rows in `state`, oldest discovery first.
    pub fn get_files_by_state(
        db: &Database,
        state: ScanState,
        limit: Option<usize>,
    ) -> Result<Vec<FileState>, ThreatPulseError> {
        let conn = db.get_connection()?;
        let sql = format!(
            "SELECT {} FROM file_states WHERE state = :state
             ORDER BY discovered_at, file_state_id LIMIT :limit",
            SELECT_COLUMNS
        );
        let limit = limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX)).unwrap_or(-1);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            named_params! { ":state": state.as_ref(), ":limit": limit },
            Self::from_row,
        )?;

        let mut states = Vec::new();
        for row in rows {
            states.push(row?);
        }
        Ok(states)
    }

    /// Rows stuck in scanning whose claim is older than `timeout_secs`.
    pub fn get_interrupted_scans(
        db: &Database,
        timeout_secs: i64,
    ) -> Result<Vec<FileState>, ThreatPulseError> {
        let conn = db.get_connection()?;
        let sql = format!(
            "SELECT {} FROM file_states
             WHERE state = 'scanning' AND started_at < :cutoff
             ORDER BY started_at",
            SELECT_COLUMNS
        );
        let cutoff = Utc::now().timestamp() - timeout_secs;

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(named_params! { ":cutoff": cutoff }, Self::from_row)?;

        let mut states = Vec::new();
        for row in rows {
            states.push(row?);
        }
        Ok(states)
    }

    /// Resets interrupted scans to pending, bumping `retry_count` by one.
    /// The only path by which a file moves backwards out of scanning.
    pub fn recover_interrupted_scans(
        db: &Database,
        timeout_secs: i64,
    ) -> Result<usize, ThreatPulseError> {
        let conn = db.get_connection()?;
        let cutoff = Utc::now().timestamp() - timeout_secs;
        let recovered = Database::immediate_transaction(&conn, |c| {
            Ok(c.execute(
                "UPDATE file_states
                 SET state = 'pending', retry_count = retry_count + 1, started_at = NULL
                 WHERE state = 'scanning' AND started_at < :cutoff",
                named_params! { ":cutoff": cutoff },
            )?)
        })?;
        Ok(recovered)
    }

    pub fn get_state_statistics(db: &Database) -> Result<StateStatistics, ThreatPulseError> {
        let conn = db.get_connection()?;
        let mut stats = StateStatistics::default();
        for state in ScanState::iter() {
            stats.counts.insert(state, 0);
        }

        let mut stmt = conn.prepare("SELECT state, count(*) FROM file_states GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (state, count) = row?;
            *stats.counts.entry(ScanState::from_column(&state)).or_insert(0) += count;
            stats.total += count;
        }

        stats.average_scan_duration_ms = conn.query_row(
            "SELECT AVG(scan_duration_ms) FROM file_states
             WHERE state IN ('completed', 'failed') AND scan_duration_ms IS NOT NULL",
            [],
            |row| row.get(0),
        )?;

        Ok(stats)
    }

    /// Purges completed and failed rows whose completion is older than the
    /// retention period. Files on disk are not touched.
    pub fn cleanup_completed_states(
        db: &Database,
        retention_hours: u64,
    ) -> Result<usize, ThreatPulseError> {
        let _tmr = timer!(Level::Trace; "FileState::cleanup_completed_states");
        let conn = db.get_connection()?;
        let retention_secs = i64::try_from(retention_hours.saturating_mul(3600)).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp().saturating_sub(retention_secs);
        let purged = Database::immediate_transaction(&conn, |c| {
            Ok(c.execute(
                "DELETE FROM file_states
                 WHERE state IN ('completed', 'failed') AND completed_at < :cutoff",
                named_params! { ":cutoff": cutoff },
            )?)
        })?;
        if purged > 0 {
            info!("Purged {} terminal state rows older than {}h", purged, retention_hours);
        }
        Ok(purged)
    }
}
