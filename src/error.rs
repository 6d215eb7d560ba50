use rusqlite::Error as RusqliteError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ThreatPulseError {
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("File too large: {path} is {size} bytes (limit {limit} bytes)")]
    FileTooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("excluded by policy: {0}")]
    ExcludedByPolicy(String),

    #[error("Scan timed out after {0:?}")]
    ScanTimeout(std::time::Duration),

    #[error("Scan engine error: {0}")]
    ScanEngineError(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Queue full: could not enqueue {0}")]
    QueueFull(PathBuf),

    #[error("Worker {worker_id} unhealthy: no heartbeat for {silent_secs}s")]
    WorkerUnhealthy { worker_id: usize, silent_secs: i64 },

    #[error("Cleanup I/O error on {path}: {source}")]
    CleanupIOError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Correlation source unavailable: {0}")]
    CorrelationSourceUnavailable(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into ThreatPulseError automatically

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Watcher error: {0}")]
    WatchError(#[from] notify::Error),

    #[error("Serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}
