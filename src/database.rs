use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension};

use crate::config::DatabaseConfig;
use crate::error::ThreatPulseError;
use crate::schema::{CREATE_SCHEMA_SQL, SCHEMA_VERSION};

pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Handle to the state store. Cloning is cheap: clones share one connection pool.
///
/// Every unit of work checks a connection out of the pool with
/// [`Database::get_connection`] and returns it when the guard drops, so a
/// thread never holds more than the connection it is using.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    db_path: PathBuf,
}

impl Database {
    pub fn open(config: &DatabaseConfig) -> Result<Self, ThreatPulseError> {
        Self::open_with(
            Path::new(&config.path),
            config.pool_size,
            Duration::from_millis(config.busy_timeout_ms),
        )
    }

    pub fn open_with(
        db_path: &Path,
        pool_size: u32,
        busy_timeout: Duration,
    ) -> Result<Self, ThreatPulseError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            // journal_mode reports the resulting mode as a row
            conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))?;
            conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;")
        });

        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)?;

        let db = Database {
            pool,
            db_path: db_path.to_path_buf(),
        };

        let conn = db.get_connection()?;
        Self::ensure_schema(&conn)?;
        info!("Database opened at: {}", db_path.display());

        Ok(db)
    }

    pub fn get_connection(&self) -> Result<DbConnection, ThreatPulseError> {
        Ok(self.pool.get()?)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn ensure_schema(conn: &Connection) -> Result<(), ThreatPulseError> {
        let table_exists: bool = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='meta'",
                [],
                |row| row.get::<_, i32>(0),
            )
            .map(|count| count > 0)
            .unwrap_or(false);

        if !table_exists {
            debug!("Creating schema version {}", SCHEMA_VERSION);
            conn.execute_batch(CREATE_SCHEMA_SQL)?;
            return Ok(());
        }

        let stored_version: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored_version.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()),
            Some(other) => Err(ThreatPulseError::StoreError(format!(
                "Schema version mismatch: database has {}, expected {}",
                other, SCHEMA_VERSION
            ))),
            None => Err(ThreatPulseError::StoreError(
                "Schema version missing".to_string(),
            )),
        }
    }

    /// Runs `f` inside a `BEGIN IMMEDIATE` transaction, committing on success and
    /// rolling back on any error. The write lock is taken up front so
    /// read-then-write sequences inside `f` cannot interleave with other writers.
    pub fn immediate_transaction<T, F>(conn: &Connection, f: F) -> Result<T, ThreatPulseError>
    where
        F: FnOnce(&Connection) -> Result<T, ThreatPulseError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                    log::error!("Rollback failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    }
}
