use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ThreatPulseError;

const CONFIG_FILENAME: &str = "config.toml";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Log spec for flexi_logger, e.g. "info" or "info,threatpulse::scanner=debug"
    pub level: String,
    /// Directory for rotated log files. Logs go to stderr when unset.
    pub directory: Option<String>,
    pub rotate_size_mb: u64,
    pub keep_files: usize,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const DEFAULT_LEVEL: &str = "info";

    fn ensure_valid(&mut self) {
        // Only the leading global level is checked. Module directives after the
        // first comma are passed through to flexi_logger untouched.
        let str_original = self.level.clone();
        let normalized = self.level.trim().to_ascii_lowercase();
        let global = normalized.split(',').next().unwrap_or_default().trim();
        if !Self::LOG_LEVELS.contains(&global) {
            eprintln!(
                "Config error: log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::DEFAULT_LEVEL
            );
            self.level = Self::DEFAULT_LEVEL.to_owned();
        } else {
            self.level = normalized;
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Self::DEFAULT_LEVEL.to_string(),
            directory: None,
            rotate_size_mb: 10,
            keep_files: 7,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub path: String,
    pub pool_size: u32,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: "threatpulse.db".to_string(),
            pool_size: 16,
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScannerConfig {
    pub watch_dir: String,
    /// Worker thread count. 0 means one per available CPU.
    pub threads: usize,
    pub queue_size: usize,
    pub settle_delay_ms: u64,
    pub enqueue_timeout_ms: u64,
    pub priority_enqueue_timeout_ms: u64,
    pub dequeue_timeout_ms: u64,
    pub scan_timeout_secs: u64,
    pub max_file_size_mb: u64,
    /// When non-empty, only these extensions are scanned.
    pub allowed_extensions: Vec<String>,
    pub excluded_extensions: Vec<String>,
    /// MIME prefixes such as "video/" or exact types such as "application/x-iso9660-image".
    pub excluded_mime_types: Vec<String>,
    pub rules_path: Option<String>,
    /// Re-enqueue pending rows on this interval. 0 disables the resweep.
    pub resweep_interval_secs: u64,
}

impl ScannerConfig {
    pub fn worker_threads(&self) -> usize {
        if self.threads > 0 {
            return self.threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn enqueue_timeout(&self, priority: bool) -> Duration {
        if priority {
            Duration::from_millis(self.priority_enqueue_timeout_ms)
        } else {
            Duration::from_millis(self.enqueue_timeout_ms)
        }
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    fn ensure_valid(&mut self) -> Result<(), ThreatPulseError> {
        if self.queue_size == 0 {
            return Err(ThreatPulseError::ConfigError(
                "scanner.queue_size must be at least 1".into(),
            ));
        }
        if self.scan_timeout_secs == 0 {
            return Err(ThreatPulseError::ConfigError(
                "scanner.scan_timeout_secs must be at least 1".into(),
            ));
        }
        if self.dequeue_timeout_ms == 0 {
            return Err(ThreatPulseError::ConfigError(
                "scanner.dequeue_timeout_ms must be at least 1".into(),
            ));
        }

        // Extensions are compared without the leading dot and in lower case
        for list in [&mut self.allowed_extensions, &mut self.excluded_extensions] {
            for ext in list.iter_mut() {
                *ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
            }
            list.retain(|ext| !ext.is_empty());
        }
        for mime in self.excluded_mime_types.iter_mut() {
            *mime = mime.trim().to_ascii_lowercase();
        }
        self.excluded_mime_types.retain(|m| !m.is_empty());

        Ok(())
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            watch_dir: "extracted".to_string(),
            threads: 0,
            queue_size: 1000,
            settle_delay_ms: 500,
            enqueue_timeout_ms: 1_000,
            priority_enqueue_timeout_ms: 100,
            dequeue_timeout_ms: 1_000,
            scan_timeout_secs: 60,
            max_file_size_mb: 100,
            allowed_extensions: Vec::new(),
            excluded_extensions: Vec::new(),
            excluded_mime_types: Vec::new(),
            rules_path: None,
            resweep_interval_secs: 300,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HealthConfig {
    pub sample_interval_secs: u64,
    pub queue_depth_window: usize,
    pub duration_window: usize,
    pub warning_after_secs: u64,
    pub unhealthy_after_secs: u64,
    /// How long shutdown waits for each background thread
    pub shutdown_timeout_secs: u64,
}

impl HealthConfig {
    fn ensure_valid(&self) -> Result<(), ThreatPulseError> {
        if self.warning_after_secs >= self.unhealthy_after_secs {
            return Err(ThreatPulseError::ConfigError(format!(
                "health.warning_after_secs ({}) must be less than health.unhealthy_after_secs ({})",
                self.warning_after_secs, self.unhealthy_after_secs
            )));
        }
        if self.queue_depth_window == 0 || self.duration_window == 0 {
            return Err(ThreatPulseError::ConfigError(
                "health rolling windows must hold at least one sample".into(),
            ));
        }
        Ok(())
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            sample_interval_secs: 10,
            queue_depth_window: 60,
            duration_window: 100,
            warning_after_secs: 60,
            unhealthy_after_secs: 300,
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RecoveryConfig {
    pub timeout_minutes: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig { timeout_minutes: 30 }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub clean_retention_hours: u64,
    pub matched_retention_hours: u64,
    /// Terminal state rows older than this are purged. 0 keeps them forever.
    pub state_retention_hours: u64,
    pub disk_warning_percent: f64,
    pub disk_critical_percent: f64,
}

impl CleanupConfig {
    fn ensure_valid(&self) -> Result<(), ThreatPulseError> {
        if self.interval_minutes == 0 {
            return Err(ThreatPulseError::ConfigError(
                "cleanup.interval_minutes must be at least 1".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.disk_critical_percent)
            || self.disk_warning_percent >= self.disk_critical_percent
        {
            return Err(ThreatPulseError::ConfigError(format!(
                "cleanup disk thresholds invalid: warning {} must be below critical {} (max 100)",
                self.disk_warning_percent, self.disk_critical_percent
            )));
        }
        Ok(())
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        CleanupConfig {
            enabled: true,
            interval_minutes: 60,
            clean_retention_hours: 24,
            matched_retention_hours: 720,
            state_retention_hours: 0,
            disk_warning_percent: 80.0,
            disk_critical_percent: 90.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CorrelationConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub window_minutes: u64,
    pub time_window_secs: u64,
    /// Groups repeating a stored (type, primary alert) within this many minutes
    /// are not stored again. 0 stores every group.
    pub dedupe_lookback_minutes: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        CorrelationConfig {
            enabled: true,
            interval_secs: 60,
            window_minutes: 5,
            time_window_secs: 60,
            dedupe_lookback_minutes: 60,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub scanner: ScannerConfig,
    pub health: HealthConfig,
    pub recovery: RecoveryConfig,
    pub cleanup: CleanupConfig,
    pub correlation: CorrelationConfig,
}

impl Config {
    /// Default location of the config file in the platform's local data directory.
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "threatpulse")
            .map(|dirs| dirs.data_local_dir().join(CONFIG_FILENAME))
    }

    /// Loads the configuration: defaults, then the TOML file, then
    /// `THREATPULSE_` environment variables (`THREATPULSE_SCANNER__THREADS=4`).
    /// Writes the default config to disk if no file exists at the default location.
    pub fn load_config(explicit_path: Option<&Path>) -> Result<Self, ThreatPulseError> {
        let config_path = match explicit_path {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let path = Self::default_config_path();
                if let Some(path) = &path {
                    Self::write_default_if_missing(path);
                }
                path
            }
        };

        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = &config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("THREATPULSE_").split("__"));

        let mut config: Config = figment
            .extract()
            .map_err(|err| ThreatPulseError::ConfigError(err.to_string()))?;

        config.ensure_valid()?;

        Ok(config)
    }

    fn write_default_if_missing(config_path: &Path) {
        if config_path.exists() {
            return;
        }
        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
                return;
            }
        }
        match toml::to_string_pretty(&Config::default()) {
            Ok(toml_string) => {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            }
            Err(_) => eprintln!("Failed to serialize default config."),
        }
    }

    pub fn ensure_valid(&mut self) -> Result<(), ThreatPulseError> {
        self.logging.ensure_valid();
        self.scanner.ensure_valid()?;
        self.health.ensure_valid()?;
        self.cleanup.ensure_valid()?;

        if self.database.pool_size == 0 {
            return Err(ThreatPulseError::ConfigError(
                "database.pool_size must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
