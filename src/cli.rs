use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};
use log::{debug, error, info};
use serde::Serialize;

use crate::alerts::{AlertFilter, Alerts};
use crate::cleanup::CleanupScheduler;
use crate::config::{Config, LoggingConfig};
use crate::correlation::{CorrelationEngine, CorrelationFilter, CorrelationType, SidecarResolver};
use crate::database::Database;
use crate::detection::SignatureEngine;
use crate::error::ThreatPulseError;
use crate::file_state::FileState;
use crate::pipeline::Pipeline;
use crate::recovery;

#[derive(Parser)]
#[command(
    name = "threatpulse",
    version,
    about = "threatPulse: scan extracted files for threats and correlate them with network alerts"
)]
pub struct Cli {
    /// Config file (default: platform data directory)
    #[arg(long = "config", short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the pipeline until Ctrl-C (default if no command specified)
    Run,

    /// Return interrupted scans to pending and exit
    Recover,

    /// Run one retention sweep and print the result
    Cleanup,

    /// Run one correlation pass and print the groups found
    Correlate,

    /// Print file state counts
    Stats,

    /// List detection alerts, newest first
    Alerts {
        #[arg(long = "rule")]
        rule: Option<String>,

        #[arg(long = "path")]
        path: Option<String>,

        #[arg(long = "min-severity", value_parser = clap::value_parser!(i64).range(0..=10))]
        min_severity: Option<i64>,

        /// Only alerts from the last N minutes
        #[arg(long = "since-minutes")]
        since_minutes: Option<i64>,

        #[arg(long = "limit", default_value_t = 50)]
        limit: usize,

        #[arg(long = "offset", default_value_t = 0)]
        offset: usize,

        /// Delete the matching alerts instead of listing them
        #[arg(long = "delete", conflicts_with_all = ["limit", "offset"])]
        delete: bool,
    },

    /// List stored correlation groups, newest first
    Correlations {
        #[arg(long = "min-confidence", value_parser = clap::value_parser!(i64).range(0..=100))]
        min_confidence: Option<i64>,

        /// ip, hash or time_proximity
        #[arg(long = "type")]
        correlation_type: Option<CorrelationType>,

        #[arg(long = "limit", default_value_t = 50)]
        limit: usize,

        #[arg(long = "offset", default_value_t = 0)]
        offset: usize,
    },

    /// Move a file to quarantined regardless of its current state
    Quarantine {
        path: PathBuf,
    },
}

impl Cli {
    pub fn handle_command_line() -> Result<(), ThreatPulseError> {
        let args = Cli::parse();
        let config = Config::load_config(args.config.as_deref())?;
        let _logger = Self::init_logging(&config.logging)?;
        debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());

        let db = Database::open(&config.database)?;

        // Default to Run if no command specified
        match args.command.unwrap_or(Command::Run) {
            Command::Run => Self::run(config, db),
            Command::Recover => {
                let recovered = recovery::recover_interrupted_scans(&db, &config.recovery)?;
                println!("Recovered {} interrupted scan(s)", recovered);
                Ok(())
            }
            Command::Cleanup => {
                let watch_dir = PathBuf::from(&config.scanner.watch_dir);
                let result = CleanupScheduler::new(db, &watch_dir, config.cleanup).run_cleanup();
                Self::print_json(&result)
            }
            Command::Correlate => {
                let engine = CorrelationEngine::new(db, config.correlation, Arc::new(SidecarResolver));
                Self::print_json(&engine.run_correlation())
            }
            Command::Stats => Self::print_json(&FileState::get_state_statistics(&db)?),
            Command::Alerts {
                rule,
                path,
                min_severity,
                since_minutes,
                limit,
                offset,
                delete,
            } => {
                let filter = AlertFilter {
                    rule_name: rule,
                    file_path: path,
                    min_severity,
                    since: since_minutes.map(|m| Utc::now().timestamp() - m.saturating_mul(60)),
                    until: None,
                };
                if delete {
                    let deleted = Alerts::delete_alerts(&db, &filter)?;
                    println!("Deleted {} alert(s)", deleted);
                    Ok(())
                } else {
                    Self::print_json(&Alerts::get_alerts(&db, &filter, Some(limit), Some(offset))?)
                }
            }
            Command::Correlations {
                min_confidence,
                correlation_type,
                limit,
                offset,
            } => {
                let filter = CorrelationFilter {
                    min_confidence,
                    correlation_type,
                };
                Self::print_json(&CorrelationEngine::get_correlations(
                    &db,
                    &filter,
                    Some(limit),
                    Some(offset),
                )?)
            }
            Command::Quarantine { path } => {
                if FileState::quarantine_file(&db, &path)? {
                    println!("Quarantined {}", path.display());
                    Ok(())
                } else {
                    Err(ThreatPulseError::Error(format!(
                        "could not quarantine '{}' (unknown path or already quarantined)",
                        path.display()
                    )))
                }
            }
        }
    }

    fn run(config: Config, db: Database) -> Result<(), ThreatPulseError> {
        let rules_path = config.scanner.rules_path.as_deref().map(Path::new);
        let engine = Arc::new(SignatureEngine::load(rules_path)?);

        let mut pipeline = Pipeline::new(config, db, engine, Arc::new(SidecarResolver));
        pipeline.start()?;

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ThreatPulseError::Error(format!("Failed to create runtime: {}", e)))?;

        let signal = rt.block_on(tokio::signal::ctrl_c());
        match signal {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => error!("Unable to listen for shutdown signal: {}", e),
        }

        pipeline.stop();
        Ok(())
    }

    /// Starts flexi_logger. The returned handle must stay alive for the life of
    /// the process or buffered file output is lost.
    fn init_logging(config: &LoggingConfig) -> Result<LoggerHandle, ThreatPulseError> {
        let logger = Logger::try_with_str(&config.level)
            .map_err(|e| ThreatPulseError::ConfigError(format!("logging.level: {}", e)))?;

        let logger = match &config.directory {
            Some(dir) => logger
                .log_to_file(FileSpec::default().directory(dir).basename("threatpulse"))
                .rotate(
                    Criterion::Size(config.rotate_size_mb.max(1) * 1024 * 1024),
                    Naming::Timestamps,
                    Cleanup::KeepLogFiles(config.keep_files),
                )
                .duplicate_to_stderr(Duplicate::Warn),
            None => logger.log_to_stderr(),
        };

        logger
            .format(flexi_logger::detailed_format)
            .start()
            .map_err(|e| ThreatPulseError::Error(format!("Failed to start logger: {}", e)))
    }

    fn print_json<T: Serialize>(value: &T) -> Result<(), ThreatPulseError> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_parsing_no_command_defaults_to_run() {
        let cli = Cli::try_parse_from(["threatpulse"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
        assert!(matches!(cli.command.unwrap_or(Command::Run), Command::Run));
    }

    #[test]
    fn test_cli_parsing_global_config() {
        let cli = Cli::try_parse_from(["threatpulse", "stats", "--config", "/etc/tp.toml"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Stats)));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/tp.toml")));
    }

    #[test]
    fn test_cli_parsing_alert_filters() {
        let cli = Cli::try_parse_from([
            "threatpulse",
            "alerts",
            "--rule",
            "EICAR_Test_File",
            "--min-severity",
            "7",
            "--limit",
            "5",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Alerts {
                rule,
                min_severity,
                limit,
                offset,
                delete,
                ..
            }) => {
                assert_eq!(rule.as_deref(), Some("EICAR_Test_File"));
                assert_eq!(min_severity, Some(7));
                assert_eq!(limit, 5);
                assert_eq!(offset, 0);
                assert!(!delete);
            }
            _ => panic!("expected alerts command"),
        }
    }

    #[test]
    fn test_cli_parsing_correlation_type() {
        let cli = Cli::try_parse_from(["threatpulse", "correlations", "--type", "time_proximity"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Correlations {
                correlation_type: Some(CorrelationType::TimeProximity),
                ..
            })
        ));
    }

    #[test]
    fn test_cli_parsing_invalid_arguments() {
        assert!(Cli::try_parse_from(["threatpulse", "nonexistent-command"]).is_err());
        assert!(Cli::try_parse_from(["threatpulse", "alerts", "--min-severity", "11"]).is_err());
        assert!(Cli::try_parse_from(["threatpulse", "correlations", "--type", "dns"]).is_err());
        assert!(Cli::try_parse_from(["threatpulse", "quarantine"]).is_err());
    }
}
