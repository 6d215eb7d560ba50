use log::{info, warn, Level};
use logging_timer::timer;

use crate::config::RecoveryConfig;
use crate::database::Database;
use crate::error::ThreatPulseError;
use crate::file_state::FileState;

/// Returns files left in `scanning` by a crash or kill to `pending` so they are
/// scanned again. Runs before any new work is admitted. Only claims older than
/// the recovery timeout are touched.
pub fn recover_interrupted_scans(
    db: &Database,
    config: &RecoveryConfig,
) -> Result<usize, ThreatPulseError> {
    let _tmr = timer!(Level::Trace; "recover_interrupted_scans");
    let timeout_secs = i64::try_from(config.timeout_minutes.saturating_mul(60)).unwrap_or(i64::MAX);

    let interrupted = FileState::get_interrupted_scans(db, timeout_secs)?;
    for state in &interrupted {
        warn!(
            "Interrupted scan: '{}' (started_at {:?}, retry {})",
            state.path,
            state.started_at,
            state.retry_count + 1
        );
    }

    let recovered = FileState::recover_interrupted_scans(db, timeout_secs)?;
    if recovered > 0 {
        info!("Recovered {} interrupted scan(s)", recovered);
    } else {
        info!("No interrupted scans to recover");
    }
    Ok(recovered)
}
