use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, DebouncedEventKind, Debouncer};

use crate::error::ThreatPulseError;
use crate::pipeline::{Admission, Admitted};

/// Watches the extraction directory and admits files once they have been quiet
/// for the settle delay, so half-written files are not scanned.
///
/// The debouncer also reports `AnyContinuous` for paths that keep changing past
/// the settle delay; those are still being written and are ignored until the
/// final quiet `Any` event.
pub struct DirectoryWatcher {
    watch_dir: PathBuf,
    _debouncer: Debouncer<RecommendedWatcher>,
}

impl DirectoryWatcher {
    pub fn start(
        watch_dir: &Path,
        settle_delay: Duration,
        admission: Arc<Admission>,
    ) -> Result<Self, ThreatPulseError> {
        let mut debouncer = new_debouncer(settle_delay, move |res: DebounceEventResult| match res {
            Ok(events) => {
                for event in events {
                    if event.kind == DebouncedEventKind::Any {
                        Self::handle_event(&admission, &event.path);
                    }
                }
            }
            Err(e) => error!("File watcher error: {}", e),
        })?;

        debouncer
            .watcher()
            .watch(watch_dir, RecursiveMode::NonRecursive)?;

        info!(
            "Watching '{}' (settle delay {:?})",
            watch_dir.display(),
            settle_delay
        );

        Ok(DirectoryWatcher {
            watch_dir: watch_dir.to_path_buf(),
            _debouncer: debouncer,
        })
    }

    fn handle_event(admission: &Admission, path: &Path) {
        match admission.admit(path, false) {
            Ok(Admitted::Queued) => debug!("Admitted: {}", path.display()),
            Ok(_) => {}
            Err(ThreatPulseError::QueueFull(_)) => {
                // Row stays pending; the resweep picks it up
            }
            Err(e) => warn!("Admission failed for '{}': {}", path.display(), e),
        }
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        info!("Stopped watching '{}'", self.watch_dir.display());
    }
}
