use std::path::Path;

use crate::config::ScannerConfig;

/// What the scanner should do with a claimed file before invoking the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Scan,
    /// Fail fast without reading the file
    TooLarge { size: u64, limit: u64 },
    /// Mark completed without scanning; never counts as a detection
    Excluded(String),
}

#[derive(Debug, Clone, Default)]
pub struct ScanPolicy {
    max_file_size: u64,
    allowed_extensions: Vec<String>,
    excluded_extensions: Vec<String>,
    excluded_mime_types: Vec<String>,
}

impl ScanPolicy {
    pub fn from_config(config: &ScannerConfig) -> Self {
        ScanPolicy {
            max_file_size: config.max_file_size_bytes(),
            allowed_extensions: config.allowed_extensions.clone(),
            excluded_extensions: config.excluded_extensions.clone(),
            excluded_mime_types: config.excluded_mime_types.clone(),
        }
    }

    /// Size is checked first so oversized files fail even if they would also
    /// have been excluded.
    pub fn evaluate(&self, path: &Path, size: u64) -> PolicyDecision {
        if self.max_file_size > 0 && size > self.max_file_size {
            return PolicyDecision::TooLarge {
                size,
                limit: self.max_file_size,
            };
        }

        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        if !self.allowed_extensions.is_empty() && !self.allowed_extensions.contains(&ext) {
            return PolicyDecision::Excluded(format!(
                "extension '{}' not in allow-list",
                ext
            ));
        }

        if self.excluded_extensions.contains(&ext) {
            return PolicyDecision::Excluded(format!(
                "extension '{}' is excluded",
                ext
            ));
        }

        if !self.excluded_mime_types.is_empty() {
            if let Some(mime) = mime_guess::from_path(path).first_raw() {
                let excluded = self.excluded_mime_types.iter().any(|rule| {
                    if rule.ends_with('/') {
                        mime.starts_with(rule.as_str())
                    } else {
                        mime == rule
                    }
                });
                if excluded {
                    return PolicyDecision::Excluded(format!(
                        "MIME type '{}' is excluded",
                        mime
                    ));
                }
            }
        }

        PolicyDecision::Scan
    }
}
