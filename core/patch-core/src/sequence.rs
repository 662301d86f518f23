//! Which generation (sequence number) a trigger belongs to.
//!
//! The host normally passes the sequence through the `ConfigSequenceNumber`
//! environment variable. Without it, the most recently modified
//! `<n>.settings` file in the config folder decides.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{PatchError, Result};

pub const SEQUENCE_ENV_VAR: &str = "ConfigSequenceNumber";

static RE_SETTINGS_FILE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)\.settings$").unwrap());

#[derive(Debug, Clone)]
pub struct SequenceResolver {
    config_dir: PathBuf,
    external: Option<u64>,
}

impl SequenceResolver {
    pub fn new(config_dir: impl Into<PathBuf>, external: Option<u64>) -> Self {
        Self {
            config_dir: config_dir.into(),
            external,
        }
    }

    /// Reads the external signal from the environment. An unparseable value
    /// is ignored and the directory scan takes over.
    pub fn from_env(config_dir: impl Into<PathBuf>) -> Self {
        let external = std::env::var(SEQUENCE_ENV_VAR)
            .ok()
            .and_then(|raw| match raw.trim().parse::<u64>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(value = %raw, "Ignoring non-numeric {}", SEQUENCE_ENV_VAR);
                    None
                }
            });
        Self::new(config_dir, external)
    }

    pub fn resolve(&self, is_enable_trigger: bool) -> Result<u64> {
        if let Some(sequence) = self.external {
            debug!(sequence, is_enable_trigger, "Sequence number from environment");
            return Ok(sequence);
        }
        let sequence = latest_settings_sequence(&self.config_dir)?;
        info!(sequence, is_enable_trigger, "Sequence number from settings files");
        Ok(sequence)
    }
}

/// Most recently modified `<n>.settings` file. Exact mtime ties go to the
/// higher sequence number.
pub fn latest_settings_sequence(config_dir: &Path) -> Result<u64> {
    let mut best: Option<(SystemTime, u64)> = None;

    for entry in WalkDir::new(config_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(file_name) = entry.file_name().to_str() else {
            continue;
        };
        let Some(sequence) = RE_SETTINGS_FILE
            .captures(file_name)
            .and_then(|caps| caps[1].parse::<u64>().ok())
        else {
            continue;
        };
        let modified = match entry.metadata().map(|m| m.modified()) {
            Ok(Ok(modified)) => modified,
            _ => {
                warn!(file = file_name, "Cannot read modification time, skipping");
                continue;
            }
        };
        if best.map_or(true, |current| (modified, sequence) > current) {
            best = Some((modified, sequence));
        }
    }

    best.map(|(_, sequence)| sequence)
        .ok_or(PatchError::SequenceUnresolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str, mtime: SystemTime) {
        let file = File::create(dir.join(name)).unwrap();
        file.set_modified(mtime).unwrap();
    }

    #[test]
    fn test_most_recent_numeric_settings_file_wins() {
        let temp = tempdir().unwrap();
        let base = SystemTime::now() - Duration::from_secs(3600);
        for (i, seq) in [12, 121, 0, 10, 111, 2].iter().enumerate() {
            touch(temp.path(), &format!("{}.settings", seq), base + Duration::from_secs(i as u64));
        }
        touch(temp.path(), "122.settings", base + Duration::from_secs(100));
        for junk in [
            "aa.settings",
            "3a.settings",
            "a3.settings",
            "22.settings.settings",
            "abc.123.settings",
            ".settings",
            "111111",
            "5.json",
        ] {
            touch(temp.path(), junk, base + Duration::from_secs(500));
        }
        std::fs::create_dir(temp.path().join("999.settings")).unwrap();

        let resolver = SequenceResolver::new(temp.path(), None);
        assert_eq!(resolver.resolve(true).unwrap(), 122);
    }

    #[test]
    fn test_external_signal_skips_directory() {
        let temp = tempdir().unwrap();
        touch(temp.path(), "7.settings", SystemTime::now());
        let resolver = SequenceResolver::new(temp.path().join("missing"), Some(42));
        assert_eq!(resolver.resolve(false).unwrap(), 42);
    }

    #[test]
    fn test_no_candidates_is_unresolved() {
        let temp = tempdir().unwrap();
        touch(temp.path(), "abc.settings", SystemTime::now());
        let resolver = SequenceResolver::new(temp.path(), None);
        assert!(matches!(
            resolver.resolve(true),
            Err(PatchError::SequenceUnresolved)
        ));
    }

    #[test]
    fn test_exact_tie_prefers_higher_sequence() {
        let temp = tempdir().unwrap();
        let at = SystemTime::now() - Duration::from_secs(60);
        touch(temp.path(), "4.settings", at);
        touch(temp.path(), "9.settings", at);
        touch(temp.path(), "6.settings", at);
        assert_eq!(latest_settings_sequence(temp.path()).unwrap(), 9);
    }
}
