//! Storage configuration and path management for the patch agent.
//!
//! Every path the wrapper and core process touch is derived here from the
//! handler environment the host hands us. Tests build a `StorageConfig`
//! with `with_root(temp_dir)` instead of a real `HandlerEnvironment.json`.

use std::path::{Path, PathBuf};

use fs_err as fs;
use patch_protocol::{
    HandlerEnvironment, HandlerEnvironmentFile, CORE_STATE_FILE, EXT_STATE_FILE, SETTINGS_SUFFIX,
    STATUS_SUFFIX,
};

use crate::error::{PatchError, Result};

/// Central configuration for all agent storage paths.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    config_dir: PathBuf,
    status_dir: PathBuf,
    log_dir: PathBuf,
    /// None when the host agent doesn't support telemetry.
    events_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn from_environment(env: &HandlerEnvironment) -> Self {
        Self {
            config_dir: PathBuf::from(&env.config_folder),
            status_dir: PathBuf::from(&env.status_folder),
            log_dir: PathBuf::from(&env.log_folder),
            events_dir: env
                .events_folder
                .as_deref()
                .filter(|folder| !folder.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    /// Reads `HandlerEnvironment.json` (an array; the first entry wins).
    pub fn load(handler_env_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(handler_env_path)
            .map_err(|e| PatchError::io("Failed to read handler environment", e))?;
        let entries: HandlerEnvironmentFile = serde_json::from_str(&content)
            .map_err(|e| PatchError::json("Failed to parse handler environment", e))?;
        let entry = entries.first().ok_or_else(|| PatchError::ConfigValidation {
            path: handler_env_path.to_path_buf(),
            fields: vec!["handlerEnvironment".to_string()],
        })?;
        Ok(Self::from_environment(&entry.handler_environment))
    }

    /// Creates a StorageConfig rooted in a single directory.
    /// Used for testing with temp directories.
    pub fn with_root(root: &Path) -> Self {
        Self {
            config_dir: root.join("config"),
            status_dir: root.join("status"),
            log_dir: root.join("log"),
            events_dir: Some(root.join("events")),
        }
    }

    pub fn without_events(mut self) -> Self {
        self.events_dir = None;
        self
    }

    /// Creates every folder this config points at.
    pub fn ensure_dirs(&self) -> Result<()> {
        let mut dirs = vec![&self.config_dir, &self.status_dir, &self.log_dir];
        if let Some(events) = &self.events_dir {
            dirs.push(events);
        }
        for dir in dirs {
            fs::create_dir_all(dir)
                .map_err(|e| PatchError::io(format!("Failed to create {}", dir.display()), e))?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Directories
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn status_dir(&self) -> &Path {
        &self.status_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn events_dir(&self) -> Option<&Path> {
        self.events_dir.as_deref()
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Files
    // ─────────────────────────────────────────────────────────────────────────────

    /// Path to ExtState.json (wrapper-side sequence record).
    pub fn ext_state_file(&self) -> PathBuf {
        self.config_dir.join(EXT_STATE_FILE)
    }

    /// Path to CoreState.json (core-side progress record).
    pub fn core_state_file(&self) -> PathBuf {
        self.config_dir.join(CORE_STATE_FILE)
    }

    /// Path to the settings payload for a sequence.
    /// Example: config/12.settings
    pub fn settings_file(&self, sequence: u64) -> PathBuf {
        self.config_dir.join(format!("{}{}", sequence, SETTINGS_SUFFIX))
    }

    /// Path to the status document the host polls for a sequence.
    /// Example: status/12.status
    pub fn status_file(&self, sequence: u64) -> PathBuf {
        self.status_dir.join(format!("{}{}", sequence, STATUS_SUFFIX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_with_root_paths() {
        let config = StorageConfig::with_root(Path::new("/tmp/agent"));
        assert_eq!(
            config.settings_file(12),
            PathBuf::from("/tmp/agent/config/12.settings")
        );
        assert_eq!(
            config.status_file(12),
            PathBuf::from("/tmp/agent/status/12.status")
        );
        assert_eq!(
            config.ext_state_file(),
            PathBuf::from("/tmp/agent/config/ExtState.json")
        );
        assert_eq!(
            config.core_state_file(),
            PathBuf::from("/tmp/agent/config/CoreState.json")
        );
    }

    #[test]
    fn test_load_handler_environment() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("HandlerEnvironment.json");
        std::fs::write(
            &path,
            r#"[{"version":1.0,"handlerEnvironment":{"logFolder":"/l","configFolder":"/c","statusFolder":"/s","eventsFolder":""}}]"#,
        )
        .unwrap();

        let config = StorageConfig::load(&path).unwrap();
        assert_eq!(config.config_dir(), Path::new("/c"));
        assert_eq!(config.status_dir(), Path::new("/s"));
        assert!(config.events_dir().is_none());
    }

    #[test]
    fn test_load_empty_handler_environment_fails() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("HandlerEnvironment.json");
        std::fs::write(&path, "[]").unwrap();

        let err = StorageConfig::load(&path).unwrap_err();
        assert!(matches!(err, PatchError::ConfigValidation { .. }));
    }

    #[test]
    fn test_ensure_dirs_creates_folders() {
        let temp = tempdir().unwrap();
        let config = StorageConfig::with_root(temp.path());
        config.ensure_dirs().unwrap();
        assert!(config.config_dir().is_dir());
        assert!(config.status_dir().is_dir());
        assert!(config.events_dir().unwrap().is_dir());
    }
}
