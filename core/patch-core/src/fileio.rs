//! Retrying, atomic file access shared by every persisted document.
//!
//! Readers in another process must never observe a half-written file, so all
//! writes go through a temp file in the target directory followed by a rename.
//! Only raw I/O is retried; parse failures are reported straight back.

use std::io::Write;
use std::path::Path;
use std::thread;
use std::time::Duration;

use fs_err as fs;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};

use crate::error::{PatchError, Result};

pub const MAX_FILE_OPERATION_RETRY_COUNT: u32 = 5;
const RETRY_STEP: Duration = Duration::from_secs(1);

/// Bounded retry with linear backoff: attempt `n` (0-based) waits `step * (n + 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: MAX_FILE_OPERATION_RETRY_COUNT,
            step: RETRY_STEP,
        }
    }
}

impl RetryPolicy {
    /// No sleeping between attempts. Used by tests.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            step: Duration::ZERO,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt + 1)
    }

    fn run<T, F>(&self, path: &Path, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> std::io::Result<T>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 >= attempts => {
                    error!(
                        path = %path.display(),
                        attempts,
                        error = %err,
                        "{} failed (retries exhausted)",
                        label
                    );
                    return Err(PatchError::TransientIo {
                        path: path.to_path_buf(),
                        attempts,
                        source: err,
                    });
                }
                Err(err) => {
                    let delay = self.backoff(attempt);
                    warn!(
                        path = %path.display(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "{} failed, retrying",
                        label
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

pub fn read_with_retry(path: &Path, policy: &RetryPolicy) -> Result<String> {
    policy.run(path, "File read", || fs::read_to_string(path))
}

/// Atomically replaces `path` with `content`, retrying transient failures.
///
/// A directory squatting on the target path is removed first.
pub fn write_with_retry(path: &Path, content: &str, policy: &RetryPolicy) -> Result<()> {
    policy.run(path, "File write", || write_atomic(path, content))
}

fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    if path.is_dir() {
        error!(path = %path.display(), "Target path is a directory. Attempting to reset.");
        fs::remove_dir_all(path)?;
    }

    let parent_dir = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "target path has no parent directory",
        )
    })?;
    fs::create_dir_all(parent_dir)?;

    let mut temp_file = NamedTempFile::new_in(parent_dir)?;
    temp_file.write_all(content.as_bytes())?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;
    temp_file.persist(path).map_err(|e| e.error)?;
    debug!(path = %path.display(), bytes = content.len(), "File written");
    Ok(())
}

/// Reads a small JSON record. `Ok(None)` when the file doesn't exist.
pub fn read_json_record<T: DeserializeOwned>(
    path: &Path,
    policy: &RetryPolicy,
) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = read_with_retry(path, policy)?;
    let record = serde_json::from_str(&content).map_err(|e| {
        PatchError::HandshakeInconsistency {
            path: path.to_path_buf(),
            details: e.to_string(),
        }
    })?;
    Ok(Some(record))
}

pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PatchError::io(
            format!("Failed to remove {}", path.display()),
            err,
        )),
    }
}
