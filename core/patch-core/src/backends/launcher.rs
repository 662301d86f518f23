//! Detached core-process launch and the real process probe.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::info;

use super::{CoreLauncher, ProcessProbe};
use crate::error::{PatchError, Result};
use crate::process;

/// Spawns `patch-runner` in its own session so it outlives the wrapper.
#[derive(Debug, Clone)]
pub struct DetachedLauncher {
    runner_path: PathBuf,
    handler_env_path: PathBuf,
}

impl DetachedLauncher {
    pub fn new(runner_path: impl Into<PathBuf>, handler_env_path: impl Into<PathBuf>) -> Self {
        Self {
            runner_path: runner_path.into(),
            handler_env_path: handler_env_path.into(),
        }
    }

    /// Runner binary next to the current executable.
    pub fn beside_current_exe(handler_env_path: &Path) -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| PatchError::io("Failed to locate current executable", e))?;
        let dir = exe
            .parent()
            .ok_or_else(|| PatchError::Launch("executable has no parent directory".to_string()))?;
        Ok(Self::new(dir.join("patch-runner"), handler_env_path))
    }

    fn command(&self, sequence: u64) -> Command {
        let mut command = Command::new(&self.runner_path);
        command
            .arg("--handler-env")
            .arg(&self.handler_env_path)
            .arg("--sequence-number")
            .arg(sequence.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                command.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        command
    }
}

impl CoreLauncher for DetachedLauncher {
    fn launch(&self, sequence: u64) -> Result<u32> {
        if !self.runner_path.exists() {
            return Err(PatchError::Launch(format!(
                "runner binary not found: {}",
                self.runner_path.display()
            )));
        }
        let child = self
            .command(sequence)
            .spawn()
            .map_err(|e| PatchError::Launch(format!("{}: {}", self.runner_path.display(), e)))?;
        let pid = child.id();
        info!(sequence, pid, runner = %self.runner_path.display(), "Core process launched");
        Ok(pid)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessProbe;

impl ProcessProbe for SystemProcessProbe {
    fn is_alive(&self, pid: u32, expected_start: Option<u64>) -> bool {
        process::is_pid_alive_verified(pid, expected_start)
    }
}
