//! Process identity checks for the handshake.
//!
//! A pid alone is not proof that the core process is still running: after a
//! reboot the same pid may belong to something else. When a start time was
//! recorded alongside the pid, it must match within a small tolerance.

use sysinfo::{Pid, ProcessRefreshKind, System};

const START_TIME_TOLERANCE_SECS: u64 = 2;

pub fn is_pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Start time of a process (Unix seconds), or None if it doesn't exist.
pub fn get_process_start_time(pid: u32) -> Option<u64> {
    let mut sys = System::new();
    let sys_pid = Pid::from(pid as usize);
    sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    sys.process(sys_pid).map(|process| process.start_time())
}

/// Alive and, when `expected_start` is known, the same process that was recorded.
pub fn is_pid_alive_verified(pid: u32, expected_start: Option<u64>) -> bool {
    if !is_pid_alive(pid) {
        return false;
    }
    let Some(expected_start) = expected_start else {
        return true;
    };
    match get_process_start_time(pid) {
        Some(actual_start) => actual_start.abs_diff(expected_start) <= START_TIME_TOLERANCE_SECS,
        None => false,
    }
}

/// Pid and start time of the running process.
pub fn current_process_identity() -> (u32, Option<u64>) {
    let pid = std::process::id();
    (pid, get_process_start_time(pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        let (pid, start) = current_process_identity();
        assert!(is_pid_alive(pid));
        assert!(is_pid_alive_verified(pid, start));
    }

    #[test]
    fn test_start_time_mismatch_is_not_alive() {
        let (pid, start) = current_process_identity();
        let wrong = start.unwrap_or(0) + 3600;
        assert!(!is_pid_alive_verified(pid, Some(wrong)));
    }

    #[test]
    fn test_unused_pid_is_not_alive() {
        // Above the default pid_max on Linux.
        assert!(!is_pid_alive(4_000_000));
    }
}
