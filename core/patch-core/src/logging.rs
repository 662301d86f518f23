//! Tracing setup shared by both binaries.
//!
//! Logs go to `<log folder>/<file name>` through a non-blocking writer. The
//! returned guard must live until the process exits or buffered lines are
//! lost. Without a log folder, output goes to stderr.

use std::env;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

pub const DEBUG_LOG_ENV_VAR: &str = "PATCH_EXT_DEBUG_LOG";

fn debug_enabled() -> bool {
    env::var(DEBUG_LOG_ENV_VAR)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

fn env_filter() -> EnvFilter {
    if debug_enabled() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

pub fn init(log_dir: Option<&Path>, file_name: &str) -> Option<WorkerGuard> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    match log_dir.filter(|dir| std::fs::create_dir_all(dir).is_ok()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = builder.with_ansi(false).with_writer(writer).try_init();
            Some(guard)
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
            None
        }
    }
}
