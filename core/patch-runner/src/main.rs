//! patch-runner: core process of the guest patch agent.
//!
//! Spawned detached by `patch-ext enable`. Runs exactly one operation for one
//! sequence, keeps the status document current while it works, and marks the
//! core-state record completed before exiting so the wrapper stops waiting.

use std::path::PathBuf;

use chrono::Utc;
use clap::Parser;
use patch_core::backends::{AptPackageManager, EventsFolderSink};
use patch_core::{
    load_execution_config, HandshakeStore, OperationRunner, RetryPolicy, StorageConfig,
    TelemetrySink,
};

#[derive(Parser)]
#[command(name = "patch-runner")]
#[command(about = "Runs one patch operation for one sequence")]
#[command(version)]
struct Args {
    /// Path to HandlerEnvironment.json
    #[arg(long)]
    handler_env: PathBuf,

    /// Sequence whose settings file drives this run
    #[arg(long)]
    sequence_number: u64,

    /// Run an auto-assessment regardless of the requested operation
    #[arg(long)]
    auto_assess_only: bool,
}

fn main() {
    let args = Args::parse();

    let storage = match StorageConfig::load(&args.handler_env) {
        Ok(storage) => storage,
        Err(e) => {
            let _logging_guard = patch_core::logging::init(None, "patch-runner.log");
            tracing::error!(error = %e, "patch-runner could not load handler environment");
            std::process::exit(1);
        }
    };
    let _logging_guard = patch_core::logging::init(Some(storage.log_dir()), "patch-runner.log");

    let sequence = args.sequence_number;
    let config = match load_execution_config(
        &storage.settings_file(sequence),
        sequence,
        args.auto_assess_only,
    ) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(sequence, error = %e, "patch-runner settings rejected");
            let store = HandshakeStore::new(&storage, RetryPolicy::default());
            if let Err(e) = store.mark_core_completed(sequence, Utc::now()) {
                tracing::warn!(sequence, error = %e, "Could not mark core state completed");
            }
            std::process::exit(1);
        }
    };

    let package_manager = AptPackageManager::default();
    let sink = storage
        .events_dir()
        .map(|dir| EventsFolderSink::new(dir, RetryPolicy::default()));
    let telemetry = sink.as_ref().map(|s| s as &dyn TelemetrySink);

    let runner = OperationRunner::new(&config, &storage, &package_manager, telemetry);
    if let Err(e) = runner.run() {
        tracing::error!(sequence, operation = %config.operation, error = %e, "patch-runner failed");
        std::process::exit(1);
    }
}
