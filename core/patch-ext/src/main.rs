//! patch-ext: lifecycle wrapper for the guest patch agent.
//!
//! Invoked by the host orchestrator once per lifecycle trigger. Each
//! invocation is short-lived: it resolves which sequence the trigger belongs
//! to, decides through the handshake whether a core process must be started,
//! and exits. The core process (`patch-runner`) does the actual work.
//!
//! ## Subcommands
//!
//! - `install`: validate the handler environment and create its folders
//! - `enable`: resolve the sequence and run the handshake
//! - `disable`, `update`: acknowledge
//! - `uninstall`, `reset`: remove the handshake records

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use patch_protocol::HANDLER_ENVIRONMENT_FILE;

#[derive(Parser)]
#[command(name = "patch-ext")]
#[command(about = "Guest OS patch extension wrapper")]
#[command(version)]
struct Cli {
    /// Path to HandlerEnvironment.json
    #[arg(long, global = true, default_value = HANDLER_ENVIRONMENT_FILE)]
    handler_env: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone, Copy, Debug)]
enum Commands {
    /// Validate the handler environment and create missing folders
    Install,

    /// Start, continue or skip the core process for the current sequence
    Enable,

    /// Acknowledge a disable trigger
    Disable,

    /// Acknowledge an extension update
    Update,

    /// Remove handshake state before the extension is removed
    Uninstall,

    /// Clear handshake state so the next enable starts a new generation
    Reset,
}

fn main() {
    let cli = Cli::parse();
    let storage = commands::load_storage(&cli.handler_env);
    let _logging_guard = patch_core::logging::init(
        storage.as_ref().ok().map(|s| s.log_dir()),
        "patch-ext.log",
    );

    let storage = match storage {
        Ok(storage) => storage,
        Err(e) => {
            tracing::error!(error = %e, "patch-ext could not load handler environment");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Install => commands::install(&storage),
        Commands::Enable => commands::enable(&storage, &cli.handler_env),
        Commands::Disable => commands::acknowledge("disable"),
        Commands::Update => commands::acknowledge("update"),
        Commands::Uninstall | Commands::Reset => commands::clear_handshake(&storage),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, command = ?cli.command, "patch-ext failed");
        std::process::exit(1);
    }
}
