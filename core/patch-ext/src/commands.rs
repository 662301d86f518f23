//! Trigger handlers for the wrapper.
//!
//! `enable` is the only handler with real logic; everything else validates
//! folders or clears handshake state. The handlers take their collaborators
//! explicitly so tests can drive them without spawning `patch-runner`.

use std::path::Path;

use patch_core::backends::{DetachedLauncher, SystemProcessProbe};
use patch_core::status::write_top_level_status;
use patch_core::{
    load_execution_config, CoreLauncher, HandshakeCoordinator, HandshakeOutcome, HandshakeStore,
    HandshakeTimings, PatchError, ProcessProbe, RetryPolicy, SequenceResolver, StorageConfig,
};
use patch_protocol::StatusCode;
use thiserror::Error;
use tracing::{info, warn};

const UNKNOWN_OPERATION: &str = "Unknown";

#[derive(Error, Debug)]
pub enum ExtError {
    #[error("Handler environment unusable: {0}")]
    Environment(#[source] PatchError),

    #[error("Could not resolve sequence number: {0}")]
    Sequence(#[source] PatchError),

    #[error("Settings for sequence {sequence} rejected: {source}")]
    Settings {
        sequence: u64,
        #[source]
        source: PatchError,
    },

    #[error("Handshake failed: {0}")]
    Handshake(#[source] PatchError),
}

pub fn load_storage(handler_env: &Path) -> Result<StorageConfig, ExtError> {
    StorageConfig::load(handler_env).map_err(ExtError::Environment)
}

pub fn install(storage: &StorageConfig) -> Result<(), ExtError> {
    storage.ensure_dirs().map_err(ExtError::Environment)?;
    info!(
        config = %storage.config_dir().display(),
        status = %storage.status_dir().display(),
        "Handler folders ready"
    );
    Ok(())
}

pub fn enable(storage: &StorageConfig, handler_env: &Path) -> Result<(), ExtError> {
    let resolver = SequenceResolver::from_env(storage.config_dir());
    let launcher = DetachedLauncher::beside_current_exe(handler_env).map_err(ExtError::Handshake)?;
    enable_with(
        storage,
        &resolver,
        &launcher,
        &SystemProcessProbe,
        HandshakeTimings::default(),
    )
    .map(|_| ())
}

pub fn enable_with(
    storage: &StorageConfig,
    resolver: &SequenceResolver,
    launcher: &dyn CoreLauncher,
    probe: &dyn ProcessProbe,
    timings: HandshakeTimings,
) -> Result<HandshakeOutcome, ExtError> {
    let retry = RetryPolicy::default();
    let sequence = resolver.resolve(true).map_err(ExtError::Sequence)?;

    let config = match load_execution_config(&storage.settings_file(sequence), sequence, false) {
        Ok(config) => config,
        Err(source) => {
            if let Err(e) = write_top_level_status(
                &storage.status_file(sequence),
                UNKNOWN_OPERATION,
                StatusCode::Error,
                &source.to_string(),
                &retry,
            ) {
                warn!(sequence, error = %e, "Could not record settings failure in status");
            }
            return Err(ExtError::Settings { sequence, source });
        }
    };

    let store = HandshakeStore::new(storage, retry);
    let mut coordinator = HandshakeCoordinator::new(store, launcher, probe, timings);
    let outcome = coordinator
        .handle(sequence, config.operation)
        .map_err(ExtError::Handshake)?;

    match outcome {
        HandshakeOutcome::NoOperation => {
            write_top_level_status(
                &storage.status_file(sequence),
                config.operation.as_str(),
                StatusCode::Success,
                "",
                &retry,
            )
            .map_err(ExtError::Handshake)?;
        }
        HandshakeOutcome::WaitTimedOut => {
            warn!(sequence, "Core process still running; returning to host");
        }
        _ => {}
    }
    info!(sequence, ?outcome, "Enable handled");
    Ok(outcome)
}

pub fn acknowledge(trigger: &str) -> Result<(), ExtError> {
    info!(trigger, "Trigger acknowledged");
    Ok(())
}

pub fn clear_handshake(storage: &StorageConfig) -> Result<(), ExtError> {
    HandshakeStore::new(storage, RetryPolicy::default())
        .clear_all()
        .map_err(ExtError::Handshake)?;
    info!("Handshake records removed");
    Ok(())
}
