//! Collaborators the engines talk to through narrow traits.
//!
//! Production implementations live in the submodules; tests substitute fakes.

pub mod apt;
pub mod launcher;
pub mod telemetry;

use patch_protocol::TelemetryEvent;

use crate::error::Result;

pub use apt::AptPackageManager;
pub use launcher::{DetachedLauncher, SystemProcessProbe};
pub use telemetry::EventsFolderSink;

/// The only package-manager question the status aggregator asks.
pub trait RebootProbe {
    fn is_reboot_pending(&self) -> bool;
}

/// Fixed answer. Used where no package manager is available (the wrapper).
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticRebootProbe(pub bool);

impl RebootProbe for StaticRebootProbe {
    fn is_reboot_pending(&self) -> bool {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailablePackage {
    pub name: String,
    pub version: String,
    pub classification: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    Failed,
}

pub trait PackageManager: RebootProbe {
    fn available_updates(&self) -> Result<Vec<AvailablePackage>>;
    fn install(&self, package: &AvailablePackage) -> Result<InstallOutcome>;
    fn request_reboot(&self) -> Result<()>;
    /// `Enabled`, `Disabled` or `Unknown`.
    fn automatic_os_patch_state(&self) -> Result<String>;
    fn disable_automatic_os_patching(&self) -> Result<()>;
}

pub trait TelemetrySink {
    fn emit(&self, event: &TelemetryEvent) -> Result<()>;
}

/// Starts the core process for a sequence without waiting on it.
pub trait CoreLauncher {
    fn launch(&self, sequence: u64) -> Result<u32>;
}

pub trait ProcessProbe {
    fn is_alive(&self, pid: u32, expected_start: Option<u64>) -> bool;
}
