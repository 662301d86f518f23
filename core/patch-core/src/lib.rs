//! # patch-core
//!
//! Engine library shared by the `patch-ext` wrapper and the `patch-runner`
//! core process of the guest patch agent.
//!
//! ## Design Principles
//!
//! - **Synchronous**: no async runtime. Each process is single-threaded.
//! - **Filesystem is the only shared state**: the status document and the two
//!   handshake records are replaced atomically, never edited in place.
//! - **Explicit configuration**: `StorageConfig`, `ExecutionConfig`,
//!   `RetryPolicy` and `HandshakeTimings` are passed to constructors. Nothing
//!   reads process-wide mutable state.
//! - **Typed failures**: callers branch on `PatchError` variants. Corrupt
//!   documents, illegal reboot transitions and unreadable handshake records
//!   are handled where they're detected.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use patch_core::{StatusAggregator, StatusContext, StaticRebootProbe};
//!
//! let probe = StaticRebootProbe(false);
//! let mut status = StatusAggregator::load(ctx, &probe)?;
//! status.set_package_assessment_status(&["curl"], &["7.81"], "Security", "Available")?;
//! ```

pub mod backends;
pub mod error;
pub mod fileio;
pub mod handshake;
pub mod logging;
pub mod platform;
pub mod process;
pub mod runner;
pub mod sequence;
pub mod settings;
pub mod status;
pub mod storage;
pub mod window;

pub use backends::{
    AvailablePackage, CoreLauncher, InstallOutcome, PackageManager, ProcessProbe, RebootProbe,
    StaticRebootProbe, TelemetrySink,
};
pub use error::{PatchError, Result, WindowError};
pub use fileio::RetryPolicy;
pub use handshake::{HandshakeCoordinator, HandshakeOutcome, HandshakePhase, HandshakeStore, HandshakeTimings};
pub use runner::OperationRunner;
pub use sequence::SequenceResolver;
pub use settings::{load_execution_config, ExecutionConfig, RebootSetting};
pub use status::{RebootTransition, StatusAggregator, StatusContext};
pub use storage::StorageConfig;
pub use window::MaintenanceWindow;
