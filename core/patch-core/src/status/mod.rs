//! Status aggregation and persistence.
//!
//! - [`aggregator`]: the write-through [`StatusAggregator`]
//! - [`package`]: patch-id keyed package lists
//! - [`reboot`]: reboot status transition table
//! - [`summary`]: pure summary-blob derivation
//! - [`errors`]: bounded per-operation error lists

pub mod aggregator;
pub mod errors;
pub mod package;
pub mod reboot;
pub mod summary;

pub use aggregator::{
    write_top_level_status, StatusAggregator, StatusContext, TELEMETRY_NOT_COMPATIBLE_ERROR_MSG,
};
pub use errors::{codes as error_codes, ErrorLog};
pub use package::{patch_id, PackageList, PackageRecord};
pub use reboot::{is_legal_transition, RebootTransition};
pub use summary::health_store_patch_version;
