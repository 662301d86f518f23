//! Installation reboot status transitions.
//!
//! ```text
//! requested    allowed from
//! NotNeeded    NotNeeded
//! Required     NotNeeded | Required | Completed
//! Started      NotNeeded | Required | Started
//! Failed       Started | Failed
//! Completed    Started | Completed
//! ```
//!
//! Once the state leaves NotNeeded it never returns there.

use patch_protocol::RebootStatus;

pub fn is_legal_transition(current: RebootStatus, requested: RebootStatus) -> bool {
    use RebootStatus::*;
    match requested {
        NotNeeded => current == NotNeeded,
        Required => matches!(current, NotNeeded | Required | Completed),
        Started => matches!(current, NotNeeded | Required | Started),
        Failed => matches!(current, Started | Failed),
        Completed => matches!(current, Started | Completed),
    }
}

/// Outcome of a requested reboot status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootTransition {
    Applied,
    Rejected,
}
