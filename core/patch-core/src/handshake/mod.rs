//! Cross-process handshake between the wrapper and the core process.

pub mod coordinator;
pub mod records;

pub use coordinator::{HandshakeCoordinator, HandshakeOutcome, HandshakePhase, HandshakeTimings};
pub use records::HandshakeStore;
