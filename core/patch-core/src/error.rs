//! Error types for patch-core operations.
//!
//! Callers distinguish recoverable from fatal outcomes by variant, never by
//! message text. Several classes never leave the engine that detects them:
//! a corrupt status document is reset, an illegal reboot transition is a
//! logged no-op, and unreadable handshake records are treated as absent.

use std::path::PathBuf;

// ═══════════════════════════════════════════════════════════════════════════════
// Maintenance Window Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error("Invalid duration format: {0}")]
    Format(String),

    #[error("Invalid start time: {0}")]
    StartTime(String),

    #[error("Maintenance window duration is zero")]
    DivideByZero,

    #[error("Current time {now} is earlier than window start {start}")]
    NegativeElapsed { start: String, now: String },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("File operation failed after {attempts} attempts: {path}: {source}")]
    TransientIo {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Document / State Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Status document is corrupt: {0}")]
    CorruptDocument(String),

    #[error("Invalid reboot status transition: {current} -> {requested}")]
    InvalidTransition { current: String, requested: String },

    #[error("Handshake record unreadable: {path}: {details}")]
    HandshakeInconsistency { path: PathBuf, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid settings in {path}: missing or malformed {}", .fields.join(", "))]
    ConfigValidation { path: PathBuf, fields: Vec<String> },

    #[error("Sequence number could not be resolved")]
    SequenceUnresolved,

    #[error("Maintenance window: {0}")]
    Window(#[from] WindowError),

    // ─────────────────────────────────────────────────────────────────────
    // Collaborator Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Failed to launch core process: {0}")]
    Launch(String),

    #[error("Package manager failure: {0}")]
    Backend(String),
}

impl PatchError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PatchError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        PatchError::Json {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using PatchError.
pub type Result<T> = std::result::Result<T, PatchError>;

impl From<PatchError> for String {
    fn from(err: PatchError) -> String {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation_lists_every_field() {
        let err = PatchError::ConfigValidation {
            path: PathBuf::from("/cfg/3.settings"),
            fields: vec!["operation".to_string(), "startTime".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("operation, startTime"));
        assert!(message.contains("3.settings"));
    }

    #[test]
    fn test_window_error_converts() {
        let err: PatchError = WindowError::DivideByZero.into();
        assert!(matches!(err, PatchError::Window(WindowError::DivideByZero)));
    }
}
