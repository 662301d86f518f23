//! Bounded per-operation error lists reported inside summary blobs.

use patch_protocol::{ErrorDetail, ErrorSummary};

pub const STATUS_ERROR_MSG_SIZE_LIMIT_IN_CHARACTERS: usize = 128;
pub const STATUS_ERROR_LIMIT: usize = 5;

pub mod codes {
    pub const DEFAULT_ERROR: &str = "ERROR";
    pub const PACKAGE_MANAGER_FAILURE: &str = "PACKAGE_MANAGER_FAILURE";
    pub const OPERATION_FAILED: &str = "OPERATION_FAILED";
}

/// Newest-first error details, capped at [`STATUS_ERROR_LIMIT`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorLog {
    details: Vec<ErrorDetail>,
    total: usize,
}

impl ErrorLog {
    pub fn from_summary(summary: &ErrorSummary) -> Self {
        let details: Vec<_> = summary
            .details
            .iter()
            .take(STATUS_ERROR_LIMIT)
            .cloned()
            .collect();
        let total = reported_total(&summary.message)
            .map_or(details.len(), |reported| reported.max(details.len()));
        Self { details, total }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn clear(&mut self) {
        self.details.clear();
        self.total = 0;
    }

    /// Records an error. A message identical to one already shown is skipped.
    pub fn push(&mut self, code: &str, message: &str) -> bool {
        let message = truncate(message, STATUS_ERROR_MSG_SIZE_LIMIT_IN_CHARACTERS);
        if self.details.iter().any(|d| d.message == message) {
            return false;
        }
        self.details.insert(
            0,
            ErrorDetail {
                code: code.to_string(),
                message,
            },
        );
        self.details.truncate(STATUS_ERROR_LIMIT);
        self.total += 1;
        true
    }

    pub fn to_summary(&self) -> ErrorSummary {
        if self.is_empty() {
            return ErrorSummary::default();
        }
        let mut message = format!("{} error/s reported.", self.total);
        if self.total > self.details.len() {
            message.push_str(&format!(
                " The latest {} error/s are shared in detail.",
                self.details.len()
            ));
        }
        ErrorSummary {
            code: 1,
            details: self.details.clone(),
            message,
        }
    }
}

/// The leading count of a `N error/s reported.` message.
fn reported_total(message: &str) -> Option<usize> {
    message
        .strip_suffix(" error/s reported.")
        .or_else(|| message.split_once(" error/s reported. ").map(|(count, _)| count))?
        .trim()
        .parse()
        .ok()
}

fn truncate(message: &str, limit: usize) -> String {
    if message.chars().count() <= limit {
        return message.to_string();
    }
    let cut: String = message.chars().take(limit.saturating_sub(3)).collect();
    format!("{}...", cut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_log_reports_success_code() {
        let summary = ErrorLog::default().to_summary();
        assert_eq!(summary.code, 0);
        assert!(summary.details.is_empty());
    }

    #[test]
    fn test_messages_are_truncated() {
        let mut log = ErrorLog::default();
        log.push(codes::DEFAULT_ERROR, &"x".repeat(500));
        let summary = log.to_summary();
        assert_eq!(
            summary.details[0].message.chars().count(),
            STATUS_ERROR_MSG_SIZE_LIMIT_IN_CHARACTERS
        );
        assert!(summary.details[0].message.ends_with("..."));
    }

    #[test]
    fn test_details_capped_newest_first() {
        let mut log = ErrorLog::default();
        for i in 0..8 {
            log.push(codes::DEFAULT_ERROR, &format!("error {}", i));
        }
        let summary = log.to_summary();
        assert_eq!(summary.code, 1);
        assert_eq!(summary.details.len(), STATUS_ERROR_LIMIT);
        assert_eq!(summary.details[0].message, "error 7");
        assert!(summary.message.starts_with("8 error/s reported."));
    }

    #[test]
    fn test_reload_keeps_reported_total() {
        let mut log = ErrorLog::default();
        for i in 0..7 {
            log.push(codes::DEFAULT_ERROR, &format!("error {}", i));
        }
        let persisted = log.to_summary();

        let reloaded = ErrorLog::from_summary(&persisted);
        assert_eq!(reloaded.len(), 7);
        assert_eq!(reloaded.to_summary(), persisted);
        assert_eq!(
            persisted.message,
            "7 error/s reported. The latest 5 error/s are shared in detail."
        );
    }

    #[test]
    fn test_reload_without_count_uses_details() {
        let summary = ErrorSummary {
            code: 1,
            details: vec![ErrorDetail {
                code: codes::DEFAULT_ERROR.to_string(),
                message: "boom".to_string(),
            }],
            message: "something else".to_string(),
        };
        assert_eq!(ErrorLog::from_summary(&summary).len(), 1);
    }

    #[test]
    fn test_duplicate_messages_skipped() {
        let mut log = ErrorLog::default();
        assert!(log.push(codes::DEFAULT_ERROR, "same"));
        assert!(!log.push(codes::OPERATION_FAILED, "same"));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let message = "é".repeat(200);
        let out = truncate(&message, 10);
        assert_eq!(out.chars().count(), 10);
    }
}
