//! Telemetry events dropped as JSON files into the guest agent's events folder.

use std::path::PathBuf;

use chrono::Utc;
use patch_protocol::TelemetryEvent;

use super::TelemetrySink;
use crate::error::{PatchError, Result};
use crate::fileio::{write_with_retry, RetryPolicy};
use crate::status::summary::format_timestamp;

pub const TELEMETRY_EVENT_VERSION: &str = "1.0";

pub mod event_level {
    pub const INFO: &str = "Informational";
    pub const WARNING: &str = "Warning";
    pub const ERROR: &str = "Error";
}

#[derive(Debug, Clone)]
pub struct EventsFolderSink {
    events_dir: PathBuf,
    retry: RetryPolicy,
}

impl EventsFolderSink {
    pub fn new(events_dir: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            events_dir: events_dir.into(),
            retry,
        }
    }
}

impl TelemetrySink for EventsFolderSink {
    fn emit(&self, event: &TelemetryEvent) -> Result<()> {
        let file_name = format!(
            "{}.json",
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let content = serde_json::to_string(&[event])
            .map_err(|e| PatchError::json("Failed to serialize telemetry event", e))?;
        write_with_retry(&self.events_dir.join(file_name), &content, &self.retry)
    }
}

/// Builds an event stamped with the current time and pid.
pub fn event(task_name: &str, level: &str, message: &str, operation_id: &str) -> TelemetryEvent {
    TelemetryEvent {
        version: TELEMETRY_EVENT_VERSION.to_string(),
        timestamp: format_timestamp(Utc::now()),
        task_name: task_name.to_string(),
        event_level: level.to_string(),
        message: message.to_string(),
        event_pid: std::process::id().to_string(),
        operation_id: operation_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_writes_event_file() {
        let temp = tempfile::tempdir().unwrap();
        let sink = EventsFolderSink::new(temp.path(), RetryPolicy::immediate(1));

        sink.emit(&event("Core.Assessment", event_level::INFO, "started", "act-1"))
            .unwrap();

        let files: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);
        let raw = std::fs::read_to_string(&files[0]).unwrap();
        let events: Vec<TelemetryEvent> = serde_json::from_str(&raw).unwrap();
        assert_eq!(events[0].task_name, "Core.Assessment");
        assert_eq!(events[0].operation_id, "act-1");
    }
}
