//! On-disk schemas shared by the patch extension wrapper and the core process.
//!
//! Both processes read and write the same handful of JSON documents in the
//! handler's config and status folders. Keeping the types here prevents the
//! two sides from drifting apart. Neither process owns the schema: the host
//! poller does, and these types mirror what it expects.
//!
//! Documents:
//!
//! - `<statusFolder>/<seq>.status`: an array holding exactly one [`StatusDocument`].
//!   Each substatus message is itself a serialized JSON summary blob.
//! - `<configFolder>/ExtState.json`: [`ExtStateFile`], written by the wrapper.
//! - `<configFolder>/CoreState.json`: [`CoreStateFile`], written by both sides.
//! - `<configFolder>/<seq>.settings`: [`PublicSettings`] nested under
//!   `runtimeSettings[0].handlerSettings.publicSettings`.
//! - `HandlerEnvironment.json`: [`HandlerEnvironmentFile`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const STATUS_VERSION: f64 = 1.0;
pub const STATUS_DOCUMENT_NAME: &str = "Azure Patch Management";
pub const MESSAGE_LANG: &str = "en-US";

pub const EXT_STATE_FILE: &str = "ExtState.json";
pub const CORE_STATE_FILE: &str = "CoreState.json";
pub const HANDLER_ENVIRONMENT_FILE: &str = "HandlerEnvironment.json";
pub const SETTINGS_SUFFIX: &str = ".settings";
pub const STATUS_SUFFIX: &str = ".status";

// ─────────────────────────────────────────────────────────────────────────────
// Operations
// ─────────────────────────────────────────────────────────────────────────────

/// Operations the host may request through the `operation` public setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Assessment,
    Installation,
    ConfigurePatching,
    AutoAssessment,
    NoOperation,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Assessment => "Assessment",
            Operation::Installation => "Installation",
            Operation::ConfigurePatching => "ConfigurePatching",
            Operation::AutoAssessment => "AutoAssessment",
            Operation::NoOperation => "NoOperation",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Assessment" => Ok(Operation::Assessment),
            "Installation" => Ok(Operation::Installation),
            "ConfigurePatching" => Ok(Operation::ConfigurePatching),
            "AutoAssessment" => Ok(Operation::AutoAssessment),
            "NoOperation" => Ok(Operation::NoOperation),
            other => Err(format!("unsupported operation: {}", other)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Status document
// ─────────────────────────────────────────────────────────────────────────────

/// Substatus names in canonical document order (declaration order is the order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubstatusName {
    PatchAssessmentSummary,
    PatchInstallationSummary,
    PatchMetadataForHealthStore,
    ConfigurePatchingSummary,
}

impl SubstatusName {
    pub const CANONICAL_ORDER: [SubstatusName; 4] = [
        SubstatusName::PatchAssessmentSummary,
        SubstatusName::PatchInstallationSummary,
        SubstatusName::PatchMetadataForHealthStore,
        SubstatusName::ConfigurePatchingSummary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubstatusName::PatchAssessmentSummary => "PatchAssessmentSummary",
            SubstatusName::PatchInstallationSummary => "PatchInstallationSummary",
            SubstatusName::PatchMetadataForHealthStore => "PatchMetadataForHealthStore",
            SubstatusName::ConfigurePatchingSummary => "ConfigurePatchingSummary",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        Self::CANONICAL_ORDER
            .into_iter()
            .find(|name| name.as_str() == value)
    }
}

/// Substatus and top-level status values. Serialized lowercase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCode {
    #[serde(alias = "Transitioning")]
    Transitioning,
    #[serde(alias = "Success")]
    Success,
    #[serde(alias = "Error")]
    Error,
    #[serde(alias = "Warning")]
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormattedMessage {
    pub lang: String,
    pub message: String,
}

impl FormattedMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            lang: MESSAGE_LANG.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Substatus {
    /// Kept as a string so documents carrying names we don't know still load.
    pub name: String,
    pub status: StatusCode,
    pub code: i32,
    pub formatted_message: FormattedMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopLevelStatus {
    pub name: String,
    pub operation: String,
    pub status: StatusCode,
    pub code: i32,
    pub formatted_message: FormattedMessage,
    pub substatus: Vec<Substatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDocument {
    pub version: f64,
    #[serde(rename = "timestampUTC")]
    pub timestamp_utc: String,
    pub status: TopLevelStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub message: String,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for DecodeError {}

/// Serializes a status document in its legacy array-of-one wire form.
pub fn encode_status_file(document: &StatusDocument) -> Result<String, serde_json::Error> {
    serde_json::to_string(&[document])
}

/// Parses the array-of-one wire form. Extra elements are ignored; an empty
/// array or any missing required key is a decode error.
pub fn decode_status_file(raw: &str) -> Result<StatusDocument, DecodeError> {
    let mut documents: Vec<StatusDocument> =
        serde_json::from_str(raw).map_err(|err| DecodeError {
            message: format!("status file is not a valid status array: {}", err),
        })?;
    if documents.is_empty() {
        return Err(DecodeError {
            message: "status file array is empty".to_string(),
        });
    }
    Ok(documents.swap_remove(0))
}

// ─────────────────────────────────────────────────────────────────────────────
// Summary blobs (substatus formattedMessage.message payloads)
// ─────────────────────────────────────────────────────────────────────────────

pub mod classification {
    pub const CRITICAL: &str = "Critical";
    pub const SECURITY: &str = "Security";
    pub const OTHER: &str = "Other";
    pub const UNCLASSIFIED: &str = "Unclassified";
}

pub mod package_state {
    pub const AVAILABLE: &str = "Available";
    pub const NOT_SELECTED: &str = "NotSelected";
    pub const EXCLUDED: &str = "Excluded";
    pub const PENDING: &str = "Pending";
    pub const INSTALLED: &str = "Installed";
    pub const FAILED: &str = "Failed";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RebootStatus {
    #[default]
    NotNeeded,
    Required,
    Started,
    Completed,
    Failed,
}

impl fmt::Display for RebootStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            RebootStatus::NotNeeded => "NotNeeded",
            RebootStatus::Required => "Required",
            RebootStatus::Started => "Started",
            RebootStatus::Completed => "Completed",
            RebootStatus::Failed => "Failed",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub code: i32,
    #[serde(default)]
    pub details: Vec<ErrorDetail>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentPatch {
    pub patch_id: String,
    pub name: String,
    pub version: String,
    pub classifications: Vec<String>,
    #[serde(default)]
    pub patch_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationPatch {
    pub patch_id: String,
    pub name: String,
    pub version: String,
    pub classifications: Vec<String>,
    pub patch_installation_state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentSummary {
    pub assessment_activity_id: String,
    pub reboot_pending: bool,
    pub critical_and_security_patch_count: usize,
    pub other_patch_count: usize,
    pub patches: Vec<AssessmentPatch>,
    pub start_time: String,
    pub last_modified_time: String,
    #[serde(default)]
    pub started_by: Option<String>,
    #[serde(default)]
    pub errors: ErrorSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationSummary {
    pub installation_activity_id: String,
    pub reboot_status: RebootStatus,
    pub maintenance_window_exceeded: bool,
    pub not_selected_patch_count: usize,
    pub excluded_patch_count: usize,
    pub pending_patch_count: usize,
    pub installed_patch_count: usize,
    pub failed_patch_count: usize,
    pub patches: Vec<InstallationPatch>,
    pub start_time: String,
    pub last_modified_time: String,
    #[serde(default)]
    pub maintenance_run_id: Option<String>,
    #[serde(default)]
    pub errors: ErrorSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchMetadataSummary {
    pub patch_version: String,
    pub should_report_to_health_store: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoAssessmentStatus {
    pub auto_assessment_state: String,
    #[serde(default)]
    pub errors: ErrorSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurePatchingSummary {
    pub activity_id: String,
    pub start_time: String,
    pub last_modified_time: String,
    #[serde(rename = "automaticOSPatchState")]
    pub automatic_os_patch_state: String,
    pub auto_assessment_status: AutoAssessmentStatus,
    #[serde(default)]
    pub errors: ErrorSummary,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake records
// ─────────────────────────────────────────────────────────────────────────────

/// The generation the wrapper most recently acted on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceRecord {
    #[serde(rename = "number")]
    pub sequence_number: u64,
    pub operation: String,
    #[serde(rename = "lastUpdatedUTC")]
    pub last_updated_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtStateFile {
    pub extension_sequence: SequenceRecord,
}

/// Core-process progress for one generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreStateRecord {
    #[serde(rename = "number")]
    pub sequence_number: u64,
    pub in_progress: bool,
    #[serde(default, rename = "completedUTC")]
    pub completed_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub process_id: Option<u32>,
    /// Process start time (Unix seconds) for PID identity verification.
    #[serde(default)]
    pub process_start_time: Option<u64>,
    /// Set by the wrapper when it hands the sequence to a core process that
    /// has not reported its pid yet.
    #[serde(default, rename = "launchedUTC", skip_serializing_if = "Option::is_none")]
    pub launched_utc: Option<DateTime<Utc>>,
}

impl CoreStateRecord {
    pub fn is_completed(&self) -> bool {
        !self.in_progress && self.completed_utc.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreStateFile {
    pub core_sequence: CoreStateRecord,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handler environment + settings
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerEnvironment {
    pub log_folder: String,
    pub config_folder: String,
    pub status_folder: String,
    #[serde(default)]
    pub events_folder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerEnvironmentEntry {
    pub version: f64,
    pub handler_environment: HandlerEnvironment,
}

/// `HandlerEnvironment.json` is an array; only the first entry is used.
pub type HandlerEnvironmentFile = Vec<HandlerEnvironmentEntry>;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicSettings {
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub activity_id: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub maximum_duration: Option<String>,
    #[serde(default)]
    pub reboot_setting: Option<String>,
    #[serde(default)]
    pub classifications_to_include: Vec<String>,
    #[serde(default)]
    pub patches_to_include: Vec<String>,
    #[serde(default)]
    pub patches_to_exclude: Vec<String>,
    #[serde(default)]
    pub maintenance_run_id: Option<String>,
    #[serde(default)]
    pub health_store_id: Option<String>,
    #[serde(default)]
    pub patch_mode: Option<String>,
    #[serde(default)]
    pub assessment_mode: Option<String>,
    #[serde(default)]
    pub maximum_assessment_interval: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Telemetry
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TelemetryEvent {
    pub version: String,
    pub timestamp: String,
    pub task_name: String,
    pub event_level: String,
    pub message: String,
    pub event_pid: String,
    pub operation_id: String,
}
