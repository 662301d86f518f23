//! The status aggregator: in-memory view of one status document plus
//! write-through persistence.
//!
//! On construction the previously persisted document is parsed back into
//! package lists, reboot state and the maintenance-window flag. Substatuses
//! that the current run never touches are carried over verbatim. Every
//! mutating call re-derives the affected substatus and rewrites the whole
//! document atomically.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use patch_protocol::{
    classification, decode_status_file, encode_status_file, AssessmentSummary,
    AutoAssessmentStatus, ConfigurePatchingSummary, FormattedMessage, InstallationSummary,
    Operation, PatchMetadataSummary, RebootStatus, StatusCode, StatusDocument, Substatus,
    SubstatusName, TopLevelStatus, STATUS_DOCUMENT_NAME, STATUS_VERSION,
};
use tracing::{debug, error, info, warn};

use crate::backends::RebootProbe;
use crate::error::{PatchError, Result};
use crate::fileio::{read_with_retry, write_with_retry, RetryPolicy};

use super::errors::{codes, ErrorLog};
use super::package::{patch_id, PackageList, PackageRecord};
use super::reboot::{is_legal_transition, RebootTransition};
use super::summary::{
    assessment_summary, format_timestamp, installation_summary, InstallationInputs,
    SummaryContext,
};

pub const TELEMETRY_NOT_COMPATIBLE_ERROR_MSG: &str =
    "Unsupported older Azure Linux Agent version. To resolve: http://aka.ms/UpdateLinuxAgent";

const STARTED_BY_PLATFORM: &str = "Platform";
const STARTED_BY_USER: &str = "User";

/// Everything the aggregator needs to know about the current run.
#[derive(Debug, Clone)]
pub struct StatusContext {
    pub status_file: PathBuf,
    pub operation: Operation,
    pub activity_id: String,
    pub start_time: String,
    pub maintenance_run_id: Option<String>,
    /// `<os name>_<os version>`, the tail of every patch id.
    pub os_identity: String,
    pub telemetry_available: bool,
    pub retry: RetryPolicy,
}

impl StatusContext {
    pub fn new(
        status_file: PathBuf,
        operation: Operation,
        activity_id: impl Into<String>,
        start_time: impl Into<String>,
    ) -> Self {
        Self {
            status_file,
            operation,
            activity_id: activity_id.into(),
            start_time: start_time.into(),
            maintenance_run_id: None,
            os_identity: crate::platform::UNKNOWN_OS_IDENTITY.to_string(),
            telemetry_available: true,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct StatusAggregator<'a> {
    ctx: StatusContext,
    reboot_probe: &'a dyn RebootProbe,
    top_level_operation: String,
    top_level_message: String,
    substatuses: BTreeMap<SubstatusName, Substatus>,
    assessment_packages: PackageList,
    installation_packages: PackageList,
    reboot_status: RebootStatus,
    maintenance_window_exceeded: bool,
    errors: BTreeMap<SubstatusName, ErrorLog>,
}

impl<'a> StatusAggregator<'a> {
    fn fresh(ctx: StatusContext, reboot_probe: &'a dyn RebootProbe) -> Self {
        let top_level_operation = ctx.operation.as_str().to_string();
        Self {
            ctx,
            reboot_probe,
            top_level_operation,
            top_level_message: String::new(),
            substatuses: BTreeMap::new(),
            assessment_packages: PackageList::new(),
            installation_packages: PackageList::new(),
            reboot_status: RebootStatus::NotNeeded,
            maintenance_window_exceeded: false,
            errors: BTreeMap::new(),
        }
    }

    /// Loads the persisted document for this run, writing a default one when
    /// none exists and resetting it when it's structurally broken.
    ///
    /// A read that keeps failing after retries is returned as
    /// [`PatchError::TransientIo`].
    pub fn load(ctx: StatusContext, reboot_probe: &'a dyn RebootProbe) -> Result<Self> {
        let path = ctx.status_file.clone();
        let mut aggregator = Self::fresh(ctx.clone(), reboot_probe);

        if !path.exists() {
            info!(path = %path.display(), "No status file found, writing default document");
            aggregator.write_status_file()?;
            return Ok(aggregator);
        }

        let restored = if path.is_dir() {
            Err(PatchError::CorruptDocument(
                "status path is a directory".to_string(),
            ))
        } else {
            let raw = read_with_retry(&path, &aggregator.ctx.retry)?;
            aggregator.restore(&raw)
        };

        if let Err(err) = restored {
            error!(
                path = %path.display(),
                error = %err,
                "Malformed status file. Resetting status file for safety."
            );
            aggregator = Self::fresh(ctx, reboot_probe);
            aggregator.write_status_file()?;
            return Ok(aggregator);
        }

        debug!(
            path = %path.display(),
            assessment_packages = aggregator.assessment_packages.len(),
            installation_packages = aggregator.installation_packages.len(),
            reboot_status = %aggregator.reboot_status,
            "Status file loaded"
        );

        if aggregator.reboot_status == RebootStatus::Started {
            info!("Machine restarted after a reboot started by the agent");
            aggregator.set_installation_reboot_status(RebootStatus::Completed)?;
        }
        Ok(aggregator)
    }

    fn restore(&mut self, raw: &str) -> Result<()> {
        let document =
            decode_status_file(raw).map_err(|e| PatchError::CorruptDocument(e.message))?;

        if self.ctx.operation == Operation::AutoAssessment {
            self.top_level_operation = document.status.operation.clone();
        }
        self.top_level_message = document.status.formatted_message.message.clone();

        for substatus in document.status.substatus {
            let Some(name) = SubstatusName::from_wire(&substatus.name) else {
                warn!(name = %substatus.name, "Dropping unknown substatus");
                continue;
            };
            let blob = substatus.formatted_message.message.as_str();
            let corrupt = |e: serde_json::Error| {
                PatchError::CorruptDocument(format!("{}: {}", name.as_str(), e))
            };
            match name {
                SubstatusName::PatchAssessmentSummary => {
                    let summary: AssessmentSummary = serde_json::from_str(blob).map_err(corrupt)?;
                    self.errors
                        .insert(name, ErrorLog::from_summary(&summary.errors));
                    self.assessment_packages = summary
                        .patches
                        .into_iter()
                        .map(PackageRecord::from)
                        .collect();
                }
                SubstatusName::PatchInstallationSummary => {
                    let summary: InstallationSummary =
                        serde_json::from_str(blob).map_err(corrupt)?;
                    self.errors
                        .insert(name, ErrorLog::from_summary(&summary.errors));
                    self.reboot_status = summary.reboot_status;
                    self.maintenance_window_exceeded = summary.maintenance_window_exceeded;
                    self.installation_packages = summary
                        .patches
                        .into_iter()
                        .map(PackageRecord::from)
                        .collect();
                }
                SubstatusName::PatchMetadataForHealthStore => {
                    serde_json::from_str::<PatchMetadataSummary>(blob).map_err(corrupt)?;
                }
                SubstatusName::ConfigurePatchingSummary => {
                    let summary: ConfigurePatchingSummary =
                        serde_json::from_str(blob).map_err(corrupt)?;
                    self.errors
                        .insert(name, ErrorLog::from_summary(&summary.errors));
                }
            }
            self.substatuses.insert(name, substatus);
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Package lists
    // ─────────────────────────────────────────────────────────────────────

    /// Clears the in-memory assessment list. Nothing is written until the
    /// next substatus update.
    pub fn reset_assessment_data(&mut self) {
        self.assessment_packages.clear();
    }

    pub fn set_package_assessment_status<S: AsRef<str>>(
        &mut self,
        names: &[S],
        versions: &[S],
        classification: &str,
        state: &str,
    ) -> Result<()> {
        warn_on_length_mismatch(names.len(), versions.len());
        for (name, version) in names.iter().zip(versions) {
            let (name, version) = (name.as_ref(), version.as_ref());
            self.assessment_packages.insert(PackageRecord {
                patch_id: patch_id(name, version, &self.ctx.os_identity),
                name: name.to_string(),
                version: version.to_string(),
                classifications: vec![classification.to_string()],
                state: state.to_string(),
            });
        }
        self.set_assessment_substatus_json(StatusCode::Transitioning, 0)
    }

    pub fn set_package_install_status<S: AsRef<str>>(
        &mut self,
        names: &[S],
        versions: &[S],
        state: &str,
        classification: Option<&str>,
    ) -> Result<()> {
        warn_on_length_mismatch(names.len(), versions.len());
        for (name, version) in names.iter().zip(versions) {
            let (name, version) = (name.as_ref(), version.as_ref());
            let id = patch_id(name, version, &self.ctx.os_identity);
            if let Some(existing) = self.installation_packages.get_mut(&id) {
                existing.state = state.to_string();
                if let Some(classification) = classification {
                    existing.classifications = vec![classification.to_string()];
                }
                continue;
            }
            self.installation_packages.insert(PackageRecord {
                patch_id: id,
                name: name.to_string(),
                version: version.to_string(),
                classifications: vec![classification
                    .unwrap_or(classification::OTHER)
                    .to_string()],
                state: state.to_string(),
            });
        }
        self.set_installation_substatus_json(StatusCode::Transitioning, 0)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Installation flags
    // ─────────────────────────────────────────────────────────────────────

    /// Applies a reboot status change if the transition table allows it.
    /// Rejected changes are logged and nothing is written.
    pub fn set_installation_reboot_status(
        &mut self,
        requested: RebootStatus,
    ) -> Result<RebootTransition> {
        if !is_legal_transition(self.reboot_status, requested) {
            let err = PatchError::InvalidTransition {
                current: self.reboot_status.to_string(),
                requested: requested.to_string(),
            };
            error!(error = %err, "Reboot status change rejected");
            return Ok(RebootTransition::Rejected);
        }
        info!(from = %self.reboot_status, to = %requested, "Reboot status updated");
        self.reboot_status = requested;
        self.refresh_substatus(SubstatusName::PatchInstallationSummary)?;
        Ok(RebootTransition::Applied)
    }

    pub fn set_maintenance_window_exceeded(&mut self, exceeded: bool) -> Result<()> {
        self.maintenance_window_exceeded = exceeded;
        self.refresh_substatus(SubstatusName::PatchInstallationSummary)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Substatus writers
    // ─────────────────────────────────────────────────────────────────────

    pub fn set_assessment_substatus_json(&mut self, status: StatusCode, code: i32) -> Result<()> {
        let name = SubstatusName::PatchAssessmentSummary;
        let (status, code) = self.telemetry_guard(name, status, code);
        let started_by = if self.ctx.operation == Operation::AutoAssessment {
            STARTED_BY_PLATFORM
        } else {
            STARTED_BY_USER
        };
        let summary = assessment_summary(
            &self.summary_context(Utc::now()),
            &self.assessment_packages,
            self.reboot_probe.is_reboot_pending(),
            self.errors.get(&name).unwrap_or(&ErrorLog::default()),
            Some(started_by.to_string()),
        );
        self.write_substatus(name, status, code, &summary)
    }

    pub fn set_installation_substatus_json(
        &mut self,
        status: StatusCode,
        code: i32,
    ) -> Result<()> {
        let name = SubstatusName::PatchInstallationSummary;
        let (status, code) = self.telemetry_guard(name, status, code);
        self.refresh_reboot_status_from_machine();
        let empty = ErrorLog::default();
        let summary = installation_summary(
            &self.summary_context(Utc::now()),
            InstallationInputs {
                packages: &self.installation_packages,
                reboot_status: self.reboot_status,
                maintenance_window_exceeded: self.maintenance_window_exceeded,
                maintenance_run_id: self.ctx.maintenance_run_id.clone(),
                errors: self.errors.get(&name).unwrap_or(&empty),
            },
        );
        self.write_substatus(name, status, code, &summary)
    }

    pub fn set_patch_metadata_for_healthstore_substatus(
        &mut self,
        patch_version: &str,
        should_report_to_health_store: bool,
        status: StatusCode,
        code: i32,
    ) -> Result<()> {
        let name = SubstatusName::PatchMetadataForHealthStore;
        let (status, code) = self.telemetry_guard(name, status, code);
        let summary = PatchMetadataSummary {
            patch_version: patch_version.to_string(),
            should_report_to_health_store,
        };
        self.write_substatus(name, status, code, &summary)
    }

    pub fn set_configure_patching_substatus(
        &mut self,
        automatic_os_patch_state: &str,
        auto_assessment_state: &str,
        status: StatusCode,
        code: i32,
    ) -> Result<()> {
        let name = SubstatusName::ConfigurePatchingSummary;
        let (status, code) = self.telemetry_guard(name, status, code);
        let errors = self
            .errors
            .get(&name)
            .map(ErrorLog::to_summary)
            .unwrap_or_default();
        let summary = ConfigurePatchingSummary {
            activity_id: self.ctx.activity_id.clone(),
            start_time: self.ctx.start_time.clone(),
            last_modified_time: format_timestamp(Utc::now()),
            automatic_os_patch_state: automatic_os_patch_state.to_string(),
            auto_assessment_status: AutoAssessmentStatus {
                auto_assessment_state: auto_assessment_state.to_string(),
                errors: errors.clone(),
            },
            errors,
        };
        self.write_substatus(name, status, code, &summary)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Errors
    // ─────────────────────────────────────────────────────────────────────

    /// Records an error against an operation's summary and rewrites it.
    pub fn add_error(&mut self, name: SubstatusName, code: &str, message: &str) -> Result<()> {
        if name == SubstatusName::PatchMetadataForHealthStore {
            warn!(message, "Health store metadata carries no error list");
            return Ok(());
        }
        if !self.errors.entry(name).or_default().push(code, message) {
            return Ok(());
        }
        warn!(substatus = name.as_str(), code, message, "Error recorded");
        if self.substatuses.contains_key(&name) {
            self.refresh_substatus(name)?;
        }
        Ok(())
    }

    /// Drops errors collected for an operation. Called when a fresh run of
    /// that operation begins.
    pub fn clear_errors(&mut self, name: SubstatusName) {
        self.errors.remove(&name);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────

    pub fn context(&self) -> &StatusContext {
        &self.ctx
    }

    pub fn assessment_packages(&self) -> &PackageList {
        &self.assessment_packages
    }

    pub fn installation_packages(&self) -> &PackageList {
        &self.installation_packages
    }

    pub fn reboot_status(&self) -> RebootStatus {
        self.reboot_status
    }

    pub fn maintenance_window_exceeded(&self) -> bool {
        self.maintenance_window_exceeded
    }

    pub fn substatus(&self, name: SubstatusName) -> Option<&Substatus> {
        self.substatuses.get(&name)
    }

    pub fn errors(&self, name: SubstatusName) -> Option<&ErrorLog> {
        self.errors.get(&name)
    }

    pub fn document(&self, now: DateTime<Utc>) -> StatusDocument {
        StatusDocument {
            version: STATUS_VERSION,
            timestamp_utc: format_timestamp(now),
            status: TopLevelStatus {
                name: STATUS_DOCUMENT_NAME.to_string(),
                operation: self.top_level_operation.clone(),
                status: StatusCode::Success,
                code: 0,
                formatted_message: FormattedMessage::new(self.top_level_message.clone()),
                substatus: self.substatuses.values().cloned().collect(),
            },
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────

    fn summary_context(&self, now: DateTime<Utc>) -> SummaryContext<'_> {
        SummaryContext {
            activity_id: &self.ctx.activity_id,
            start_time: &self.ctx.start_time,
            now,
        }
    }

    /// Without a telemetry sink every substatus is reported as an error.
    fn telemetry_guard(
        &mut self,
        name: SubstatusName,
        status: StatusCode,
        code: i32,
    ) -> (StatusCode, i32) {
        if self.ctx.telemetry_available {
            return (status, code);
        }
        if name != SubstatusName::PatchMetadataForHealthStore {
            self.errors
                .entry(name)
                .or_default()
                .push(codes::DEFAULT_ERROR, TELEMETRY_NOT_COMPATIBLE_ERROR_MSG);
        }
        (StatusCode::Error, 1)
    }

    fn refresh_reboot_status_from_machine(&mut self) {
        if matches!(
            self.reboot_status,
            RebootStatus::NotNeeded | RebootStatus::Completed
        ) && self.reboot_probe.is_reboot_pending()
        {
            info!(from = %self.reboot_status, "Machine reports a pending reboot");
            self.reboot_status = RebootStatus::Required;
        }
    }

    /// Re-derives a substatus keeping its current status and code.
    fn refresh_substatus(&mut self, name: SubstatusName) -> Result<()> {
        let (status, code) = self
            .substatuses
            .get(&name)
            .map(|s| (s.status, s.code))
            .unwrap_or((StatusCode::Transitioning, 0));
        match name {
            SubstatusName::PatchAssessmentSummary => {
                self.set_assessment_substatus_json(status, code)
            }
            SubstatusName::PatchInstallationSummary => {
                self.set_installation_substatus_json(status, code)
            }
            SubstatusName::ConfigurePatchingSummary => {
                let blob = self.substatuses.get(&name).and_then(|s| {
                    serde_json::from_str::<ConfigurePatchingSummary>(&s.formatted_message.message)
                        .ok()
                });
                let (os_state, assessment_state) = blob
                    .map(|b| {
                        (
                            b.automatic_os_patch_state,
                            b.auto_assessment_status.auto_assessment_state,
                        )
                    })
                    .unwrap_or_else(|| ("Unknown".to_string(), "Unknown".to_string()));
                self.set_configure_patching_substatus(&os_state, &assessment_state, status, code)
            }
            SubstatusName::PatchMetadataForHealthStore => self.write_status_file(),
        }
    }

    fn write_substatus<T: serde::Serialize>(
        &mut self,
        name: SubstatusName,
        status: StatusCode,
        code: i32,
        summary: &T,
    ) -> Result<()> {
        let message = serde_json::to_string(summary)
            .map_err(|e| PatchError::json(format!("Failed to serialize {}", name.as_str()), e))?;
        self.substatuses.insert(
            name,
            Substatus {
                name: name.as_str().to_string(),
                status,
                code,
                formatted_message: FormattedMessage::new(message),
            },
        );
        self.write_status_file()
    }

    fn write_status_file(&self) -> Result<()> {
        let document = self.document(Utc::now());
        let content = encode_status_file(&document)
            .map_err(|e| PatchError::json("Failed to serialize status document", e))?;
        write_with_retry(&self.ctx.status_file, &content, &self.ctx.retry)
    }
}

/// Writes a document with only a top-level status. The wrapper uses this
/// for sequences that never reach the core process.
pub fn write_top_level_status(
    path: &std::path::Path,
    operation: &str,
    status: StatusCode,
    message: &str,
    retry: &RetryPolicy,
) -> Result<()> {
    let document = StatusDocument {
        version: STATUS_VERSION,
        timestamp_utc: format_timestamp(Utc::now()),
        status: TopLevelStatus {
            name: STATUS_DOCUMENT_NAME.to_string(),
            operation: operation.to_string(),
            status,
            code: if status == StatusCode::Error { 1 } else { 0 },
            formatted_message: FormattedMessage::new(message),
            substatus: Vec::new(),
        },
    };
    let content = encode_status_file(&document)
        .map_err(|e| PatchError::json("Failed to serialize status document", e))?;
    write_with_retry(path, &content, retry)
}

fn warn_on_length_mismatch(names: usize, versions: usize) {
    if names != versions {
        warn!(names, versions, "Package names and versions differ in length");
    }
}
