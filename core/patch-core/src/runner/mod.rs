//! The core process's work for one sequence.
//!
//! The runner owns the core side of the handshake: the core-state record is
//! marked in progress before any work starts and completed afterwards, even
//! when the operation fails. User-visible failures end up as Error
//! substatuses; only I/O that exhausts its retries is returned as an error.

pub mod selection;

use chrono::Utc;
use patch_protocol::{package_state, Operation, RebootStatus, StatusCode, SubstatusName};
use tracing::{error, info, warn};

use crate::backends::telemetry::{self, event_level};
use crate::backends::{AvailablePackage, InstallOutcome, PackageManager, TelemetrySink};
use crate::error::Result;
use crate::fileio::RetryPolicy;
use crate::handshake::HandshakeStore;
use crate::platform;
use crate::process;
use crate::settings::{ExecutionConfig, RebootSetting};
use crate::status::{
    error_codes, health_store_patch_version, RebootTransition, StatusAggregator, StatusContext,
};
use crate::storage::StorageConfig;
use crate::window::MaintenanceWindow;

use selection::PackageSelector;

pub const PATCH_VERSION_UNKNOWN: &str = "UNKNOWN";
pub const INSTALLATION_FAILED_DUE_TO_ASSESSMENT: &str = "Installation failed due to assessment failure. Please refer the error details in assessment substatus";

/// Health store patch version: health store id first, then maintenance run
/// id. Date-shaped ids become `YYYY.MM.DD`; anything else is used as is.
pub fn patch_version(config: &ExecutionConfig) -> String {
    match config
        .health_store_id
        .as_deref()
        .or(config.maintenance_run_id.as_deref())
    {
        Some(id) => health_store_patch_version(id).unwrap_or_else(|| id.to_string()),
        None => PATCH_VERSION_UNKNOWN.to_string(),
    }
}

pub struct OperationRunner<'a, P: PackageManager> {
    config: &'a ExecutionConfig,
    storage: &'a StorageConfig,
    package_manager: &'a P,
    telemetry: Option<&'a dyn TelemetrySink>,
    retry: RetryPolicy,
    os_identity: String,
}

impl<'a, P: PackageManager> OperationRunner<'a, P> {
    pub fn new(
        config: &'a ExecutionConfig,
        storage: &'a StorageConfig,
        package_manager: &'a P,
        telemetry: Option<&'a dyn TelemetrySink>,
    ) -> Self {
        Self {
            config,
            storage,
            package_manager,
            telemetry,
            retry: RetryPolicy::default(),
            os_identity: platform::os_identity(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_os_identity(mut self, os_identity: impl Into<String>) -> Self {
        self.os_identity = os_identity.into();
        self
    }

    pub fn run(&self) -> Result<()> {
        let sequence = self.config.sequence;
        let store = HandshakeStore::new(self.storage, self.retry);
        let (pid, start_time) = process::current_process_identity();
        store.mark_core_in_progress(sequence, Some(pid), start_time)?;
        info!(sequence, operation = %self.config.operation, pid, "Core operation started");
        self.emit(event_level::INFO, "Operation started");

        let result = self.execute();
        if let Err(err) = &result {
            error!(sequence, error = %err, "Core operation failed");
            self.emit(event_level::ERROR, &err.to_string());
        }

        store.mark_core_completed(sequence, Utc::now())?;
        info!(sequence, "Core operation completed");
        self.emit(event_level::INFO, "Operation completed");
        result
    }

    fn execute(&self) -> Result<()> {
        let mut ctx = StatusContext::new(
            self.storage.status_file(self.config.sequence),
            self.config.operation,
            self.config.activity_id.clone(),
            self.config.start_time.clone(),
        );
        ctx.maintenance_run_id = self.config.maintenance_run_id.clone();
        ctx.os_identity = self.os_identity.clone();
        ctx.telemetry_available = self.telemetry.is_some();
        ctx.retry = self.retry;
        if !ctx.telemetry_available {
            warn!("No telemetry sink available; substatuses will report the agent as unsupported");
        }

        let mut status = StatusAggregator::load(ctx, self.package_manager)?;

        let mut installed_any = false;
        match self.config.operation {
            Operation::Assessment | Operation::AutoAssessment => {
                self.assess(&mut status)?;
            }
            Operation::Installation => {
                let succeeded = match self.assess(&mut status)? {
                    Some(packages) => {
                        let (succeeded, installed) = self.install(&mut status, &packages)?;
                        installed_any = installed > 0;
                        succeeded
                    }
                    None => {
                        self.fail_installation_after_assessment(&mut status)?;
                        false
                    }
                };
                self.report_health_store(&mut status, succeeded)?;
            }
            Operation::ConfigurePatching => {}
            Operation::NoOperation => info!("Nothing to do for a no-op sequence"),
        }

        if self.config.operation != Operation::AutoAssessment {
            self.configure_patching(&mut status)?;
        }
        if self.config.operation == Operation::Installation {
            self.handle_reboot(&mut status, installed_any)?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Assessment
    // ─────────────────────────────────────────────────────────────────────

    /// Available packages on success, `None` when the package manager failed.
    fn assess(&self, status: &mut StatusAggregator<'_>) -> Result<Option<Vec<AvailablePackage>>> {
        let name = SubstatusName::PatchAssessmentSummary;
        status.clear_errors(name);
        status.reset_assessment_data();
        status.set_assessment_substatus_json(StatusCode::Transitioning, 0)?;

        let packages = match self.package_manager.available_updates() {
            Ok(packages) => packages,
            Err(err) => {
                error!(error = %err, "Assessment failed");
                status.add_error(name, error_codes::PACKAGE_MANAGER_FAILURE, &err.to_string())?;
                status.set_assessment_substatus_json(StatusCode::Error, 1)?;
                return Ok(None);
            }
        };

        for (classification, names, versions) in group_by_classification(&packages) {
            status.set_package_assessment_status(
                &names,
                &versions,
                classification,
                package_state::AVAILABLE,
            )?;
        }
        status.set_assessment_substatus_json(StatusCode::Success, 0)?;
        info!(available = packages.len(), "Assessment complete");
        Ok(Some(packages))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Installation
    // ─────────────────────────────────────────────────────────────────────

    /// Returns whether the run succeeded and how many packages were installed.
    fn install(
        &self,
        status: &mut StatusAggregator<'_>,
        packages: &[AvailablePackage],
    ) -> Result<(bool, usize)> {
        let name = SubstatusName::PatchInstallationSummary;
        status.clear_errors(name);
        status.set_installation_substatus_json(StatusCode::Transitioning, 0)?;

        let window = match MaintenanceWindow::parse(
            &self.config.start_time,
            self.config.maximum_duration.as_deref().unwrap_or_default(),
        ) {
            Ok(window) => window,
            Err(err) => {
                status.add_error(name, error_codes::OPERATION_FAILED, &err.to_string())?;
                status.set_installation_substatus_json(StatusCode::Error, 1)?;
                return Ok((false, 0));
            }
        };

        let selector = PackageSelector::new(self.config);
        let mut pending = Vec::new();
        for package in packages {
            let state = selector.state_for(package);
            status.set_package_install_status(
                &[package.name.as_str()],
                &[package.version.as_str()],
                state,
                Some(package.classification.as_str()),
            )?;
            if state == package_state::PENDING {
                pending.push(package);
            }
        }

        let (mut installed, mut failed) = (0usize, 0usize);
        for (idx, package) in pending.iter().enumerate() {
            if !window.is_install_time_available(Utc::now()) {
                warn!(
                    remaining_packages = pending.len() - idx,
                    "Maintenance window exhausted before all packages were installed"
                );
                status.set_maintenance_window_exceeded(true)?;
                status.add_error(
                    name,
                    error_codes::OPERATION_FAILED,
                    "Maintenance window exceeded before all pending packages were installed",
                )?;
                break;
            }

            let outcome = self.package_manager.install(package).unwrap_or_else(|err| {
                warn!(package = %package.name, error = %err, "Install attempt errored");
                InstallOutcome::Failed
            });
            let state = match outcome {
                InstallOutcome::Installed => {
                    installed += 1;
                    package_state::INSTALLED
                }
                InstallOutcome::Failed => {
                    failed += 1;
                    status.add_error(
                        name,
                        error_codes::PACKAGE_MANAGER_FAILURE,
                        &format!("Failed to install {}={}", package.name, package.version),
                    )?;
                    package_state::FAILED
                }
            };
            status.set_package_install_status(
                &[package.name.as_str()],
                &[package.version.as_str()],
                state,
                None,
            )?;
        }

        match window.percentage_used(Utc::now()) {
            Ok(pct) => info!(percentage_used = pct, "Maintenance window usage"),
            Err(err) => warn!(error = %err, "Cannot compute maintenance window usage"),
        }

        let succeeded = failed == 0 && !status.maintenance_window_exceeded();
        let (code_status, code) = if succeeded {
            (StatusCode::Success, 0)
        } else {
            (StatusCode::Error, 1)
        };
        status.set_installation_substatus_json(code_status, code)?;
        info!(installed, failed, succeeded, "Installation complete");
        Ok((succeeded, installed))
    }

    fn fail_installation_after_assessment(&self, status: &mut StatusAggregator<'_>) -> Result<()> {
        let name = SubstatusName::PatchInstallationSummary;
        status.clear_errors(name);
        status.add_error(
            name,
            error_codes::OPERATION_FAILED,
            INSTALLATION_FAILED_DUE_TO_ASSESSMENT,
        )?;
        status.set_installation_substatus_json(StatusCode::Error, 1)
    }

    fn handle_reboot(&self, status: &mut StatusAggregator<'_>, installed_any: bool) -> Result<()> {
        let required = status.reboot_status() == RebootStatus::Required;
        let wanted = match self.config.reboot_setting {
            RebootSetting::Never => {
                if required {
                    info!("Reboot required but reboot setting is Never");
                }
                false
            }
            RebootSetting::IfRequired => required,
            RebootSetting::Always => required || installed_any,
        };
        if !wanted {
            return Ok(());
        }

        if status.set_installation_reboot_status(RebootStatus::Started)?
            == RebootTransition::Rejected
        {
            return Ok(());
        }
        if let Err(err) = self.package_manager.request_reboot() {
            error!(error = %err, "Reboot request failed");
            status.set_installation_reboot_status(RebootStatus::Failed)?;
            status.add_error(
                SubstatusName::PatchInstallationSummary,
                error_codes::OPERATION_FAILED,
                &format!("Reboot failed: {}", err),
            )?;
            status.set_installation_substatus_json(StatusCode::Error, 1)?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Health store + configure patching
    // ─────────────────────────────────────────────────────────────────────

    fn report_health_store(&self, status: &mut StatusAggregator<'_>, succeeded: bool) -> Result<()> {
        let has_id = self.config.health_store_id.is_some() || self.config.maintenance_run_id.is_some();
        if !has_id && !self.config.is_auto_patching() {
            return Ok(());
        }
        let should_report = has_id && succeeded && self.telemetry.is_some();
        let version = if should_report {
            patch_version(self.config)
        } else {
            PATCH_VERSION_UNKNOWN.to_string()
        };
        status.set_patch_metadata_for_healthstore_substatus(
            &version,
            should_report,
            StatusCode::Success,
            0,
        )
    }

    fn configure_patching(&self, status: &mut StatusAggregator<'_>) -> Result<()> {
        let name = SubstatusName::ConfigurePatchingSummary;
        status.clear_errors(name);

        if self.config.is_auto_patching() {
            if let Err(err) = self.package_manager.disable_automatic_os_patching() {
                status.add_error(name, error_codes::PACKAGE_MANAGER_FAILURE, &err.to_string())?;
            }
        }
        let os_patch_state = match self.package_manager.automatic_os_patch_state() {
            Ok(state) => state,
            Err(err) => {
                status.add_error(name, error_codes::PACKAGE_MANAGER_FAILURE, &err.to_string())?;
                "Unknown".to_string()
            }
        };
        let assessment_state = if self.config.is_auto_assessment_enabled() {
            "Enabled"
        } else {
            "Disabled"
        };

        let clean = status.errors(name).map_or(true, |log| log.is_empty());
        let (code_status, code) = if clean {
            (StatusCode::Success, 0)
        } else {
            (StatusCode::Error, 1)
        };
        status.set_configure_patching_substatus(&os_patch_state, assessment_state, code_status, code)
    }

    fn emit(&self, level: &str, message: &str) {
        let Some(sink) = self.telemetry else {
            return;
        };
        let task = format!("Core.{}", self.config.operation);
        if let Err(err) = sink.emit(&telemetry::event(&task, level, message, &self.config.activity_id)) {
            warn!(error = %err, "Failed to emit telemetry event");
        }
    }
}

/// Packages grouped by classification, in first-seen order.
fn group_by_classification(packages: &[AvailablePackage]) -> Vec<(&str, Vec<&str>, Vec<&str>)> {
    let mut groups: Vec<(&str, Vec<&str>, Vec<&str>)> = Vec::new();
    for package in packages {
        let classification = package.classification.as_str();
        match groups.iter_mut().find(|(c, _, _)| *c == classification) {
            Some((_, names, versions)) => {
                names.push(package.name.as_str());
                versions.push(package.version.as_str());
            }
            None => groups.push((
                classification,
                vec![package.name.as_str()],
                vec![package.version.as_str()],
            )),
        }
    }
    groups
}
