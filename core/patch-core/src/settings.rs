//! Settings payload loading and validation.
//!
//! A `<seq>.settings` file is shaped
//! `{"runtimeSettings":[{"handlerSettings":{"publicSettings":{...}}}]}`.
//! Every level must be present and of the right type, and `operation`,
//! `activityId` and `startTime` must be non-empty strings. Validation
//! reports every offending field at once.

use std::path::Path;
use std::str::FromStr;

use fs_err as fs;
use patch_protocol::{Operation, PublicSettings};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{PatchError, Result};

const REQUIRED_PUBLIC_SETTINGS: [&str; 3] = ["operation", "activityId", "startTime"];

pub const PATCH_MODE_AUTOMATIC_BY_PLATFORM: &str = "AutomaticByPlatform";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RebootSetting {
    Never,
    #[default]
    IfRequired,
    Always,
}

impl FromStr for RebootSetting {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "Never" => Ok(RebootSetting::Never),
            "IfRequired" => Ok(RebootSetting::IfRequired),
            "Always" => Ok(RebootSetting::Always),
            other => Err(format!("unknown reboot setting: {}", other)),
        }
    }
}

/// Validated configuration for one run, passed to the aggregator and runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionConfig {
    pub sequence: u64,
    pub operation: Operation,
    pub activity_id: String,
    pub start_time: String,
    pub maximum_duration: Option<String>,
    pub reboot_setting: RebootSetting,
    pub classifications_to_include: Vec<String>,
    pub patches_to_include: Vec<String>,
    pub patches_to_exclude: Vec<String>,
    pub maintenance_run_id: Option<String>,
    pub health_store_id: Option<String>,
    pub patch_mode: Option<String>,
    pub assessment_mode: Option<String>,
    pub maximum_assessment_interval: Option<String>,
    pub auto_assess_only: bool,
}

impl ExecutionConfig {
    pub fn is_auto_patching(&self) -> bool {
        self.patch_mode.as_deref() == Some(PATCH_MODE_AUTOMATIC_BY_PLATFORM)
    }

    pub fn is_auto_assessment_enabled(&self) -> bool {
        self.assessment_mode.as_deref() == Some(PATCH_MODE_AUTOMATIC_BY_PLATFORM)
    }
}

pub fn load_execution_config(
    settings_path: &Path,
    sequence: u64,
    auto_assess_only: bool,
) -> Result<ExecutionConfig> {
    let raw = fs::read_to_string(settings_path)
        .map_err(|e| PatchError::io("Failed to read settings file", e))?;
    let public = parse_public_settings(settings_path, &raw)?;
    build_execution_config(settings_path, sequence, public, auto_assess_only)
}

fn invalid(path: &Path, fields: Vec<String>) -> PatchError {
    PatchError::ConfigValidation {
        path: path.to_path_buf(),
        fields,
    }
}

pub fn parse_public_settings(path: &Path, raw: &str) -> Result<PublicSettings> {
    let document: Value = serde_json::from_str(raw)
        .map_err(|e| PatchError::json(format!("Failed to parse {}", path.display()), e))?;

    let runtime = document
        .get("runtimeSettings")
        .and_then(Value::as_array)
        .and_then(|entries| entries.first())
        .ok_or_else(|| invalid(path, vec!["runtimeSettings".to_string()]))?;
    let handler = runtime
        .get("handlerSettings")
        .filter(|v| v.as_object().is_some_and(|o| !o.is_empty()))
        .ok_or_else(|| invalid(path, vec!["handlerSettings".to_string()]))?;
    let public = handler
        .get("publicSettings")
        .filter(|v| v.as_object().is_some_and(|o| !o.is_empty()))
        .ok_or_else(|| invalid(path, vec!["publicSettings".to_string()]))?;

    let missing: Vec<String> = REQUIRED_PUBLIC_SETTINGS
        .iter()
        .filter(|key| {
            !public
                .get(**key)
                .and_then(Value::as_str)
                .is_some_and(|s| !s.trim().is_empty())
        })
        .map(|key| key.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(invalid(path, missing));
    }

    serde_json::from_value(public.clone())
        .map_err(|e| PatchError::json(format!("Malformed public settings in {}", path.display()), e))
}

fn build_execution_config(
    path: &Path,
    sequence: u64,
    public: PublicSettings,
    auto_assess_only: bool,
) -> Result<ExecutionConfig> {
    let operation = if auto_assess_only {
        Operation::AutoAssessment
    } else {
        public
            .operation
            .as_deref()
            .unwrap_or_default()
            .parse::<Operation>()
            .map_err(|_| invalid(path, vec!["operation".to_string()]))?
    };

    if operation == Operation::Installation
        && public
            .maximum_duration
            .as_deref()
            .map_or(true, |d| d.trim().is_empty())
    {
        return Err(invalid(path, vec!["maximumDuration".to_string()]));
    }

    let reboot_setting = match public.reboot_setting.as_deref() {
        None => RebootSetting::default(),
        Some(value) => value.parse().unwrap_or_else(|err: String| {
            warn!(error = %err, "Falling back to IfRequired");
            RebootSetting::default()
        }),
    };

    let config = ExecutionConfig {
        sequence,
        operation,
        activity_id: public.activity_id.unwrap_or_default(),
        start_time: public.start_time.unwrap_or_default(),
        maximum_duration: public.maximum_duration,
        reboot_setting,
        classifications_to_include: public.classifications_to_include,
        patches_to_include: public.patches_to_include,
        patches_to_exclude: public.patches_to_exclude,
        maintenance_run_id: public.maintenance_run_id.filter(|id| !id.trim().is_empty()),
        health_store_id: public.health_store_id.filter(|id| !id.trim().is_empty()),
        patch_mode: public.patch_mode,
        assessment_mode: public.assessment_mode,
        maximum_assessment_interval: public.maximum_assessment_interval,
        auto_assess_only,
    };
    debug!(sequence, operation = %config.operation, "Execution config loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(public: Value) -> String {
        json!({
            "runtimeSettings": [
                { "handlerSettings": { "publicSettings": public } }
            ]
        })
        .to_string()
    }

    fn load(raw: &str) -> Result<ExecutionConfig> {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("3.settings");
        std::fs::write(&path, raw).unwrap();
        load_execution_config(&path, 3, false)
    }

    fn fields(err: PatchError) -> Vec<String> {
        match err {
            PatchError::ConfigValidation { fields, .. } => fields,
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn test_valid_installation_settings() {
        let config = load(&settings(json!({
            "operation": "Installation",
            "activityId": "act-1",
            "startTime": "2021-08-08T23:00:00Z",
            "maximumDuration": "PT3H",
            "rebootSetting": "Never",
            "classificationsToInclude": ["Critical", "Security"],
            "patchesToExclude": ["kernel*"],
            "maintenanceRunId": "09/16/2021 08:24:42 AM +00:00"
        })))
        .unwrap();

        assert_eq!(config.sequence, 3);
        assert_eq!(config.operation, Operation::Installation);
        assert_eq!(config.reboot_setting, RebootSetting::Never);
        assert_eq!(config.classifications_to_include.len(), 2);
        assert_eq!(config.patches_to_exclude, vec!["kernel*".to_string()]);
    }

    #[test]
    fn test_missing_required_fields_are_all_named() {
        let err = load(&settings(json!({ "activityId": "" , "patchMode": "x"}))).unwrap_err();
        assert_eq!(fields(err), vec!["operation", "activityId", "startTime"]);
    }

    #[test]
    fn test_wrongly_typed_levels() {
        let err = load(r#"{"runtimeSettings": {}}"#).unwrap_err();
        assert_eq!(fields(err), vec!["runtimeSettings"]);

        let err = load(r#"{"runtimeSettings": [{"handlerSettings": []}]}"#).unwrap_err();
        assert_eq!(fields(err), vec!["handlerSettings"]);

        let err = load(r#"{"runtimeSettings": [{"handlerSettings": {"publicSettings": {}}}]}"#)
            .unwrap_err();
        assert_eq!(fields(err), vec!["publicSettings"]);
    }

    #[test]
    fn test_unknown_operation_is_invalid() {
        let err = load(&settings(json!({
            "operation": "Reticulate",
            "activityId": "a",
            "startTime": "2021-08-08T23:00:00Z"
        })))
        .unwrap_err();
        assert_eq!(fields(err), vec!["operation"]);
    }

    #[test]
    fn test_installation_requires_maximum_duration() {
        let err = load(&settings(json!({
            "operation": "Installation",
            "activityId": "a",
            "startTime": "2021-08-08T23:00:00Z"
        })))
        .unwrap_err();
        assert_eq!(fields(err), vec!["maximumDuration"]);
    }

    #[test]
    fn test_auto_assess_only_overrides_operation() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("1.settings");
        std::fs::write(
            &path,
            settings(json!({
                "operation": "Installation",
                "activityId": "a",
                "startTime": "2021-08-08T23:00:00Z",
                "maximumDuration": "PT1H"
            })),
        )
        .unwrap();
        let config = load_execution_config(&path, 1, true).unwrap();
        assert_eq!(config.operation, Operation::AutoAssessment);
    }
}
