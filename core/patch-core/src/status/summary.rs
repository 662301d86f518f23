//! Derives summary blobs from the in-memory package lists.
//!
//! Everything here is pure: the aggregator supplies the package lists, the
//! machine's reboot state and a timestamp, and gets a serializable summary back.

use chrono::{DateTime, Utc};
use patch_protocol::{
    classification, package_state, AssessmentSummary, InstallationSummary, RebootStatus,
};
use tracing::warn;

use super::errors::ErrorLog;
use super::package::{PackageList, PackageRecord};

pub const UTC_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(UTC_DATETIME_FORMAT).to_string()
}

fn is_critical_or_security(record: &PackageRecord) -> bool {
    record
        .classifications
        .iter()
        .any(|c| c == classification::CRITICAL || c == classification::SECURITY)
}

pub struct SummaryContext<'a> {
    pub activity_id: &'a str,
    pub start_time: &'a str,
    pub now: DateTime<Utc>,
}

pub fn assessment_summary(
    ctx: &SummaryContext<'_>,
    packages: &PackageList,
    reboot_pending: bool,
    errors: &ErrorLog,
    started_by: Option<String>,
) -> AssessmentSummary {
    let critical_and_security_patch_count =
        packages.iter().filter(|r| is_critical_or_security(r)).count();

    AssessmentSummary {
        assessment_activity_id: ctx.activity_id.to_string(),
        reboot_pending,
        critical_and_security_patch_count,
        other_patch_count: packages.len() - critical_and_security_patch_count,
        patches: packages.iter().map(PackageRecord::to_assessment_patch).collect(),
        start_time: ctx.start_time.to_string(),
        last_modified_time: format_timestamp(ctx.now),
        started_by,
        errors: errors.to_summary(),
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InstallationCounts {
    pub not_selected: usize,
    pub excluded: usize,
    pub pending: usize,
    pub installed: usize,
    pub failed: usize,
}

pub fn count_installation_states(packages: &PackageList) -> InstallationCounts {
    let mut counts = InstallationCounts::default();
    for record in packages.iter() {
        match record.state.as_str() {
            package_state::NOT_SELECTED => counts.not_selected += 1,
            package_state::EXCLUDED => counts.excluded += 1,
            package_state::PENDING => counts.pending += 1,
            package_state::INSTALLED => counts.installed += 1,
            package_state::FAILED => counts.failed += 1,
            other => warn!(
                patch_id = %record.patch_id,
                state = other,
                "Unexpected package installation state"
            ),
        }
    }
    counts
}

pub struct InstallationInputs<'a> {
    pub packages: &'a PackageList,
    pub reboot_status: RebootStatus,
    pub maintenance_window_exceeded: bool,
    pub maintenance_run_id: Option<String>,
    pub errors: &'a ErrorLog,
}

pub fn installation_summary(
    ctx: &SummaryContext<'_>,
    inputs: InstallationInputs<'_>,
) -> InstallationSummary {
    let counts = count_installation_states(inputs.packages);
    if counts.pending > 0 && inputs.maintenance_window_exceeded {
        warn!(
            pending = counts.pending,
            "Maintenance window exceeded with packages still pending"
        );
    }

    InstallationSummary {
        installation_activity_id: ctx.activity_id.to_string(),
        reboot_status: inputs.reboot_status,
        maintenance_window_exceeded: inputs.maintenance_window_exceeded,
        not_selected_patch_count: counts.not_selected,
        excluded_patch_count: counts.excluded,
        pending_patch_count: counts.pending,
        installed_patch_count: counts.installed,
        failed_patch_count: counts.failed,
        patches: inputs
            .packages
            .iter()
            .map(PackageRecord::to_installation_patch)
            .collect(),
        start_time: ctx.start_time.to_string(),
        last_modified_time: format_timestamp(ctx.now),
        maintenance_run_id: inputs.maintenance_run_id,
        errors: inputs.errors.to_summary(),
    }
}

/// Converts a maintenance-run id like `09/16/2021 08:24:42 AM +00:00` into the
/// dotted date form `2021.09.16` used as the health store patch version.
pub fn health_store_patch_version(run_id: &str) -> Option<String> {
    let date = run_id.split_whitespace().next()?;
    let mut parts = date.split('/');
    let (month, day, year) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let numeric = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    if !(numeric(month) && numeric(day) && numeric(year)) || year.len() != 4 {
        return None;
    }
    Some(format!("{}.{:0>2}.{:0>2}", year, month, day))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::package::patch_id;

    fn record(name: &str, classification: &str, state: &str) -> PackageRecord {
        PackageRecord {
            patch_id: patch_id(name, "1", "Ubuntu_22.04"),
            name: name.to_string(),
            version: "1".to_string(),
            classifications: vec![classification.to_string()],
            state: state.to_string(),
        }
    }

    fn ctx() -> SummaryContext<'static> {
        SummaryContext {
            activity_id: "act",
            start_time: "2021-01-01T00:00:00Z",
            now: Utc::now(),
        }
    }

    #[test]
    fn test_assessment_counts_split_by_classification() {
        let packages: PackageList = vec![
            record("a", "Critical", "Available"),
            record("b", "Security", "Available"),
            record("c", "Other", "Available"),
            record("d", "Unclassified", "Available"),
        ]
        .into_iter()
        .collect();

        let summary = assessment_summary(&ctx(), &packages, true, &ErrorLog::default(), None);
        assert_eq!(summary.critical_and_security_patch_count, 2);
        assert_eq!(summary.other_patch_count, 2);
        assert!(summary.reboot_pending);
        assert_eq!(summary.patches.len(), 4);
    }

    #[test]
    fn test_installation_counts() {
        let packages: PackageList = vec![
            record("a", "Other", "Installed"),
            record("b", "Other", "Failed"),
            record("c", "Other", "Pending"),
            record("d", "Other", "Excluded"),
            record("e", "Other", "NotSelected"),
            record("f", "Other", "Installed"),
            record("g", "Other", "Bogus"),
        ]
        .into_iter()
        .collect();

        let counts = count_installation_states(&packages);
        assert_eq!(
            counts,
            InstallationCounts {
                not_selected: 1,
                excluded: 1,
                pending: 1,
                installed: 2,
                failed: 1,
            }
        );
        let bucketed = counts.not_selected
            + counts.excluded
            + counts.pending
            + counts.installed
            + counts.failed;
        assert_eq!(bucketed, packages.len() - 1);
    }

    #[test]
    fn test_installation_summary_carries_run_id_and_flags() {
        let packages = PackageList::new();
        let summary = installation_summary(
            &ctx(),
            InstallationInputs {
                packages: &packages,
                reboot_status: RebootStatus::Required,
                maintenance_window_exceeded: true,
                maintenance_run_id: Some("run-1".to_string()),
                errors: &ErrorLog::default(),
            },
        );
        assert_eq!(summary.reboot_status, RebootStatus::Required);
        assert!(summary.maintenance_window_exceeded);
        assert_eq!(summary.maintenance_run_id.as_deref(), Some("run-1"));
    }

    #[test]
    fn test_health_store_patch_version() {
        assert_eq!(
            health_store_patch_version("09/16/2021 08:24:42 AM +00:00").as_deref(),
            Some("2021.09.16")
        );
        assert_eq!(
            health_store_patch_version("1/2/2022").as_deref(),
            Some("2022.01.02")
        );
        assert_eq!(health_store_patch_version("not-a-date"), None);
        assert_eq!(health_store_patch_version(""), None);
    }

    #[test]
    fn test_timestamp_format() {
        let at = DateTime::parse_from_rfc3339("2021-03-04T05:06:07.891Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_timestamp(at), "2021-03-04T05:06:07Z");
    }
}
