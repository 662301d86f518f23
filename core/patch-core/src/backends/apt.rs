//! apt-based package manager for Debian and Ubuntu guests.

use std::path::PathBuf;
use std::process::Command;

use fs_err as fs;
use once_cell::sync::Lazy;
use patch_protocol::classification;
use regex::Regex;
use tracing::{debug, info, warn};

use super::{AvailablePackage, InstallOutcome, PackageManager, RebootProbe};
use crate::error::{PatchError, Result};
use crate::fileio::{write_with_retry, RetryPolicy};

const REBOOT_REQUIRED_PATH: &str = "/var/run/reboot-required";
const AUTO_UPGRADES_PATH: &str = "/etc/apt/apt.conf.d/20auto-upgrades";
const UNATTENDED_UPGRADE_KEY: &str = "APT::Periodic::Unattended-Upgrade";

/// `Inst <name> [<current>] (<candidate> <repos> [<arch>])`
static RE_SIMULATED_INSTALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Inst (\S+) (?:\[[^\]]*\] )?\((\S+) ([^\[\)]*)").unwrap()
});

static RE_UNATTENDED_UPGRADE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"APT::Periodic::Unattended-Upgrade\s+"(\d+)"\s*;"#).unwrap()
});

#[derive(Debug, Clone)]
pub struct AptPackageManager {
    reboot_required_path: PathBuf,
    auto_upgrades_path: PathBuf,
    retry: RetryPolicy,
}

impl Default for AptPackageManager {
    fn default() -> Self {
        Self {
            reboot_required_path: PathBuf::from(REBOOT_REQUIRED_PATH),
            auto_upgrades_path: PathBuf::from(AUTO_UPGRADES_PATH),
            retry: RetryPolicy::default(),
        }
    }
}

impl AptPackageManager {
    fn run(program: &str, args: &[&str]) -> Result<String> {
        debug!(program, ?args, "Running package manager command");
        let output = Command::new(program)
            .args(args)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .output()
            .map_err(|e| PatchError::Backend(format!("{}: {}", program, e)))?;
        if !output.status.success() {
            return Err(PatchError::Backend(format!(
                "{} exited with {}: {}",
                program,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl RebootProbe for AptPackageManager {
    fn is_reboot_pending(&self) -> bool {
        self.reboot_required_path.exists()
    }
}

impl PackageManager for AptPackageManager {
    fn available_updates(&self) -> Result<Vec<AvailablePackage>> {
        Self::run("apt-get", &["-q", "update"])?;
        let output = Self::run("apt-get", &["-s", "dist-upgrade"])?;
        Ok(parse_simulated_upgrade(&output))
    }

    fn install(&self, package: &AvailablePackage) -> Result<InstallOutcome> {
        let target = format!("{}={}", package.name, package.version);
        match Self::run("apt-get", &["-y", "--only-upgrade", "install", &target]) {
            Ok(_) => Ok(InstallOutcome::Installed),
            Err(err) => {
                warn!(package = %target, error = %err, "Package install failed");
                Ok(InstallOutcome::Failed)
            }
        }
    }

    fn request_reboot(&self) -> Result<()> {
        info!("Requesting machine reboot");
        Self::run("shutdown", &["-r", "+1"]).map(|_| ())
    }

    fn automatic_os_patch_state(&self) -> Result<String> {
        if !self.auto_upgrades_path.exists() {
            return Ok("Disabled".to_string());
        }
        let content = fs::read_to_string(&self.auto_upgrades_path)
            .map_err(|e| PatchError::io("Failed to read auto-upgrades config", e))?;
        Ok(parse_auto_upgrade_state(&content).to_string())
    }

    fn disable_automatic_os_patching(&self) -> Result<()> {
        let content = if self.auto_upgrades_path.exists() {
            fs::read_to_string(&self.auto_upgrades_path)
                .map_err(|e| PatchError::io("Failed to read auto-upgrades config", e))?
        } else {
            String::new()
        };
        let updated = disable_unattended_upgrade(&content);
        write_with_retry(&self.auto_upgrades_path, &updated, &self.retry)?;
        info!(path = %self.auto_upgrades_path.display(), "Automatic OS updates disabled");
        Ok(())
    }
}

fn parse_simulated_upgrade(output: &str) -> Vec<AvailablePackage> {
    output
        .lines()
        .filter_map(|line| {
            let caps = RE_SIMULATED_INSTALL.captures(line)?;
            let repos = caps.get(3).map_or("", |m| m.as_str());
            let classification = if repos.contains("-security") {
                classification::SECURITY
            } else {
                classification::OTHER
            };
            Some(AvailablePackage {
                name: caps[1].to_string(),
                version: caps[2].to_string(),
                classification: classification.to_string(),
            })
        })
        .collect()
}

fn parse_auto_upgrade_state(content: &str) -> &'static str {
    match RE_UNATTENDED_UPGRADE
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
    {
        Some("0") => "Disabled",
        Some(_) => "Enabled",
        None => "Disabled",
    }
}

fn disable_unattended_upgrade(content: &str) -> String {
    let line = format!("{} \"0\";", UNATTENDED_UPGRADE_KEY);
    if RE_UNATTENDED_UPGRADE.is_match(content) {
        return RE_UNATTENDED_UPGRADE
            .replace(content, line.as_str())
            .into_owned();
    }
    let mut updated = content.to_string();
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&line);
    updated.push('\n');
    updated
}
