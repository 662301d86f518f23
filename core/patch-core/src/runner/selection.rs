//! Decides which available packages an installation run will attempt.

use patch_protocol::{classification, package_state};
use regex::Regex;
use tracing::warn;

use crate::backends::AvailablePackage;
use crate::settings::ExecutionConfig;

/// A `name` or `name=version` mask where `*` matches any run of characters.
#[derive(Debug, Clone)]
struct PackageMask {
    name: Regex,
    version: Option<Regex>,
}

fn wildcard(pattern: &str) -> Option<Regex> {
    let body: Vec<String> = pattern.split('*').map(regex::escape).collect();
    let anchored = format!("^{}$", body.join(".*"));
    match Regex::new(&anchored) {
        Ok(regex) => Some(regex),
        Err(err) => {
            warn!(pattern, error = %err, "Ignoring unusable package mask");
            None
        }
    }
}

impl PackageMask {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.split_once('=') {
            Some((name, version)) => Some(Self {
                name: wildcard(name.trim())?,
                version: Some(wildcard(version.trim())?),
            }),
            None => Some(Self {
                name: wildcard(raw)?,
                version: None,
            }),
        }
    }

    fn matches(&self, package: &AvailablePackage) -> bool {
        self.name.is_match(&package.name)
            && self
                .version
                .as_ref()
                .map_or(true, |version| version.is_match(&package.version))
    }
}

#[derive(Debug, Clone)]
pub struct PackageSelector {
    classifications: Vec<String>,
    include: Vec<PackageMask>,
    exclude: Vec<PackageMask>,
}

impl PackageSelector {
    pub fn new(config: &ExecutionConfig) -> Self {
        let masks = |raw: &[String]| -> Vec<PackageMask> {
            raw.iter().filter_map(|m| PackageMask::parse(m)).collect()
        };
        Self {
            classifications: config
                .classifications_to_include
                .iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            include: masks(&config.patches_to_include),
            exclude: masks(&config.patches_to_exclude),
        }
    }

    fn selects_everything(&self) -> bool {
        self.classifications.is_empty() && self.include.is_empty()
    }

    fn classification_selected(&self, package: &AvailablePackage) -> bool {
        let class = package.classification.as_str();
        self.classifications.iter().any(|wanted| {
            wanted.eq_ignore_ascii_case(class)
                || (wanted.eq_ignore_ascii_case(classification::OTHER)
                    && class == classification::UNCLASSIFIED)
        })
    }

    /// `Excluded`, `Pending` or `NotSelected`. Exclusion wins over inclusion.
    pub fn state_for(&self, package: &AvailablePackage) -> &'static str {
        if self.exclude.iter().any(|mask| mask.matches(package)) {
            return package_state::EXCLUDED;
        }
        if self.selects_everything()
            || self.include.iter().any(|mask| mask.matches(package))
            || self.classification_selected(package)
        {
            return package_state::PENDING;
        }
        package_state::NOT_SELECTED
    }
}
