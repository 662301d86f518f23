//! Package records and the insertion-ordered list that holds them.

use std::collections::HashMap;

use patch_protocol::{package_state, AssessmentPatch, InstallationPatch};

/// One package as reported in a summary blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRecord {
    pub patch_id: String,
    pub name: String,
    pub version: String,
    pub classifications: Vec<String>,
    pub state: String,
}

impl PackageRecord {
    pub fn to_assessment_patch(&self) -> AssessmentPatch {
        AssessmentPatch {
            patch_id: self.patch_id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            classifications: self.classifications.clone(),
            patch_state: Some(self.state.clone()),
        }
    }

    pub fn to_installation_patch(&self) -> InstallationPatch {
        InstallationPatch {
            patch_id: self.patch_id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            classifications: self.classifications.clone(),
            patch_installation_state: self.state.clone(),
        }
    }
}

impl From<AssessmentPatch> for PackageRecord {
    fn from(patch: AssessmentPatch) -> Self {
        PackageRecord {
            patch_id: patch.patch_id,
            name: patch.name,
            version: patch.version,
            classifications: patch.classifications,
            state: patch
                .patch_state
                .unwrap_or_else(|| package_state::AVAILABLE.to_string()),
        }
    }
}

impl From<InstallationPatch> for PackageRecord {
    fn from(patch: InstallationPatch) -> Self {
        PackageRecord {
            patch_id: patch.patch_id,
            name: patch.name,
            version: patch.version,
            classifications: patch.classifications,
            state: patch.patch_installation_state,
        }
    }
}

/// Normalized composite key: `<name>_<version>_<os name>_<os version>`.
pub fn patch_id(name: &str, version: &str, os_identity: &str) -> String {
    format!("{}_{}_{}", name, version, os_identity)
}

/// Package records keyed by patch id, iterated in first-insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageList {
    records: Vec<PackageRecord>,
    index: HashMap<String, usize>,
}

impl PackageList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.index.clear();
    }

    pub fn get(&self, patch_id: &str) -> Option<&PackageRecord> {
        self.index.get(patch_id).map(|&idx| &self.records[idx])
    }

    pub fn get_mut(&mut self, patch_id: &str) -> Option<&mut PackageRecord> {
        match self.index.get(patch_id) {
            Some(&idx) => self.records.get_mut(idx),
            None => None,
        }
    }

    /// Appends a record, or replaces the existing one with the same patch id in place.
    pub fn insert(&mut self, record: PackageRecord) {
        if let Some(existing) = self.get_mut(&record.patch_id) {
            *existing = record;
            return;
        }
        self.index
            .insert(record.patch_id.clone(), self.records.len());
        self.records.push(record);
    }

    pub fn iter(&self) -> impl Iterator<Item = &PackageRecord> {
        self.records.iter()
    }
}

impl FromIterator<PackageRecord> for PackageList {
    fn from_iter<I: IntoIterator<Item = PackageRecord>>(iter: I) -> Self {
        let mut list = PackageList::new();
        for record in iter {
            list.insert(record);
        }
        list
    }
}
