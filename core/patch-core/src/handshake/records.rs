//! Persistence for the two handshake records.
//!
//! Unreadable records are reported as absent. Losing handshake state costs at
//! most a redundant core launch, which the status overlay absorbs.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use patch_protocol::{CoreStateFile, CoreStateRecord, ExtStateFile, Operation, SequenceRecord};
use tracing::{debug, warn};

use crate::error::{PatchError, Result};
use crate::fileio::{read_json_record, remove_if_exists, write_with_retry, RetryPolicy};
use crate::storage::StorageConfig;

#[derive(Debug, Clone)]
pub struct HandshakeStore {
    ext_state_path: PathBuf,
    core_state_path: PathBuf,
    retry: RetryPolicy,
}

impl HandshakeStore {
    pub fn new(storage: &StorageConfig, retry: RetryPolicy) -> Self {
        Self {
            ext_state_path: storage.ext_state_file(),
            core_state_path: storage.core_state_file(),
            retry,
        }
    }

    pub fn read_sequence_record(&self) -> Option<SequenceRecord> {
        match read_json_record::<ExtStateFile>(&self.ext_state_path, &self.retry) {
            Ok(record) => record.map(|file| file.extension_sequence),
            Err(err) => {
                warn!(error = %err, "Extension state unreadable, treating as absent");
                None
            }
        }
    }

    pub fn write_sequence_record(
        &self,
        sequence: u64,
        operation: Operation,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let file = ExtStateFile {
            extension_sequence: SequenceRecord {
                sequence_number: sequence,
                operation: operation.as_str().to_string(),
                last_updated_utc: now,
            },
        };
        self.write(&self.ext_state_path, &file)?;
        debug!(sequence, operation = %operation, "Extension state recorded");
        Ok(())
    }

    /// The core record, only if it belongs to `sequence`.
    pub fn read_core_record(&self, sequence: u64) -> Option<CoreStateRecord> {
        let record = match read_json_record::<CoreStateFile>(&self.core_state_path, &self.retry) {
            Ok(record) => record?.core_sequence,
            Err(err) => {
                warn!(error = %err, "Core state unreadable, treating as absent");
                return None;
            }
        };
        if record.sequence_number != sequence {
            debug!(
                recorded = record.sequence_number,
                sequence, "Core state belongs to another sequence"
            );
            return None;
        }
        Some(record)
    }

    pub fn write_core_record(&self, record: &CoreStateRecord) -> Result<()> {
        let file = CoreStateFile {
            core_sequence: record.clone(),
        };
        self.write(&self.core_state_path, &file)
    }

    /// Marks `sequence` in progress, owned by the given process if known.
    pub fn mark_core_in_progress(
        &self,
        sequence: u64,
        process_id: Option<u32>,
        process_start_time: Option<u64>,
    ) -> Result<()> {
        self.write_core_record(&CoreStateRecord {
            sequence_number: sequence,
            in_progress: true,
            completed_utc: None,
            process_id,
            process_start_time,
            launched_utc: None,
        })
    }

    /// Marks `sequence` in progress on behalf of a core process that is
    /// about to be launched and has no pid yet.
    pub fn mark_core_launching(&self, sequence: u64, now: DateTime<Utc>) -> Result<()> {
        self.write_core_record(&CoreStateRecord {
            sequence_number: sequence,
            in_progress: true,
            completed_utc: None,
            process_id: None,
            process_start_time: None,
            launched_utc: Some(now),
        })
    }

    pub fn mark_core_completed(&self, sequence: u64, now: DateTime<Utc>) -> Result<()> {
        self.write_core_record(&CoreStateRecord {
            sequence_number: sequence,
            in_progress: false,
            completed_utc: Some(now),
            process_id: None,
            process_start_time: None,
            launched_utc: None,
        })
    }

    pub fn clear_core_record(&self) -> Result<()> {
        remove_if_exists(&self.core_state_path)
    }

    pub fn clear_all(&self) -> Result<()> {
        remove_if_exists(&self.core_state_path)?;
        remove_if_exists(&self.ext_state_path)
    }

    fn write<T: serde::Serialize>(&self, path: &std::path::Path, value: &T) -> Result<()> {
        let content = serde_json::to_string(value)
            .map_err(|e| PatchError::json(format!("Failed to serialize {}", path.display()), e))?;
        write_with_retry(path, &content, &self.retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(root: &std::path::Path) -> HandshakeStore {
        let storage = StorageConfig::with_root(root);
        HandshakeStore::new(&storage, RetryPolicy::immediate(1))
    }

    #[test]
    fn test_sequence_record_roundtrip() {
        let temp = tempdir().unwrap();
        let store = store(temp.path());
        assert!(store.read_sequence_record().is_none());

        let now = Utc::now();
        store
            .write_sequence_record(5, Operation::Installation, now)
            .unwrap();
        let record = store.read_sequence_record().unwrap();
        assert_eq!(record.sequence_number, 5);
        assert_eq!(record.operation, "Installation");
    }

    #[test]
    fn test_core_record_for_other_sequence_is_absent() {
        let temp = tempdir().unwrap();
        let store = store(temp.path());
        store.mark_core_in_progress(3, Some(10), None).unwrap();

        assert!(store.read_core_record(4).is_none());
        let record = store.read_core_record(3).unwrap();
        assert!(record.in_progress);
        assert_eq!(record.process_id, Some(10));
    }

    #[test]
    fn test_garbage_records_read_as_absent() {
        let temp = tempdir().unwrap();
        let storage = StorageConfig::with_root(temp.path());
        std::fs::create_dir_all(storage.config_dir()).unwrap();
        std::fs::write(storage.ext_state_file(), "{oops").unwrap();
        std::fs::write(storage.core_state_file(), r#"{"coreSequence": 7}"#).unwrap();

        let store = HandshakeStore::new(&storage, RetryPolicy::immediate(1));
        assert!(store.read_sequence_record().is_none());
        assert!(store.read_core_record(7).is_none());
    }

    #[test]
    fn test_completed_record() {
        let temp = tempdir().unwrap();
        let store = store(temp.path());
        store.mark_core_completed(2, Utc::now()).unwrap();
        assert!(store.read_core_record(2).unwrap().is_completed());

        store.clear_all().unwrap();
        assert!(store.read_core_record(2).is_none());
    }
}
