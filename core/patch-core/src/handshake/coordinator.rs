//! Decides, per trigger, whether to start a fresh generation, acknowledge one
//! that already finished, or wait on one still running.
//!
//! ```text
//! Idle ──► Observing ──► Starting ──► Done      (new generation, core launched)
//!              │
//!              ├──────────────────────► Done    (already completed / no-op)
//!              │
//!              └──► Waiting ──────────► Done    (completed during wait, or timeout)
//! ```
//!
//! The wait is the only blocking point and is always bounded. The core
//! process is never cancelled from here.

use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use patch_protocol::{CoreStateRecord, Operation, SequenceRecord};
use tracing::{debug, info, warn};

use super::records::HandshakeStore;
use crate::backends::{CoreLauncher, ProcessProbe};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTimings {
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for HandshakeTimings {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Idle,
    Starting,
    Observing,
    Waiting,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Core state reset, extension state recorded, core launched.
    StartedFresh { pid: u32 },
    /// No-op trigger: core state cleared, extension state recorded, nothing launched.
    NoOperation,
    /// Same generation, prior work already finished.
    AlreadyCompleted,
    /// Same generation, finished while we polled.
    WaitedForCompletion,
    /// Same generation, still running when the wait budget ran out.
    WaitTimedOut,
}

/// Why a trigger counts as a new generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FreshReason {
    NoSequenceRecord,
    SequenceChanged,
    PreviousNoOperation,
    CoreStateMissing,
    CoreProcessGone,
    LaunchAbandoned,
}

pub struct HandshakeCoordinator<'a> {
    store: HandshakeStore,
    launcher: &'a dyn CoreLauncher,
    probe: &'a dyn ProcessProbe,
    timings: HandshakeTimings,
    phase: HandshakePhase,
}

impl<'a> HandshakeCoordinator<'a> {
    pub fn new(
        store: HandshakeStore,
        launcher: &'a dyn CoreLauncher,
        probe: &'a dyn ProcessProbe,
        timings: HandshakeTimings,
    ) -> Self {
        Self {
            store,
            launcher,
            probe,
            timings,
            phase: HandshakePhase::Idle,
        }
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn store(&self) -> &HandshakeStore {
        &self.store
    }

    /// Handles one trigger for `sequence` requesting `operation`.
    pub fn handle(&mut self, sequence: u64, operation: Operation) -> Result<HandshakeOutcome> {
        self.phase = HandshakePhase::Observing;
        let previous = self.store.read_sequence_record();
        let core = self.store.read_core_record(sequence);

        if operation == Operation::NoOperation {
            return self.record_no_operation(sequence);
        }

        match self.fresh_reason(sequence, previous.as_ref(), core.as_ref()) {
            Some(reason) => {
                info!(sequence, operation = %operation, ?reason, "Starting new generation");
                self.start_fresh(sequence, operation)
            }
            None => self.continue_generation(sequence, core),
        }
    }

    fn fresh_reason(
        &self,
        sequence: u64,
        previous: Option<&SequenceRecord>,
        core: Option<&CoreStateRecord>,
    ) -> Option<FreshReason> {
        let Some(previous) = previous else {
            return Some(FreshReason::NoSequenceRecord);
        };
        if previous.sequence_number != sequence {
            return Some(FreshReason::SequenceChanged);
        }
        if previous.operation == Operation::NoOperation.as_str() {
            return Some(FreshReason::PreviousNoOperation);
        }
        let Some(core) = core else {
            return Some(FreshReason::CoreStateMissing);
        };
        if core.in_progress {
            match core.process_id {
                Some(pid) if !self.probe.is_alive(pid, core.process_start_time) => {
                    warn!(sequence, pid, "Core process for this sequence is gone");
                    return Some(FreshReason::CoreProcessGone);
                }
                None if self.launch_is_stale(core) => {
                    warn!(
                        sequence,
                        launched = ?core.launched_utc,
                        "Core process never reported in"
                    );
                    return Some(FreshReason::LaunchAbandoned);
                }
                _ => {}
            }
        }
        None
    }

    /// A pid-less in-progress record is only trusted for one wait budget
    /// after the wrapper wrote it.
    fn launch_is_stale(&self, core: &CoreStateRecord) -> bool {
        let Some(launched) = core.launched_utc else {
            return true;
        };
        Utc::now()
            .signed_duration_since(launched)
            .to_std()
            .is_ok_and(|age| age > self.timings.wait_timeout)
    }

    fn record_no_operation(&mut self, sequence: u64) -> Result<HandshakeOutcome> {
        self.phase = HandshakePhase::Starting;
        self.store.clear_core_record()?;
        self.store
            .write_sequence_record(sequence, Operation::NoOperation, Utc::now())?;
        info!(sequence, "No-op trigger recorded");
        self.phase = HandshakePhase::Done;
        Ok(HandshakeOutcome::NoOperation)
    }

    fn start_fresh(&mut self, sequence: u64, operation: Operation) -> Result<HandshakeOutcome> {
        self.phase = HandshakePhase::Starting;
        self.store.mark_core_launching(sequence, Utc::now())?;
        self.store
            .write_sequence_record(sequence, operation, Utc::now())?;
        let pid = match self.launcher.launch(sequence) {
            Ok(pid) => pid,
            Err(err) => {
                // Nothing will ever complete this record.
                if let Err(clear_err) = self.store.clear_core_record() {
                    warn!(
                        sequence,
                        error = %clear_err,
                        "Could not clear core state after failed launch"
                    );
                }
                self.phase = HandshakePhase::Done;
                return Err(err);
            }
        };
        self.phase = HandshakePhase::Done;
        Ok(HandshakeOutcome::StartedFresh { pid })
    }

    fn continue_generation(
        &mut self,
        sequence: u64,
        core: Option<CoreStateRecord>,
    ) -> Result<HandshakeOutcome> {
        if core.as_ref().is_some_and(CoreStateRecord::is_completed) {
            info!(sequence, "Generation already completed");
            self.phase = HandshakePhase::Done;
            return Ok(HandshakeOutcome::AlreadyCompleted);
        }

        self.phase = HandshakePhase::Waiting;
        info!(
            sequence,
            timeout_secs = self.timings.wait_timeout.as_secs(),
            "Core process still running, waiting for completion"
        );
        let started = Instant::now();
        while started.elapsed() < self.timings.wait_timeout {
            thread::sleep(self.timings.poll_interval);
            match self.store.read_core_record(sequence) {
                Some(record) if record.is_completed() => {
                    info!(sequence, "Core process completed during wait");
                    self.phase = HandshakePhase::Done;
                    return Ok(HandshakeOutcome::WaitedForCompletion);
                }
                _ => debug!(sequence, "Still in progress"),
            }
        }

        warn!(sequence, "Timed out waiting for core process; it keeps running");
        self.phase = HandshakePhase::Done;
        Ok(HandshakeOutcome::WaitTimedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileio::RetryPolicy;
    use crate::storage::StorageConfig;
    use std::cell::RefCell;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingLauncher {
        launched: RefCell<Vec<u64>>,
    }

    impl CoreLauncher for RecordingLauncher {
        fn launch(&self, sequence: u64) -> Result<u32> {
            self.launched.borrow_mut().push(sequence);
            Ok(4242)
        }
    }

    struct FixedProbe(bool);

    impl ProcessProbe for FixedProbe {
        fn is_alive(&self, _pid: u32, _expected_start: Option<u64>) -> bool {
            self.0
        }
    }

    fn timings() -> HandshakeTimings {
        HandshakeTimings {
            wait_timeout: Duration::from_millis(30),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn store(root: &std::path::Path) -> HandshakeStore {
        HandshakeStore::new(&StorageConfig::with_root(root), RetryPolicy::immediate(1))
    }

    #[test]
    fn test_first_trigger_starts_fresh() {
        let temp = tempdir().unwrap();
        let launcher = RecordingLauncher::default();
        let probe = FixedProbe(true);
        let mut coordinator =
            HandshakeCoordinator::new(store(temp.path()), &launcher, &probe, timings());

        let outcome = coordinator.handle(1, Operation::Assessment).unwrap();
        assert_eq!(outcome, HandshakeOutcome::StartedFresh { pid: 4242 });
        assert_eq!(coordinator.phase(), HandshakePhase::Done);
        assert_eq!(*launcher.launched.borrow(), vec![1]);

        let core = coordinator.store().read_core_record(1).unwrap();
        assert!(core.in_progress);
        let ext = coordinator.store().read_sequence_record().unwrap();
        assert_eq!(ext.sequence_number, 1);
    }

    #[test]
    fn test_completed_generation_is_not_relaunched() {
        let temp = tempdir().unwrap();
        let launcher = RecordingLauncher::default();
        let probe = FixedProbe(true);
        let store = store(temp.path());
        store
            .write_sequence_record(2, Operation::Installation, Utc::now())
            .unwrap();
        store.mark_core_completed(2, Utc::now()).unwrap();

        let mut coordinator = HandshakeCoordinator::new(store, &launcher, &probe, timings());
        let outcome = coordinator.handle(2, Operation::Installation).unwrap();
        assert_eq!(outcome, HandshakeOutcome::AlreadyCompleted);
        assert!(launcher.launched.borrow().is_empty());
    }

    #[test]
    fn test_in_progress_generation_times_out() {
        let temp = tempdir().unwrap();
        let launcher = RecordingLauncher::default();
        let probe = FixedProbe(true);
        let store = store(temp.path());
        store
            .write_sequence_record(3, Operation::Assessment, Utc::now())
            .unwrap();
        store.mark_core_in_progress(3, Some(99), Some(1)).unwrap();

        let mut coordinator = HandshakeCoordinator::new(store, &launcher, &probe, timings());
        let outcome = coordinator.handle(3, Operation::Assessment).unwrap();
        assert_eq!(outcome, HandshakeOutcome::WaitTimedOut);
        assert!(launcher.launched.borrow().is_empty());
    }

    #[test]
    fn test_dead_core_process_is_relaunched() {
        let temp = tempdir().unwrap();
        let launcher = RecordingLauncher::default();
        let probe = FixedProbe(false);
        let store = store(temp.path());
        store
            .write_sequence_record(4, Operation::Installation, Utc::now())
            .unwrap();
        store.mark_core_in_progress(4, Some(99), Some(1)).unwrap();

        let mut coordinator = HandshakeCoordinator::new(store, &launcher, &probe, timings());
        let outcome = coordinator.handle(4, Operation::Installation).unwrap();
        assert_eq!(outcome, HandshakeOutcome::StartedFresh { pid: 4242 });
        assert_eq!(*launcher.launched.borrow(), vec![4]);
    }

    #[test]
    fn test_new_sequence_starts_fresh() {
        let temp = tempdir().unwrap();
        let launcher = RecordingLauncher::default();
        let probe = FixedProbe(true);
        let store = store(temp.path());
        store
            .write_sequence_record(5, Operation::Assessment, Utc::now())
            .unwrap();
        store.mark_core_completed(5, Utc::now()).unwrap();

        let mut coordinator = HandshakeCoordinator::new(store, &launcher, &probe, timings());
        let outcome = coordinator.handle(6, Operation::Assessment).unwrap();
        assert!(matches!(outcome, HandshakeOutcome::StartedFresh { .. }));
    }

    #[test]
    fn test_previous_no_operation_starts_fresh() {
        let temp = tempdir().unwrap();
        let launcher = RecordingLauncher::default();
        let probe = FixedProbe(true);
        let store = store(temp.path());
        store
            .write_sequence_record(7, Operation::NoOperation, Utc::now())
            .unwrap();
        store.mark_core_completed(7, Utc::now()).unwrap();

        let mut coordinator = HandshakeCoordinator::new(store, &launcher, &probe, timings());
        let outcome = coordinator.handle(7, Operation::Assessment).unwrap();
        assert!(matches!(outcome, HandshakeOutcome::StartedFresh { .. }));
    }

    #[test]
    fn test_no_operation_clears_core_state_without_launch() {
        let temp = tempdir().unwrap();
        let launcher = RecordingLauncher::default();
        let probe = FixedProbe(true);
        let store = store(temp.path());
        store.mark_core_in_progress(8, None, None).unwrap();

        let mut coordinator = HandshakeCoordinator::new(store, &launcher, &probe, timings());
        let outcome = coordinator.handle(8, Operation::NoOperation).unwrap();
        assert_eq!(outcome, HandshakeOutcome::NoOperation);
        assert!(launcher.launched.borrow().is_empty());
        assert!(coordinator.store().read_core_record(8).is_none());
        assert_eq!(
            coordinator.store().read_sequence_record().unwrap().operation,
            "NoOperation"
        );
    }

    struct FlakyLauncher {
        attempts: RefCell<u32>,
    }

    impl CoreLauncher for FlakyLauncher {
        fn launch(&self, _sequence: u64) -> Result<u32> {
            let mut attempts = self.attempts.borrow_mut();
            *attempts += 1;
            if *attempts == 1 {
                return Err(crate::error::PatchError::Launch("spawn failed".to_string()));
            }
            Ok(5150)
        }
    }

    #[test]
    fn test_failed_launch_does_not_strand_generation() {
        let temp = tempdir().unwrap();
        let launcher = FlakyLauncher {
            attempts: RefCell::new(0),
        };
        let probe = FixedProbe(true);
        let mut coordinator =
            HandshakeCoordinator::new(store(temp.path()), &launcher, &probe, timings());

        assert!(coordinator.handle(3, Operation::Installation).is_err());
        assert!(coordinator.store().read_core_record(3).is_none());

        let outcome = coordinator.handle(3, Operation::Installation).unwrap();
        assert_eq!(outcome, HandshakeOutcome::StartedFresh { pid: 5150 });
        assert_eq!(*launcher.attempts.borrow(), 2);
    }

    #[test]
    fn test_stale_pidless_record_is_relaunched() {
        let temp = tempdir().unwrap();
        let launcher = RecordingLauncher::default();
        let probe = FixedProbe(true);
        let store = store(temp.path());
        store
            .write_sequence_record(10, Operation::Installation, Utc::now())
            .unwrap();
        store
            .mark_core_launching(10, Utc::now() - chrono::Duration::minutes(5))
            .unwrap();

        let mut coordinator = HandshakeCoordinator::new(store, &launcher, &probe, timings());
        let outcome = coordinator.handle(10, Operation::Installation).unwrap();
        assert_eq!(outcome, HandshakeOutcome::StartedFresh { pid: 4242 });
        assert_eq!(*launcher.launched.borrow(), vec![10]);
    }

    #[test]
    fn test_fresh_pidless_record_is_waited_on() {
        let temp = tempdir().unwrap();
        let launcher = RecordingLauncher::default();
        let probe = FixedProbe(true);
        let store = store(temp.path());
        store
            .write_sequence_record(11, Operation::Installation, Utc::now())
            .unwrap();
        store.mark_core_launching(11, Utc::now()).unwrap();

        let mut coordinator = HandshakeCoordinator::new(store, &launcher, &probe, timings());
        let outcome = coordinator.handle(11, Operation::Installation).unwrap();
        assert_eq!(outcome, HandshakeOutcome::WaitTimedOut);
        assert!(launcher.launched.borrow().is_empty());
    }

    #[test]
    fn test_unreadable_records_start_fresh() {
        let temp = tempdir().unwrap();
        let storage = StorageConfig::with_root(temp.path());
        std::fs::create_dir_all(storage.config_dir()).unwrap();
        std::fs::write(storage.ext_state_file(), "not json").unwrap();
        std::fs::write(storage.core_state_file(), "[]").unwrap();

        let launcher = RecordingLauncher::default();
        let probe = FixedProbe(true);
        let mut coordinator = HandshakeCoordinator::new(
            HandshakeStore::new(&storage, RetryPolicy::immediate(1)),
            &launcher,
            &probe,
            timings(),
        );
        let outcome = coordinator.handle(9, Operation::Assessment).unwrap();
        assert!(matches!(outcome, HandshakeOutcome::StartedFresh { .. }));
    }
}
