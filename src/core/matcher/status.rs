//! Shared, thread-safe state machine for long-running stages.

use crate::core::model::{StageState, StageStatus};
use std::sync::{Arc, Mutex, MutexGuard};

/// Handle to a `Stopped -> InProgress -> {Done, Failed}` state machine
///
/// Clones share the same state. The owner of a run moves it forward;
/// everyone else only reads snapshots.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    inner: Arc<Mutex<StageStatus>>,
}

impl StatusHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StageStatus::stopped())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StageStatus> {
        // A panicking writer cannot leave the status half-updated
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state and progress
    pub fn snapshot(&self) -> StageStatus {
        self.lock().clone()
    }

    pub fn state(&self) -> StageState {
        self.lock().state
    }

    /// Claim a new run.
    ///
    /// While a run is in progress this changes nothing and returns the
    /// current status as `Err`. Otherwise progress resets to zero and the
    /// state becomes `InProgress`.
    pub fn try_begin(&self) -> Result<StageStatus, StageStatus> {
        let mut status = self.lock();
        if status.state == StageState::InProgress {
            return Err(status.clone());
        }
        status.state = StageState::InProgress;
        status.processed = 0;
        Ok(status.clone())
    }

    /// Add to the processed counter
    pub fn record_progress(&self, produced: u64) {
        self.lock().processed += produced;
    }

    pub fn mark_done(&self) {
        self.lock().state = StageState::Done;
    }

    pub fn mark_failed(&self) {
        self.lock().state = StageState::Failed;
    }
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}
