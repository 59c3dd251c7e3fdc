//! Lease tracker: "is this task still mine to report on?"
//!
//! One tracker per poller. An entry lives from registration (right after
//! fetch-and-lock) until the outcome forward returns, or until the lease
//! is abandoned on shutdown. All mutations go through one mutex so
//! `is_valid` readers never observe a half-applied change.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::domain::{ExternalTask, TaskId};
use crate::error::LatchError;
use crate::ports::Clock;

#[derive(Debug, Clone, PartialEq)]
pub struct LeaseEntry {
    pub lock_expiration: DateTime<Utc>,
    pub dispatched_at: DateTime<Utc>,
    /// Set once an outcome report has been accepted for forwarding.
    pub reporting: bool,
}

pub struct LeaseTracker {
    entries: Mutex<HashMap<TaskId, LeaseEntry>>,
    clock: Arc<dyn Clock>,
}

impl LeaseTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<TaskId, LeaseEntry>> {
        // 保持中に panic するコードはないので poison は無視してよい
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a freshly granted lock. Fails if this worker already holds a
    /// live lease on the same id; a stale leftover entry is replaced.
    pub fn register(&self, task: &ExternalTask) -> Result<(), LatchError> {
        let now = self.clock.now();
        let mut entries = self.entries();
        if let Some(existing) = entries.get(&task.id)
            && now < existing.lock_expiration
        {
            return Err(LatchError::AlreadyLeased {
                task_id: task.id.clone(),
            });
        }
        entries.insert(
            task.id.clone(),
            LeaseEntry {
                lock_expiration: task.lock_expiration,
                dispatched_at: now,
                reporting: false,
            },
        );
        Ok(())
    }

    /// True iff an entry exists and `at` is before its lock expiration.
    pub fn is_valid(&self, task_id: &TaskId, at: DateTime<Utc>) -> bool {
        self.entries()
            .get(task_id)
            .is_some_and(|entry| at < entry.lock_expiration)
    }

    /// Claim the right to forward an outcome for `task_id`.
    ///
    /// Exactly one caller wins; everyone else gets `AlreadyReported`. An
    /// expired lease is dropped here and never reaches the gateway.
    pub fn begin_report(&self, task_id: &TaskId) -> Result<(), LatchError> {
        let now = self.clock.now();
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(task_id) else {
            return Err(LatchError::UnknownLease {
                task_id: task_id.clone(),
            });
        };
        if entry.reporting {
            return Err(LatchError::AlreadyReported {
                task_id: task_id.clone(),
            });
        }
        if now >= entry.lock_expiration {
            entries.remove(task_id);
            return Err(LatchError::LockExpired {
                task_id: task_id.clone(),
            });
        }
        entry.reporting = true;
        Ok(())
    }

    /// Move the expiration of a live, not-yet-reported lease.
    pub fn extend(&self, task_id: &TaskId, lock_expiration: DateTime<Utc>) -> Result<(), LatchError> {
        let now = self.clock.now();
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(task_id) else {
            return Err(LatchError::UnknownLease {
                task_id: task_id.clone(),
            });
        };
        if entry.reporting {
            return Err(LatchError::AlreadyReported {
                task_id: task_id.clone(),
            });
        }
        if now >= entry.lock_expiration {
            entries.remove(task_id);
            return Err(LatchError::LockExpired {
                task_id: task_id.clone(),
            });
        }
        entry.lock_expiration = lock_expiration;
        Ok(())
    }

    /// Drop the entry. Returns whether one existed.
    pub fn release(&self, task_id: &TaskId) -> bool {
        self.entries().remove(task_id).is_some()
    }

    /// Forget every lease; the engine re-queues them once they expire.
    pub fn abandon_all(&self) -> usize {
        let mut entries = self.entries();
        let n = entries.len();
        entries.clear();
        n
    }

    pub fn get(&self, task_id: &TaskId) -> Option<LeaseEntry> {
        self.entries().get(task_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
