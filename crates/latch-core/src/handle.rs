//! TaskHandle: one leased task plus the right to report its outcome once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;

use crate::domain::{
    BusinessError, ExternalTask, Failure, Outcome, TaskId, VariableValue, Variables, WorkerId,
};
use crate::error::{ErrorKind, LatchError};
use crate::lease::LeaseTracker;
use crate::ports::EngineGateway;

/// Handed to a [`TaskHandler`](crate::handler::TaskHandler) for exactly one
/// leased task.
///
/// The terminal methods ([`complete`](Self::complete),
/// [`report_business_error`](Self::report_business_error),
/// [`report_failure`](Self::report_failure)) are mutually exclusive: the
/// first call wins and every later call returns
/// [`LatchError::AlreadyReported`] without contacting the engine.
///
/// The blocking methods must be called from a blocking context (handlers
/// run on `spawn_blocking`). Async callers use [`report`](Self::report).
pub struct TaskHandle {
    task: ExternalTask,
    gateway: Arc<dyn EngineGateway>,
    tracker: Arc<LeaseTracker>,
    runtime: Handle,
    reported: AtomicBool,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task", &self.task)
            .field("reported", &self.is_reported())
            .finish_non_exhaustive()
    }
}

impl TaskHandle {
    pub(crate) fn new(
        task: ExternalTask,
        gateway: Arc<dyn EngineGateway>,
        tracker: Arc<LeaseTracker>,
        runtime: Handle,
    ) -> Self {
        Self {
            task,
            gateway,
            tracker,
            runtime,
            reported: AtomicBool::new(false),
        }
    }

    pub fn task(&self) -> &ExternalTask {
        &self.task
    }

    pub fn id(&self) -> &TaskId {
        &self.task.id
    }

    pub fn topic(&self) -> &str {
        &self.task.topic
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.task.worker_id
    }

    pub fn variables(&self) -> &Variables {
        &self.task.variables
    }

    pub fn variable(&self, name: &str) -> Option<&VariableValue> {
        self.task.variables.get(name)
    }

    pub fn activity_id(&self) -> Option<&str> {
        self.task.activity_id.as_deref()
    }

    pub fn business_key(&self) -> Option<&str> {
        self.task.business_key.as_deref()
    }

    pub fn process_instance_id(&self) -> Option<&str> {
        self.task.process_instance_id.as_deref()
    }

    pub fn retries(&self) -> Option<u32> {
        self.task.retries
    }

    pub fn lock_expiration(&self) -> DateTime<Utc> {
        self.task.lock_expiration
    }

    /// Whether a terminal operation has been attempted on this handle.
    pub fn is_reported(&self) -> bool {
        self.reported.load(Ordering::Acquire)
    }

    /// Finish the task with output variables.
    pub fn complete(&self, variables: Variables) -> Result<(), LatchError> {
        self.runtime.block_on(self.report(Outcome::complete(variables)))
    }

    /// Raise a named business error the process definition can catch.
    pub fn report_business_error(
        &self,
        code: impl Into<String>,
        message: impl Into<String>,
        variables: Variables,
    ) -> Result<(), LatchError> {
        let error = BusinessError::new(code, message).with_variables(variables);
        self.runtime.block_on(self.report(error.into()))
    }

    /// Record a technical failure. `retries == 0` raises an incident.
    pub fn report_failure(
        &self,
        message: impl Into<String>,
        details: Option<String>,
        retries: u32,
        retry_timeout: Duration,
    ) -> Result<(), LatchError> {
        let mut failure = Failure::new(message, retries, retry_timeout);
        failure.details = details;
        self.runtime.block_on(self.report(failure.into()))
    }

    /// Extend the lease to `now + new_duration`. Not a terminal operation.
    pub fn extend_lock(&self, new_duration: Duration) -> Result<(), LatchError> {
        self.runtime.block_on(self.extend_lock_async(new_duration))
    }

    /// Forward one terminal outcome.
    ///
    /// Order: one-shot guard, lease check, gateway call, lease release.
    /// The lease entry is released whatever the gateway answers.
    pub async fn report(&self, outcome: Outcome) -> Result<(), LatchError> {
        if self.reported.swap(true, Ordering::AcqRel) {
            let err = LatchError::AlreadyReported {
                task_id: self.task.id.clone(),
            };
            tracing::error!(
                worker_id = %self.task.worker_id,
                topic = %self.task.topic,
                task_id = %self.task.id,
                outcome = outcome.label(),
                "second terminal report on the same task handle"
            );
            return Err(err);
        }

        if let Err(e) = self.tracker.begin_report(&self.task.id) {
            self.log_rejected(&outcome, &e);
            return Err(e);
        }

        let result = self
            .gateway
            .report(&self.task.id, &self.task.worker_id, &outcome)
            .await;
        self.tracker.release(&self.task.id);

        match &result {
            Ok(()) => {
                if let Outcome::Failure(failure) = &outcome
                    && failure.is_terminal()
                {
                    tracing::error!(
                        worker_id = %self.task.worker_id,
                        topic = %self.task.topic,
                        task_id = %self.task.id,
                        error_message = %failure.message,
                        "task failed with no retries left, engine raises an incident"
                    );
                } else {
                    tracing::info!(
                        worker_id = %self.task.worker_id,
                        topic = %self.task.topic,
                        task_id = %self.task.id,
                        outcome = outcome.label(),
                        "outcome reported"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    worker_id = %self.task.worker_id,
                    topic = %self.task.topic,
                    task_id = %self.task.id,
                    outcome = outcome.label(),
                    error = %e,
                    "engine did not accept outcome"
                );
            }
        }
        result
    }

    async fn extend_lock_async(&self, new_duration: Duration) -> Result<(), LatchError> {
        if self.is_reported() {
            return Err(LatchError::AlreadyReported {
                task_id: self.task.id.clone(),
            });
        }
        let now = self.tracker.now();
        if !self.tracker.is_valid(&self.task.id, now) {
            return Err(LatchError::UnknownLease {
                task_id: self.task.id.clone(),
            });
        }
        let new_expiration = chrono::Duration::from_std(new_duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .ok_or_else(|| LatchError::config(format!("lock extension {new_duration:?} is out of range")))?;

        self.gateway
            .extend_lock(&self.task.id, &self.task.worker_id, new_duration)
            .await?;
        self.tracker.extend(&self.task.id, new_expiration)?;

        tracing::debug!(
            topic = %self.task.topic,
            task_id = %self.task.id,
            lock_expiration = %new_expiration,
            "lock extended"
        );
        Ok(())
    }

    fn log_rejected(&self, outcome: &Outcome, error: &LatchError) {
        if error.kind() == ErrorKind::Misuse {
            tracing::error!(
                worker_id = %self.task.worker_id,
                topic = %self.task.topic,
                task_id = %self.task.id,
                outcome = outcome.label(),
                error = %error,
                "outcome reported on a task this worker does not hold"
            );
        } else {
            tracing::warn!(
                worker_id = %self.task.worker_id,
                topic = %self.task.topic,
                task_id = %self.task.id,
                outcome = outcome.label(),
                error = %error,
                "lease no longer valid, outcome not forwarded"
            );
        }
    }
}
