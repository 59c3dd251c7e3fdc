//! External task: one unit of work leased from the engine.

use chrono::{DateTime, Utc};

use super::{TaskId, Variables, WorkerId};

/// Local mirror of an engine-owned external task for the lease duration.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalTask {
    pub id: TaskId,
    pub topic: String,
    pub worker_id: WorkerId,

    /// The lease is invalid at or after this instant.
    pub lock_expiration: DateTime<Utc>,

    /// `None` until the first failure is reported; the engine owns the
    /// counter afterwards.
    pub retries: Option<u32>,

    pub variables: Variables,

    pub business_key: Option<String>,
    pub process_instance_id: Option<String>,
    pub activity_id: Option<String>,
    pub tenant_id: Option<String>,
    pub priority: i64,

    /// Message of the last reported failure, if any.
    pub error_message: Option<String>,
}

impl ExternalTask {
    /// Minimal task, mostly useful for tests and the in-memory engine.
    pub fn new(
        id: impl Into<TaskId>,
        topic: impl Into<String>,
        worker_id: WorkerId,
        lock_expiration: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            worker_id,
            lock_expiration,
            retries: None,
            variables: Variables::new(),
            business_key: None,
            process_instance_id: None,
            activity_id: None,
            tenant_id: None,
            priority: 0,
            error_message: None,
        }
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn is_locked_at(&self, at: DateTime<Utc>) -> bool {
        at < self.lock_expiration
    }
}
