//! EngineGateway port: the remote calls a worker makes.
//!
//! Implementations perform the remote call and nothing else. Local lease
//! bookkeeping belongs to [`LeaseTracker`](crate::lease::LeaseTracker).

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{BusinessError, ExternalTask, Failure, Outcome, TaskId, Variables, WorkerId};
use crate::error::LatchError;

/// Parameters of one fetch-and-lock call.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub worker_id: WorkerId,
    /// Equivalent topics served by one subscription.
    pub topics: Vec<String>,
    pub max_tasks: u32,
    pub lock_duration: Duration,
    /// Server-side long-poll budget.
    pub async_response_timeout: Duration,
}

impl FetchRequest {
    pub fn validate(&self) -> Result<(), LatchError> {
        if self.max_tasks == 0 {
            return Err(LatchError::config("fetch-and-lock needs max_tasks >= 1"));
        }
        if self.lock_duration.is_zero() {
            return Err(LatchError::zero_duration("lock_duration"));
        }
        if self.topics.is_empty() {
            return Err(LatchError::config("fetch-and-lock needs at least one topic"));
        }
        Ok(())
    }
}

/// Remote engine operations. Must be safe for concurrent use by all pollers.
#[async_trait]
pub trait EngineGateway: Send + Sync {
    /// Lease up to `max_tasks` tasks, waiting up to the long-poll budget.
    async fn fetch_and_lock(&self, request: &FetchRequest) -> Result<Vec<ExternalTask>, LatchError>;

    async fn complete(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        variables: &Variables,
    ) -> Result<(), LatchError>;

    async fn report_business_error(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        error: &BusinessError,
    ) -> Result<(), LatchError>;

    async fn report_failure(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        failure: &Failure,
    ) -> Result<(), LatchError>;

    /// Push the lock expiration to `now + new_duration`.
    async fn extend_lock(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        new_duration: Duration,
    ) -> Result<(), LatchError>;

    /// Release the transport. Later calls fail with [`LatchError::Closed`].
    async fn close(&self) {}

    /// Forward a terminal outcome to the matching call.
    async fn report(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        outcome: &Outcome,
    ) -> Result<(), LatchError> {
        match outcome {
            Outcome::Complete { variables } => self.complete(task_id, worker_id, variables).await,
            Outcome::BusinessError(error) => {
                self.report_business_error(task_id, worker_id, error).await
            }
            Outcome::Failure(failure) => self.report_failure(task_id, worker_id, failure).await,
        }
    }
}
