//! Retry policy: the `retries` / `retry_timeout` pair sent with automatic
//! failure reports.

use std::time::Duration;

use crate::config::SubscriptionConfig;
use crate::domain::{ExternalTask, Failure};

/// Retry policy for handler crashes.
///
/// The first failure of a task uses the configured retry count minus one.
/// After that the engine owns the counter, so each further failure
/// decrements what the engine handed back with the task.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retry count assumed before the first reported failure.
    pub initial_retries: u32,

    /// Delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier; `1.0` keeps the delay fixed.
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &SubscriptionConfig) -> Self {
        Self {
            initial_retries: config.retries,
            base_delay: config.retry_timeout,
            multiplier: config.retry_backoff_multiplier,
        }
    }

    /// Remaining retries to report for this failure.
    pub fn remaining_after_failure(&self, current: Option<u32>) -> u32 {
        current
            .unwrap_or(self.initial_retries)
            .saturating_sub(1)
    }

    /// 1-based number of the failure about to be reported.
    pub fn failure_number(&self, current: Option<u32>) -> u32 {
        match current {
            None => 1,
            Some(left) => self.initial_retries.saturating_sub(left) + 1,
        }
    }

    /// delay = base_delay * multiplier^(failure - 1)
    pub fn next_delay(&self, failure: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        // u32 の上半分は i32 に収まらない。折り返さず上限で止める
        let exponent = i32::try_from(failure.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_secs = base_secs * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::MAX)
    }

    /// Build the failure report for a crashed handler.
    pub fn failure_for(
        &self,
        task: &ExternalTask,
        message: impl Into<String>,
        details: Option<String>,
    ) -> Failure {
        let failure = Failure::new(
            message,
            self.remaining_after_failure(task.retries),
            self.next_delay(self.failure_number(task.retries)),
        );
        match details {
            Some(details) => failure.with_details(details),
            None => failure,
        }
    }
}
