//! Configuration values.
//!
//! Every subscription receives an explicit [`SubscriptionConfig`]; there is
//! no process-wide default object. `from_env` constructors read `LATCH_*`
//! variables and fall back to the defaults documented on each type.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::WorkerId;
use crate::error::LatchError;

/// Per-subscription polling and retry settings.
///
/// Deserializes from milliseconds and accepts the engine client's
/// camelCase keys (`maxTasks`, `lockDuration`, `asyncResponseTimeout`,
/// `retries`, `retryTimeout`, `sleepSeconds`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSubscriptionConfig", into = "RawSubscriptionConfig")]
pub struct SubscriptionConfig {
    /// Upper bound of tasks per fetch, and of concurrently running handlers.
    pub max_tasks: u32,
    /// How long a granted lease lasts.
    pub lock_duration: Duration,
    /// Long-poll budget of a single fetch-and-lock call.
    pub async_response_timeout: Duration,
    /// Retry count used on the first technical failure of a task.
    pub retries: u32,
    /// Delay before a failed task becomes fetchable again.
    pub retry_timeout: Duration,
    /// Sleep between fetch cycles.
    pub poll_interval: Duration,
    /// Growth factor applied to `retry_timeout` for repeated failures.
    pub retry_backoff_multiplier: f64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            max_tasks: 1,
            lock_duration: Duration::from_millis(10_000),
            async_response_timeout: Duration::from_millis(30_000),
            retries: 3,
            retry_timeout: Duration::from_millis(5_000),
            poll_interval: Duration::from_secs(30),
            retry_backoff_multiplier: 1.0,
        }
    }
}

impl SubscriptionConfig {
    pub fn validate(&self) -> Result<(), LatchError> {
        if self.max_tasks == 0 {
            return Err(LatchError::config("max_tasks must be at least 1"));
        }
        if self.lock_duration.is_zero() {
            return Err(LatchError::zero_duration("lock_duration"));
        }
        if self.poll_interval.is_zero() {
            return Err(LatchError::zero_duration("poll_interval"));
        }
        if !self.retry_backoff_multiplier.is_finite() || self.retry_backoff_multiplier < 1.0 {
            return Err(LatchError::config(format!(
                "retry_backoff_multiplier must be a finite number >= 1.0, got {}",
                self.retry_backoff_multiplier
            )));
        }
        Ok(())
    }

    /// Read overrides from `LATCH_*` environment variables.
    pub fn from_env() -> Result<Self, LatchError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LatchError> {
        let defaults = Self::default();
        let config = Self {
            max_tasks: parse_var(&lookup, "LATCH_MAX_TASKS")?.unwrap_or(defaults.max_tasks),
            lock_duration: parse_millis(&lookup, "LATCH_LOCK_DURATION_MS")?
                .unwrap_or(defaults.lock_duration),
            async_response_timeout: parse_millis(&lookup, "LATCH_ASYNC_RESPONSE_TIMEOUT_MS")?
                .unwrap_or(defaults.async_response_timeout),
            retries: parse_var(&lookup, "LATCH_RETRIES")?.unwrap_or(defaults.retries),
            retry_timeout: parse_millis(&lookup, "LATCH_RETRY_TIMEOUT_MS")?
                .unwrap_or(defaults.retry_timeout),
            poll_interval: parse_millis(&lookup, "LATCH_POLL_INTERVAL_MS")?
                .unwrap_or(defaults.poll_interval),
            retry_backoff_multiplier: parse_var(&lookup, "LATCH_RETRY_BACKOFF")?
                .unwrap_or(defaults.retry_backoff_multiplier),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSubscriptionConfig {
    #[serde(alias = "max_tasks", skip_serializing_if = "Option::is_none")]
    max_tasks: Option<u32>,
    #[serde(alias = "lock_duration", skip_serializing_if = "Option::is_none")]
    lock_duration: Option<u64>,
    #[serde(alias = "async_response_timeout", skip_serializing_if = "Option::is_none")]
    async_response_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retries: Option<u32>,
    #[serde(alias = "retry_timeout", skip_serializing_if = "Option::is_none")]
    retry_timeout: Option<u64>,
    #[serde(alias = "poll_interval", skip_serializing_if = "Option::is_none")]
    poll_interval: Option<u64>,
    /// Seconds; only read, `pollInterval` wins when both are present.
    #[serde(alias = "sleep_seconds", skip_serializing)]
    sleep_seconds: Option<u64>,
    #[serde(alias = "retry_backoff_multiplier", skip_serializing_if = "Option::is_none")]
    retry_backoff_multiplier: Option<f64>,
}

impl TryFrom<RawSubscriptionConfig> for SubscriptionConfig {
    type Error = LatchError;

    fn try_from(raw: RawSubscriptionConfig) -> Result<Self, Self::Error> {
        let defaults = SubscriptionConfig::default();
        let poll_interval = raw
            .poll_interval
            .map(Duration::from_millis)
            .or(raw.sleep_seconds.map(Duration::from_secs))
            .unwrap_or(defaults.poll_interval);

        let config = SubscriptionConfig {
            max_tasks: raw.max_tasks.unwrap_or(defaults.max_tasks),
            lock_duration: raw
                .lock_duration
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_duration),
            async_response_timeout: raw
                .async_response_timeout
                .map(Duration::from_millis)
                .unwrap_or(defaults.async_response_timeout),
            retries: raw.retries.unwrap_or(defaults.retries),
            retry_timeout: raw
                .retry_timeout
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_timeout),
            poll_interval,
            retry_backoff_multiplier: raw
                .retry_backoff_multiplier
                .unwrap_or(defaults.retry_backoff_multiplier),
        };
        config.validate()?;
        Ok(config)
    }
}

impl From<SubscriptionConfig> for RawSubscriptionConfig {
    fn from(config: SubscriptionConfig) -> Self {
        Self {
            max_tasks: Some(config.max_tasks),
            lock_duration: Some(millis(config.lock_duration)),
            async_response_timeout: Some(millis(config.async_response_timeout)),
            retries: Some(config.retries),
            retry_timeout: Some(millis(config.retry_timeout)),
            poll_interval: Some(millis(config.poll_interval)),
            sleep_seconds: None,
            retry_backoff_multiplier: Some(config.retry_backoff_multiplier),
        }
    }
}

/// Settings owned by one worker (supervisor) instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Lease holder id sent with every engine call.
    pub worker_id: WorkerId,
    /// Used by `subscribe` when no explicit subscription config is given.
    pub subscription: SubscriptionConfig,
    /// How long `stop()` lets in-flight handlers finish before abandoning them.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::generate(),
            subscription: SubscriptionConfig::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<WorkerId>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Self::default()
        }
    }

    pub fn with_subscription(mut self, subscription: SubscriptionConfig) -> Self {
        self.subscription = subscription;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn validate(&self) -> Result<(), LatchError> {
        if self.worker_id.as_str().trim().is_empty() {
            return Err(LatchError::config("worker_id must not be empty"));
        }
        self.subscription.validate()
    }

    pub fn from_env() -> Result<Self, LatchError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LatchError> {
        let defaults = Self::default();
        let config = Self {
            worker_id: lookup("LATCH_WORKER_ID")
                .map(WorkerId::new)
                .unwrap_or(defaults.worker_id),
            subscription: SubscriptionConfig::from_lookup(&lookup)?,
            shutdown_grace: parse_millis(&lookup, "LATCH_SHUTDOWN_GRACE_MS")?
                .unwrap_or(defaults.shutdown_grace),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Credentials attached to every engine request.
#[derive(Clone, PartialEq, Default)]
pub enum EngineAuth {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer(String),
}

impl fmt::Debug for EngineAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineAuth::None => f.write_str("None"),
            EngineAuth::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            EngineAuth::Bearer(_) => f.write_str("Bearer(***)"),
        }
    }
}

/// Where and how to reach the engine's REST API.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// e.g. `http://localhost:8080/engine-rest`
    pub base_url: String,
    pub auth: EngineAuth,
    /// Restricts fetch-and-lock to one tenant when set.
    pub tenant_id: Option<String>,
    /// Timeout of non-fetch calls; fetches use the long-poll budget plus a margin.
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/engine-rest".to_string(),
            auth: EngineAuth::None,
            tenant_id: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_auth(mut self, auth: EngineAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn from_env() -> Result<Self, LatchError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LatchError> {
        let defaults = Self::default();

        let auth = match (
            lookup("LATCH_ENGINE_TOKEN"),
            lookup("LATCH_ENGINE_USERNAME"),
            lookup("LATCH_ENGINE_PASSWORD"),
        ) {
            (Some(token), None, None) => EngineAuth::Bearer(token),
            (None, Some(username), Some(password)) => EngineAuth::Basic { username, password },
            (None, None, None) => EngineAuth::None,
            _ => {
                return Err(LatchError::config(
                    "set either LATCH_ENGINE_TOKEN or both LATCH_ENGINE_USERNAME and LATCH_ENGINE_PASSWORD",
                ));
            }
        };

        let base_url = lookup("LATCH_ENGINE_URL").unwrap_or(defaults.base_url);
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(LatchError::config(format!(
                "LATCH_ENGINE_URL must be an http(s) url, got {base_url}"
            )));
        }

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            tenant_id: lookup("LATCH_TENANT_ID"),
            request_timeout: parse_millis(&lookup, "LATCH_REQUEST_TIMEOUT_MS")?
                .unwrap_or(defaults.request_timeout),
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, LatchError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| LatchError::config(format!("{key}={raw}: {e}")))
        })
        .transpose()
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<Duration>, LatchError> {
    Ok(parse_var::<u64>(lookup, key)?.map(Duration::from_millis))
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
