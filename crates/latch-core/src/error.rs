use thiserror::Error;

use crate::domain::TaskId;

/// Operational classification of a [`LatchError`].
///
/// - `Transport`: talking to the engine failed; the poll loop retries.
/// - `LockValidity`: the lease is gone (expired, taken over or finalized).
/// - `Misuse`: a handler or caller broke the reporting protocol.
/// - `Engine`: the engine rejected a request for another reason.
/// - `Config`: invalid configuration or lifecycle call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    LockValidity,
    Misuse,
    Engine,
    Config,
}

#[derive(Debug, Error)]
pub enum LatchError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("engine gateway is closed")]
    Closed,

    #[error("could not decode engine response: {0}")]
    Decode(String),

    #[error("engine rejected request ({status}): {message}")]
    Engine { status: u16, message: String },

    #[error("lock on task {task_id} expired or is held by another worker")]
    LockExpired { task_id: TaskId },

    #[error("task {task_id} not found")]
    NotFound { task_id: TaskId },

    #[error("an outcome was already reported for task {task_id}")]
    AlreadyReported { task_id: TaskId },

    #[error("no active lease for task {task_id}")]
    UnknownLease { task_id: TaskId },

    #[error("task {task_id} is already leased by this worker")]
    AlreadyLeased { task_id: TaskId },

    #[error("topic {0} already has an active subscription")]
    DuplicateSubscription(String),

    #[error("worker has been stopped")]
    Stopped,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid variable {name}: {reason}")]
    InvalidVariable { name: String, reason: String },
}

impl LatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LatchError::Http(_)
            | LatchError::Transport(_)
            | LatchError::Closed
            | LatchError::Decode(_) => ErrorKind::Transport,
            LatchError::LockExpired { .. } | LatchError::NotFound { .. } => {
                ErrorKind::LockValidity
            }
            LatchError::AlreadyReported { .. }
            | LatchError::UnknownLease { .. }
            | LatchError::AlreadyLeased { .. } => ErrorKind::Misuse,
            LatchError::Engine { .. } => ErrorKind::Engine,
            LatchError::DuplicateSubscription(_)
            | LatchError::Stopped
            | LatchError::Config(_)
            | LatchError::InvalidVariable { .. } => ErrorKind::Config,
        }
    }

    pub fn is_misuse(&self) -> bool {
        self.kind() == ErrorKind::Misuse
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        LatchError::Config(message.into())
    }

    pub(crate) fn zero_duration(field: &str) -> Self {
        LatchError::Config(format!("{field} must be greater than zero"))
    }
}
