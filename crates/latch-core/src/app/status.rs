//! Status - サブスクリプションごとのスナップショット

use serde::Serialize;

/// Where a poller is in its fetch/dispatch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    Idle,
    Fetching,
    Dispatching,
    Sleeping,
    Stopped,
}

impl PollerState {
    pub fn is_stopped(self) -> bool {
        self == PollerState::Stopped
    }
}

/// Point-in-time view of one subscription.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionStatus {
    pub topics: Vec<String>,
    pub state: PollerState,
    /// Tasks this subscription currently holds a lease for.
    pub leases_held: usize,
    pub max_tasks: u32,
}
