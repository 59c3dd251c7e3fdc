//! Supervisor - サブスクリプションのライフサイクル管理
//!
//! - `subscribe` ごとに Poller を 1 つ spawn
//! - `stop()` で全 Poller に shutdown を送り、drain を待ってから gateway を close
//!   (並行して呼ばれても全員が同じ完了を待つ)
//! - shutdown は watch::Sender<bool> を 1 本だけ持って配る

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{OnceCell, watch};
use tokio::task::JoinHandle;

use crate::app::poller::{Poller, Subscription};
use crate::app::status::{PollerState, SubscriptionStatus};
use crate::config::{SubscriptionConfig, WorkerConfig};
use crate::domain::WorkerId;
use crate::error::LatchError;
use crate::handler::TaskHandler;
use crate::lease::LeaseTracker;
use crate::ports::{Clock, EngineGateway, SystemClock};

/// Ordered, non-empty list of equivalent topic names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics(Vec<String>);

impl Topics {
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    fn validate(&self) -> Result<(), LatchError> {
        if self.0.is_empty() {
            return Err(LatchError::config("a subscription needs at least one topic"));
        }
        if let Some(blank) = self.0.iter().find(|t| t.trim().is_empty()) {
            return Err(LatchError::config(format!("invalid topic name {blank:?}")));
        }
        Ok(())
    }
}

impl From<&str> for Topics {
    fn from(topic: &str) -> Self {
        Topics(vec![topic.to_string()])
    }
}

impl From<String> for Topics {
    fn from(topic: String) -> Self {
        Topics(vec![topic])
    }
}

impl From<Vec<String>> for Topics {
    fn from(topics: Vec<String>) -> Self {
        Topics(topics)
    }
}

impl From<&[&str]> for Topics {
    fn from(topics: &[&str]) -> Self {
        Topics(topics.iter().map(|t| t.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Topics {
    fn from(topics: [&str; N]) -> Self {
        Topics(topics.iter().map(|t| t.to_string()).collect())
    }
}

struct Running {
    topics: Vec<String>,
    max_tasks: u32,
    state: watch::Receiver<PollerState>,
    tracker: Arc<LeaseTracker>,
    join: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Registry {
    stopped: bool,
    running: Vec<Running>,
}

/// Owns the subscriptions of one worker and the gateway they share.
pub struct Supervisor {
    config: WorkerConfig,
    gateway: Arc<dyn EngineGateway>,
    clock: Arc<dyn Clock>,
    shutdown_tx: watch::Sender<bool>,
    stopped: OnceCell<()>,
    registry: Mutex<Registry>,
}

impl Supervisor {
    pub fn new(gateway: Arc<dyn EngineGateway>, config: WorkerConfig) -> Result<Self, LatchError> {
        Self::with_clock(gateway, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        gateway: Arc<dyn EngineGateway>,
        config: WorkerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LatchError> {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            gateway,
            clock,
            shutdown_tx,
            stopped: OnceCell::new(),
            registry: Mutex::new(Registry::default()),
        })
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe with the worker's default subscription config.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(
        &self,
        topics: impl Into<Topics>,
        handler: impl TaskHandler,
    ) -> Result<(), LatchError> {
        self.subscribe_with(topics, handler, self.config.subscription.clone())
    }

    pub fn subscribe_with(
        &self,
        topics: impl Into<Topics>,
        handler: impl TaskHandler,
        config: SubscriptionConfig,
    ) -> Result<(), LatchError> {
        let topics = topics.into();
        topics.validate()?;
        config.validate()?;

        let mut registry = self.registry();
        if registry.stopped {
            return Err(LatchError::Stopped);
        }
        for topic in topics.as_slice() {
            let taken = registry
                .running
                .iter()
                .any(|r| r.topics.contains(topic));
            if taken {
                return Err(LatchError::DuplicateSubscription(topic.clone()));
            }
        }

        let max_tasks = config.max_tasks;
        let poller = Poller::new(
            self.config.worker_id.clone(),
            Subscription {
                topics: topics.0.clone(),
                handler: Arc::new(handler),
                config,
            },
            Arc::clone(&self.gateway),
            Arc::clone(&self.clock),
            self.config.shutdown_grace,
        );
        let state = poller.state();
        let tracker = poller.tracker();
        let join = tokio::spawn(poller.run(self.shutdown_tx.subscribe()));

        tracing::info!(
            worker_id = %self.config.worker_id,
            topics = %topics.0.join(","),
            max_tasks,
            "subscribed"
        );
        registry.running.push(Running {
            topics: topics.0,
            max_tasks,
            state,
            tracker,
            join: Some(join),
        });
        Ok(())
    }

    /// Stop every poller, wait for them to drain, then close the gateway.
    ///
    /// Only the first call does anything; later calls return immediately.
    pub async fn stop(&self) {
        self.stopped.get_or_init(|| self.shutdown_and_join()).await;
    }

    async fn shutdown_and_join(&self) {
        let joins: Vec<JoinHandle<()>> = {
            let mut registry = self.registry();
            registry.stopped = true;
            registry
                .running
                .iter_mut()
                .filter_map(|r| r.join.take())
                .collect()
        };

        tracing::info!(
            worker_id = %self.config.worker_id,
            subscriptions = joins.len(),
            "stopping worker"
        );
        self.shutdown_tx.send_replace(true);
        for join in joins {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "poller task ended abnormally");
            }
        }

        self.gateway.close().await;
        tracing::info!(worker_id = %self.config.worker_id, "worker stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.registry().stopped
    }

    /// Snapshot of every subscription, in subscription order.
    pub fn status(&self) -> Vec<SubscriptionStatus> {
        self.registry()
            .running
            .iter()
            .map(|r| SubscriptionStatus {
                topics: r.topics.clone(),
                state: *r.state.borrow(),
                leases_held: r.tracker.len(),
                max_tasks: r.max_tasks,
            })
            .collect()
    }

    /// Topics served by active subscriptions.
    pub fn topics(&self) -> Vec<String> {
        let registry = self.registry();
        if registry.stopped {
            return Vec::new();
        }
        registry
            .running
            .iter()
            .flat_map(|r| r.topics.iter().cloned())
            .collect()
    }

    pub fn shutdown_grace(&self) -> Duration {
        self.config.shutdown_grace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, Variables};
    use crate::handle::TaskHandle;
    use crate::handler::HandlerResult;
    use crate::impls::{EngineTaskState, GatewayCall, InMemoryEngine};
    use rstest::rstest;
    use std::sync::mpsc;

    fn quick() -> SubscriptionConfig {
        SubscriptionConfig {
            async_response_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            ..SubscriptionConfig::default()
        }
    }

    fn supervisor(engine: &Arc<InMemoryEngine>) -> Supervisor {
        let config = WorkerConfig::new("worker-1")
            .with_subscription(quick())
            .with_shutdown_grace(Duration::from_secs(1));
        Supervisor::new(engine.clone(), config).unwrap()
    }

    fn noop(_task: &TaskHandle) -> HandlerResult {
        Ok(())
    }

    async fn wait_for_terminal(engine: &InMemoryEngine, task_id: &TaskId) -> Vec<GatewayCall> {
        for _ in 0..300 {
            let calls = engine.terminal_calls_for(task_id).await;
            if !calls.is_empty() {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no outcome reported for {task_id}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn step_one_tasks_are_completed() {
        let engine = Arc::new(InMemoryEngine::new());
        let sup = supervisor(&engine);
        sup.subscribe("STEP_1", |task: &TaskHandle| -> HandlerResult {
            task.complete(Variables::new().with("result", "continue"))?;
            Ok(())
        })
        .unwrap();

        let a = engine.publish("STEP_1", Variables::new()).await;
        let b = engine.publish("STEP_1", Variables::new()).await;
        wait_for_terminal(&engine, &a).await;
        wait_for_terminal(&engine, &b).await;
        sup.stop().await;

        assert_eq!(engine.calls().await.len(), 2);
        for id in [&a, &b] {
            let Some(EngineTaskState::Completed { variables }) = engine.state_of(id).await else {
                panic!("task {id} was not completed");
            };
            assert_eq!(variables.get_str("result"), Some("continue"));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn business_error_then_second_call_is_rejected() {
        let engine = Arc::new(InMemoryEngine::new());
        let sup = supervisor(&engine);
        let (tx, rx) = mpsc::channel();
        sup.subscribe("STEP_2", move |task: &TaskHandle| -> HandlerResult {
            task.report_business_error("reject", "FRAUD", Variables::new())?;
            tx.send(task.complete(Variables::new())).ok();
            Ok(())
        })
        .unwrap();

        let id = engine.publish("STEP_2", Variables::new()).await;
        let calls = wait_for_terminal(&engine, &id).await;
        let second = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(3)))
            .await
            .unwrap()
            .unwrap();
        sup.stop().await;

        assert!(matches!(second, Err(LatchError::AlreadyReported { .. })));
        assert_eq!(engine.terminal_calls_for(&id).await.len(), 1);
        assert!(matches!(
            &calls[0],
            GatewayCall::BusinessError { error, .. } if error.code == "reject" && error.message == "FRAUD"
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_topic_is_rejected() {
        let engine = Arc::new(InMemoryEngine::new());
        let sup = supervisor(&engine);
        sup.subscribe(["STEP_1", "STEP_1_LEGACY"], noop).unwrap();

        let dup = sup.subscribe("STEP_1_LEGACY", noop);
        assert!(matches!(dup, Err(LatchError::DuplicateSubscription(t)) if t == "STEP_1_LEGACY"));

        sup.subscribe("STEP_2", noop).unwrap();
        assert_eq!(sup.topics(), vec!["STEP_1", "STEP_1_LEGACY", "STEP_2"]);
        sup.stop().await;
    }

    #[rstest]
    #[case(Topics::from(Vec::<String>::new()))]
    #[case(Topics::from(" "))]
    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_topics_are_rejected(#[case] topics: Topics) {
        let engine = Arc::new(InMemoryEngine::new());
        let sup = supervisor(&engine);
        assert!(matches!(sup.subscribe(topics, noop), Err(LatchError::Config(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_subscription_config_is_rejected() {
        let engine = Arc::new(InMemoryEngine::new());
        let sup = supervisor(&engine);
        let config = SubscriptionConfig {
            max_tasks: 0,
            ..quick()
        };
        assert!(matches!(
            sup.subscribe_with("STEP_1", noop, config),
            Err(LatchError::Config(_))
        ));
        assert!(sup.topics().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_is_idempotent_and_closes_once() {
        let engine = Arc::new(InMemoryEngine::new());
        let sup = supervisor(&engine);
        sup.subscribe("STEP_1", noop).unwrap();
        sup.subscribe("STEP_2", noop).unwrap();

        sup.stop().await;
        sup.stop().await;

        assert_eq!(engine.close_count().await, 1);
        assert!(sup.is_stopped());
        assert!(sup.topics().is_empty());
        assert!(sup.status().iter().all(|s| s.state == PollerState::Stopped));
        assert!(matches!(sup.subscribe("STEP_3", noop), Err(LatchError::Stopped)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_stops_both_wait_for_the_drain() {
        let engine = Arc::new(InMemoryEngine::new());
        let sup = supervisor(&engine);
        let (tx, rx) = mpsc::channel();
        sup.subscribe("STEP_1", move |task: &TaskHandle| -> HandlerResult {
            tx.send(()).ok();
            std::thread::sleep(Duration::from_millis(300));
            task.complete(Variables::new())?;
            Ok(())
        })
        .unwrap();

        let id = engine.publish("STEP_1", Variables::new()).await;
        tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(3)))
            .await
            .unwrap()
            .unwrap();

        let stop_and_look = || async {
            sup.stop().await;
            (sup.status(), engine.close_count().await)
        };
        let ((first, first_closes), (second, second_closes)) =
            tokio::join!(stop_and_look(), stop_and_look());

        for status in [&first, &second] {
            assert!(status.iter().all(|s| s.state == PollerState::Stopped));
            assert!(status.iter().all(|s| s.leases_held == 0));
        }
        assert_eq!(first_closes, 1);
        assert_eq!(second_closes, 1);
        assert!(matches!(
            engine.state_of(&id).await,
            Some(EngineTaskState::Completed { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn status_reports_per_subscription() {
        let engine = Arc::new(InMemoryEngine::new());
        let sup = supervisor(&engine);
        let config = SubscriptionConfig {
            max_tasks: 4,
            ..quick()
        };
        sup.subscribe_with("STEP_1", noop, config).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let status = sup.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].topics, vec!["STEP_1"]);
        assert_eq!(status[0].max_tasks, 4);
        assert_eq!(status[0].leases_held, 0);
        assert!(!status[0].state.is_stopped());
        sup.stop().await;
    }

    #[test]
    fn rejects_invalid_worker_config() {
        let engine = Arc::new(InMemoryEngine::new());
        let config = WorkerConfig::new("  ");
        assert!(matches!(
            Supervisor::new(engine, config),
            Err(LatchError::Config(_))
        ));
    }
}
