//! Poller - サブスクリプション単位の fetch → dispatch ループ
//!
//! # フロー
//! 1. 空きスロットを確保（最低 1 つ、全部埋まっていれば待つ）
//! 2. 確保したスロット数を max_tasks にして fetch-and-lock
//! 3. タスクごとに LeaseTracker へ登録し、スロットを 1 つ持たせて dispatch
//! 4. poll_interval だけ眠る（shutdown が来たら即起きる）
//!
//! handler は blocking 関数なので `spawn_blocking` で動かす。

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinSet;

use crate::app::status::PollerState;
use crate::config::SubscriptionConfig;
use crate::domain::{ExternalTask, WorkerId};
use crate::handle::TaskHandle;
use crate::handler::TaskHandler;
use crate::lease::LeaseTracker;
use crate::ports::{Clock, EngineGateway, FetchRequest};
use crate::retry::RetryPolicy;

/// Topics plus the handler serving them, with a frozen config snapshot.
#[derive(Clone)]
pub struct Subscription {
    pub topics: Vec<String>,
    pub handler: Arc<dyn TaskHandler>,
    pub config: SubscriptionConfig,
}

pub struct Poller {
    worker_id: WorkerId,
    subscription: Subscription,
    gateway: Arc<dyn EngineGateway>,
    tracker: Arc<LeaseTracker>,
    retry: RetryPolicy,
    slots: Arc<Semaphore>,
    state_tx: watch::Sender<PollerState>,
    shutdown_grace: Duration,
}

impl Poller {
    pub fn new(
        worker_id: WorkerId,
        subscription: Subscription,
        gateway: Arc<dyn EngineGateway>,
        clock: Arc<dyn Clock>,
        shutdown_grace: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(PollerState::Idle);
        Self {
            worker_id,
            retry: RetryPolicy::from_config(&subscription.config),
            slots: Arc::new(Semaphore::new(subscription.config.max_tasks as usize)),
            subscription,
            gateway,
            tracker: Arc::new(LeaseTracker::new(clock)),
            state_tx,
            shutdown_grace,
        }
    }

    pub fn tracker(&self) -> Arc<LeaseTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn state(&self) -> watch::Receiver<PollerState> {
        self.state_tx.subscribe()
    }

    pub fn topics(&self) -> &[String] {
        &self.subscription.topics
    }

    fn set_state(&self, state: PollerState) {
        self.state_tx.send_replace(state);
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped),
    /// then drain in-flight dispatches.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let topics = self.subscription.topics.join(",");
        tracing::info!(worker_id = %self.worker_id, topics = %topics, "poller started");

        let mut inflight = JoinSet::new();
        loop {
            if *shutdown.borrow() {
                break;
            }
            while let Some(done) = inflight.try_join_next() {
                log_dispatch_join(done);
            }

            self.set_state(PollerState::Fetching);
            let permits = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                permits = self.reserve_slots() => permits,
            };
            if permits.is_empty() {
                break;
            }

            let request = FetchRequest {
                worker_id: self.worker_id.clone(),
                topics: self.subscription.topics.clone(),
                max_tasks: permits.len() as u32,
                lock_duration: self.subscription.config.lock_duration,
                async_response_timeout: self.subscription.config.async_response_timeout,
            };
            // long poll 中でも shutdown が来たら fetch を捨てる
            let fetched = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                fetched = self.gateway.fetch_and_lock(&request) => fetched,
            };
            let tasks = match fetched {
                Ok(tasks) => tasks,
                Err(e) => {
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        topics = %topics,
                        error = %e,
                        "fetch-and-lock failed, retrying after poll interval"
                    );
                    Vec::new()
                }
            };

            if !tasks.is_empty() {
                self.set_state(PollerState::Dispatching);
                tracing::debug!(topics = %topics, fetched = tasks.len(), "dispatching tasks");
                self.dispatch_batch(tasks, permits, &mut inflight);
            } else {
                drop(permits);
            }

            self.set_state(PollerState::Sleeping);
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = tokio::time::sleep(self.subscription.config.poll_interval) => {}
            }
        }

        self.drain(inflight).await;
        self.set_state(PollerState::Stopped);
        tracing::info!(worker_id = %self.worker_id, topics = %topics, "poller stopped");
    }

    /// Take at least one free slot (waiting if needed) plus whatever else is free.
    async fn reserve_slots(&self) -> Vec<OwnedSemaphorePermit> {
        let Ok(first) = Arc::clone(&self.slots).acquire_owned().await else {
            return Vec::new();
        };
        let mut permits = vec![first];
        while permits.len() < self.subscription.config.max_tasks as usize {
            match Arc::clone(&self.slots).try_acquire_owned() {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }
        permits
    }

    fn dispatch_batch(
        &self,
        tasks: Vec<ExternalTask>,
        permits: Vec<OwnedSemaphorePermit>,
        inflight: &mut JoinSet<()>,
    ) {
        let runtime = Handle::current();
        let mut permits = permits.into_iter();

        for task in tasks {
            let Some(permit) = permits.next() else {
                tracing::warn!(
                    worker_id = %self.worker_id,
                    topic = %task.topic,
                    task_id = %task.id,
                    "engine returned more tasks than requested, leaving the lock to expire"
                );
                continue;
            };
            if let Err(e) = self.tracker.register(&task) {
                tracing::error!(
                    worker_id = %self.worker_id,
                    topic = %task.topic,
                    task_id = %task.id,
                    error = %e,
                    "could not register lease, task not dispatched"
                );
                continue;
            }

            let handle = Arc::new(TaskHandle::new(
                task,
                Arc::clone(&self.gateway),
                Arc::clone(&self.tracker),
                runtime.clone(),
            ));
            inflight.spawn(dispatch(
                handle,
                Arc::clone(&self.subscription.handler),
                Arc::clone(&self.tracker),
                self.retry.clone(),
                permit,
            ));
        }
    }

    /// Give in-flight dispatches `shutdown_grace`, then abandon them.
    async fn drain(&self, mut inflight: JoinSet<()>) {
        if inflight.is_empty() {
            return;
        }
        tracing::info!(
            worker_id = %self.worker_id,
            in_flight = inflight.len(),
            grace_ms = self.shutdown_grace.as_millis() as u64,
            "waiting for in-flight tasks"
        );

        let finished = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(done) = inflight.join_next().await {
                log_dispatch_join(done);
            }
        })
        .await;

        if finished.is_err() {
            inflight.shutdown().await;
            let abandoned = self.tracker.abandon_all();
            tracing::warn!(
                worker_id = %self.worker_id,
                abandoned,
                "grace period elapsed, abandoning leases"
            );
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    // sender が drop されても停止扱い
    let _ = rx.wait_for(|stop| *stop).await;
}

fn log_dispatch_join(done: Result<(), tokio::task::JoinError>) {
    if let Err(e) = done
        && e.is_panic()
    {
        tracing::error!(error = %e, "dispatch task panicked");
    }
}

/// Run one handler and clean up after it. Holds its slot until it returns.
async fn dispatch(
    handle: Arc<TaskHandle>,
    handler: Arc<dyn TaskHandler>,
    tracker: Arc<LeaseTracker>,
    retry: RetryPolicy,
    _slot: OwnedSemaphorePermit,
) {
    let for_handler = Arc::clone(&handle);
    let joined = tokio::task::spawn_blocking(move || handler.handle(&for_handler)).await;

    let (message, details) = match joined {
        Ok(Ok(())) => {
            if !handle.is_reported() {
                tracing::warn!(
                    worker_id = %handle.worker_id(),
                    topic = %handle.topic(),
                    task_id = %handle.id(),
                    "handler returned without reporting an outcome, lock left to expire"
                );
                tracker.release(handle.id());
            }
            return;
        }
        Ok(Err(e)) => (e.to_string(), Some(format!("{e:?}"))),
        Err(e) if e.is_panic() => {
            let text = panic_text(e.into_panic());
            (format!("handler panicked: {text}"), Some(text))
        }
        Err(e) => (e.to_string(), None),
    };

    if handle.is_reported() {
        tracing::error!(
            worker_id = %handle.worker_id(),
            topic = %handle.topic(),
            task_id = %handle.id(),
            error = %message,
            "handler failed after reporting an outcome"
        );
        return;
    }

    let failure = retry.failure_for(handle.task(), message, details);
    tracing::warn!(
        worker_id = %handle.worker_id(),
        topic = %handle.topic(),
        task_id = %handle.id(),
        error = %failure.message,
        retries = failure.retries,
        "handler crashed, reporting failure"
    );
    // 結果のログは report() 側で出している
    let _ = handle.report(failure.into()).await;
}

fn panic_text(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, Variables};
    use crate::error::LatchError;
    use crate::handler::HandlerResult;
    use crate::impls::{EngineTaskState, GatewayCall, InMemoryEngine};
    use crate::ports::SystemClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn quick_config(max_tasks: u32) -> SubscriptionConfig {
        SubscriptionConfig {
            max_tasks,
            lock_duration: Duration::from_secs(10),
            async_response_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            ..SubscriptionConfig::default()
        }
    }

    struct Running {
        shutdown: watch::Sender<bool>,
        state: watch::Receiver<PollerState>,
        tracker: Arc<LeaseTracker>,
        join: tokio::task::JoinHandle<()>,
    }

    impl Running {
        async fn stop(self) -> PollerState {
            self.shutdown.send_replace(true);
            self.join.await.unwrap();
            *self.state.borrow()
        }
    }

    fn start(
        engine: &Arc<InMemoryEngine>,
        topic: &str,
        config: SubscriptionConfig,
        grace: Duration,
        handler: impl TaskHandler,
    ) -> Running {
        let poller = Poller::new(
            WorkerId::new("worker-1"),
            Subscription {
                topics: vec![topic.to_string()],
                handler: Arc::new(handler),
                config,
            },
            engine.clone(),
            Arc::new(SystemClock),
            grace,
        );
        let (shutdown, rx) = watch::channel(false);
        let state = poller.state();
        let tracker = poller.tracker();
        let join = tokio::spawn(poller.run(rx));
        Running {
            shutdown,
            state,
            tracker,
            join,
        }
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
    async fn completes_every_published_task() {
        let engine = Arc::new(InMemoryEngine::new());
        let first = engine.publish("STEP_1", Variables::new()).await;
        let second = engine.publish("STEP_1", Variables::new()).await;

        let running = start(
            &engine,
            "STEP_1",
            quick_config(1),
            Duration::from_secs(1),
            |task: &TaskHandle| -> HandlerResult {
                task.complete(Variables::new().with("result", "continue"))?;
                Ok(())
            },
        );

        wait_for_terminal(&engine, &first).await;
        wait_for_terminal(&engine, &second).await;
        assert_eq!(running.stop().await, PollerState::Stopped);

        for id in [&first, &second] {
            assert!(matches!(
                engine.state_of(id).await,
                Some(EngineTaskState::Completed { .. })
            ));
        }
        assert_eq!(engine.calls().await.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn completed_batch_is_released_and_never_fetched_again() {
        let engine = Arc::new(InMemoryEngine::new());
        let first = engine.publish("STEP_1", Variables::new()).await;
        let second = engine.publish("STEP_1", Variables::new()).await;

        let running = start(
            &engine,
            "STEP_1",
            quick_config(2),
            Duration::from_secs(1),
            |task: &TaskHandle| -> HandlerResult {
                task.complete(Variables::new().with("result", "continue"))?;
                Ok(())
            },
        );

        wait_for_terminal(&engine, &first).await;
        wait_for_terminal(&engine, &second).await;

        // release は engine への転送の後なので少し待つ
        for _ in 0..100 {
            if running.tracker.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(running.tracker.is_empty());

        // 空の long poll を何回か回してから止める
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(running.stop().await, PollerState::Stopped);

        let fetches = engine.fetches().await;
        let batches: Vec<_> = fetches.iter().filter(|f| !f.returned.is_empty()).collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].max_tasks, 2);
        assert!(batches[0].returned.contains(&first));
        assert!(batches[0].returned.contains(&second));
        assert!(fetches.len() > 1);
        assert_eq!(engine.calls().await.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn never_runs_more_handlers_than_max_tasks() {
        let engine = Arc::new(InMemoryEngine::new());
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(engine.publish("STEP_1", Variables::new()).await);
        }

        let running_now = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handler = {
            let running_now = running_now.clone();
            let peak = peak.clone();
            move |task: &TaskHandle| -> HandlerResult {
                let n = running_now.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(n, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                running_now.fetch_sub(1, Ordering::SeqCst);
                task.complete(Variables::new())?;
                Ok(())
            }
        };

        let running = start(&engine, "STEP_1", quick_config(2), Duration::from_secs(1), handler);
        for id in &ids {
            wait_for_terminal(&engine, id).await;
        }
        running.stop().await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(engine.fetches().await.iter().all(|f| f.max_tasks <= 2 && f.returned.len() <= 2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn crashing_handler_gets_one_automatic_failure() {
        let engine = Arc::new(InMemoryEngine::new());
        let id = engine.publish("STEP_3", Variables::new()).await;

        let running = start(
            &engine,
            "STEP_3",
            quick_config(1),
            Duration::from_secs(1),
            |_task: &TaskHandle| -> HandlerResult { Err("boom".into()) },
        );
        let calls = wait_for_terminal(&engine, &id).await;
        running.stop().await;

        assert_eq!(calls.len(), 1);
        let GatewayCall::Failure { failure, .. } = &calls[0] else {
            panic!("expected a failure report, got {calls:?}");
        };
        assert_eq!(failure.message, "boom");
        assert_eq!(failure.retries, 2);
        assert_eq!(failure.retry_timeout, Duration::from_secs(5));
        assert_eq!(engine.retries_of(&id).await, Some(2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_handler_is_reported_as_failure() {
        let engine = Arc::new(InMemoryEngine::new());
        let id = engine.publish("STEP_3", Variables::new()).await;

        let running = start(
            &engine,
            "STEP_3",
            quick_config(1),
            Duration::from_secs(1),
            |_task: &TaskHandle| -> HandlerResult { panic!("index out of range") },
        );
        let calls = wait_for_terminal(&engine, &id).await;
        running.stop().await;

        let GatewayCall::Failure { failure, .. } = &calls[0] else {
            panic!("expected a failure report, got {calls:?}");
        };
        assert!(failure.message.contains("index out of range"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn error_after_reporting_is_not_turned_into_a_failure() {
        let engine = Arc::new(InMemoryEngine::new());
        let id = engine.publish("STEP_1", Variables::new()).await;
        let (tx, rx) = mpsc::channel();

        let running = start(
            &engine,
            "STEP_1",
            quick_config(1),
            Duration::from_secs(1),
            move |task: &TaskHandle| -> HandlerResult {
                task.complete(Variables::new())?;
                let second = task.complete(Variables::new());
                let misuse = matches!(second, Err(LatchError::AlreadyReported { .. }));
                tx.send(misuse).ok();
                second?;
                Ok(())
            },
        );
        wait_for_terminal(&engine, &id).await;
        let misuse = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(3)))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        running.stop().await;

        assert!(misuse);
        assert_eq!(engine.terminal_calls_for(&id).await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn silent_handler_releases_the_lease() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.publish("STEP_1", Variables::new()).await;
        let (tx, rx) = mpsc::channel();

        let running = start(
            &engine,
            "STEP_1",
            quick_config(1),
            Duration::from_secs(1),
            move |_task: &TaskHandle| -> HandlerResult {
                tx.send(()).ok();
                Ok(())
            },
        );
        tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(3)))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(running.tracker.is_empty());
        running.stop().await;
        assert!(engine.calls().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recovers_from_fetch_errors() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.fail_next_fetches(2).await;
        let id = engine.publish("STEP_1", Variables::new()).await;

        let running = start(
            &engine,
            "STEP_1",
            quick_config(1),
            Duration::from_secs(1),
            |task: &TaskHandle| -> HandlerResult {
                task.complete(Variables::new())?;
                Ok(())
            },
        );
        wait_for_terminal(&engine, &id).await;
        running.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn grace_period_abandons_slow_handlers() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.publish("STEP_1", Variables::new()).await;
        let (started_tx, started_rx) = mpsc::channel();
        let (result_tx, result_rx) = mpsc::channel();

        let running = start(
            &engine,
            "STEP_1",
            quick_config(1),
            Duration::from_millis(50),
            move |task: &TaskHandle| -> HandlerResult {
                started_tx.send(()).ok();
                std::thread::sleep(Duration::from_millis(300));
                result_tx.send(task.complete(Variables::new())).ok();
                Ok(())
            },
        );
        tokio::task::spawn_blocking(move || started_rx.recv_timeout(Duration::from_secs(3)))
            .await
            .unwrap()
            .unwrap();

        let tracker = running.tracker.clone();
        assert_eq!(running.stop().await, PollerState::Stopped);
        assert!(tracker.is_empty());

        let late = tokio::task::spawn_blocking(move || result_rx.recv_timeout(Duration::from_secs(3)))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(late, Err(LatchError::UnknownLease { .. })));
        assert!(engine.calls().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_interrupts_a_long_poll() {
        let engine = Arc::new(InMemoryEngine::new());
        let config = SubscriptionConfig {
            async_response_timeout: Duration::from_secs(30),
            ..quick_config(1)
        };
        let running = start(
            &engine,
            "STEP_1",
            config,
            Duration::from_secs(1),
            |_task: &TaskHandle| -> HandlerResult { Ok(()) },
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopped = tokio::time::timeout(Duration::from_secs(2), running.stop()).await;
        assert_eq!(stopped.unwrap(), PollerState::Stopped);
    }
}
