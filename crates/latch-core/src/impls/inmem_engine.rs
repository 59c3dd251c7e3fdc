//! InMemoryEngine - an engine gateway without an engine.
//!
//! Behaves like the remote engine as far as a worker can tell: tasks are
//! published per topic, fetch-and-lock grants time-bounded locks and
//! long-polls, failures re-queue after their retry timeout or raise an
//! incident, and the most recent calls are recorded for assertions.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::domain::{BusinessError, ExternalTask, Failure, TaskId, Variables, WorkerId};
use crate::error::LatchError;
use crate::ports::{Clock, EngineGateway, FetchRequest, SystemClock};

/// How often a waiting fetch re-checks for tasks whose retry delay passed.
const RECHECK_INTERVAL: Duration = Duration::from_millis(20);

/// Default number of gateway calls and fetches kept for inspection.
pub const DEFAULT_RECORD_LIMIT: usize = 4096;

/// Engine-side state of a task.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineTaskState {
    /// Fetchable (once any retry delay has passed and no live lock exists).
    Available,
    Completed { variables: Variables },
    BusinessError { code: String },
    /// Failure reported with no retries left.
    Incident { message: String },
}

impl EngineTaskState {
    pub fn is_final(&self) -> bool {
        !matches!(self, EngineTaskState::Available)
    }
}

/// A call that reached the gateway, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    Complete {
        task_id: TaskId,
        worker_id: WorkerId,
        variables: Variables,
    },
    BusinessError {
        task_id: TaskId,
        worker_id: WorkerId,
        error: BusinessError,
    },
    Failure {
        task_id: TaskId,
        worker_id: WorkerId,
        failure: Failure,
    },
    ExtendLock {
        task_id: TaskId,
        worker_id: WorkerId,
        new_duration: Duration,
    },
}

impl GatewayCall {
    pub fn task_id(&self) -> &TaskId {
        match self {
            GatewayCall::Complete { task_id, .. }
            | GatewayCall::BusinessError { task_id, .. }
            | GatewayCall::Failure { task_id, .. }
            | GatewayCall::ExtendLock { task_id, .. } => task_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, GatewayCall::ExtendLock { .. })
    }
}

/// One fetch-and-lock call and the task ids it returned.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRecord {
    pub worker_id: WorkerId,
    pub topics: Vec<String>,
    pub max_tasks: u32,
    pub returned: Vec<TaskId>,
}

#[derive(Debug)]
struct EngineTask {
    template: ExternalTask,
    state: EngineTaskState,
    locked_by: Option<WorkerId>,
    lock_expiration: Option<DateTime<Utc>>,
    available_at: DateTime<Utc>,
}

impl EngineTask {
    fn is_fetchable(&self, topics: &[String], now: DateTime<Utc>) -> bool {
        self.state == EngineTaskState::Available
            && topics.iter().any(|t| *t == self.template.topic)
            && self.available_at <= now
            && self.lock_expiration.is_none_or(|exp| exp <= now)
    }
}

struct EngineState {
    tasks: HashMap<TaskId, EngineTask>,
    /// Publication order; fetches hand out tasks in this order.
    order: Vec<TaskId>,
    // 古いものから捨てる
    calls: VecDeque<GatewayCall>,
    fetches: VecDeque<FetchRecord>,
    record_limit: usize,
    failing_fetches: u32,
    next_task: u64,
    closed: bool,
    close_count: u32,
}

impl EngineState {
    fn new(record_limit: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            order: Vec::new(),
            calls: VecDeque::new(),
            fetches: VecDeque::new(),
            record_limit,
            failing_fetches: 0,
            next_task: 0,
            closed: false,
            close_count: 0,
        }
    }

    fn record_call(&mut self, call: GatewayCall) {
        if self.calls.len() >= self.record_limit {
            self.calls.pop_front();
        }
        self.calls.push_back(call);
    }

    fn record_fetch(&mut self, fetch: FetchRecord) {
        if self.fetches.len() >= self.record_limit {
            self.fetches.pop_front();
        }
        self.fetches.push_back(fetch);
    }

    /// Check that `worker_id` still holds a live lock on `task_id`.
    fn locked_task(
        &mut self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<&mut EngineTask, LatchError> {
        let task = self
            .tasks
            .get_mut(task_id)
            .filter(|t| !t.state.is_final())
            .ok_or_else(|| LatchError::NotFound {
                task_id: task_id.clone(),
            })?;

        let held = task.locked_by.as_ref() == Some(worker_id)
            && task.lock_expiration.is_some_and(|exp| now < exp);
        if !held {
            return Err(LatchError::LockExpired {
                task_id: task_id.clone(),
            });
        }
        Ok(task)
    }
}

pub struct InMemoryEngine {
    state: Mutex<EngineState>,
    notify: Notify,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(EngineState::new(DEFAULT_RECORD_LIMIT)),
            notify: Notify::new(),
            clock,
        }
    }

    /// Keep at most `limit` calls and `limit` fetches; older ones are dropped.
    pub fn with_record_limit(mut self, limit: usize) -> Self {
        self.state.get_mut().record_limit = limit.max(1);
        self
    }

    /// Publish a new task for `topic` and wake waiting fetches.
    pub async fn publish(&self, topic: &str, variables: Variables) -> TaskId {
        let now = self.clock.now();
        let task_id = {
            let mut state = self.state.lock().await;
            state.next_task += 1;
            let n = state.next_task;
            let task_id = TaskId::new(format!("task-{n}"));

            let mut template = ExternalTask::new(task_id.clone(), topic, WorkerId::new(""), now)
                .with_variables(variables);
            template.process_instance_id = Some(format!("process-{n}"));
            template.activity_id = Some(format!("Activity_{topic}"));

            state.tasks.insert(
                task_id.clone(),
                EngineTask {
                    template,
                    state: EngineTaskState::Available,
                    locked_by: None,
                    lock_expiration: None,
                    available_at: now,
                },
            );
            state.order.push(task_id.clone());
            task_id
        };
        self.notify.notify_waiters();
        task_id
    }

    /// Make the next `n` fetch-and-lock calls fail with a transport error.
    pub async fn fail_next_fetches(&self, n: u32) {
        self.state.lock().await.failing_fetches = n;
    }

    pub async fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().await.calls.iter().cloned().collect()
    }

    /// Terminal calls (complete, business error, failure) for one task.
    pub async fn terminal_calls_for(&self, task_id: &TaskId) -> Vec<GatewayCall> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.is_terminal() && c.task_id() == task_id)
            .cloned()
            .collect()
    }

    pub async fn fetches(&self) -> Vec<FetchRecord> {
        self.state.lock().await.fetches.iter().cloned().collect()
    }

    pub async fn state_of(&self, task_id: &TaskId) -> Option<EngineTaskState> {
        self.state
            .lock()
            .await
            .tasks
            .get(task_id)
            .map(|t| t.state.clone())
    }

    pub async fn retries_of(&self, task_id: &TaskId) -> Option<u32> {
        self.state
            .lock()
            .await
            .tasks
            .get(task_id)
            .and_then(|t| t.template.retries)
    }

    /// Tasks that are not finalized yet.
    pub async fn open_tasks(&self) -> usize {
        self.state
            .lock()
            .await
            .tasks
            .values()
            .filter(|t| !t.state.is_final())
            .count()
    }

    pub async fn close_count(&self) -> u32 {
        self.state.lock().await.close_count
    }

    fn try_lock_batch(&self, state: &mut EngineState, request: &FetchRequest) -> Vec<ExternalTask> {
        let now = self.clock.now();
        let lock_duration = chrono::Duration::from_std(request.lock_duration)
            .unwrap_or(chrono::Duration::MAX);
        let lock_expiration = now.checked_add_signed(lock_duration).unwrap_or(DateTime::<Utc>::MAX_UTC);

        let candidates: Vec<TaskId> = state
            .order
            .iter()
            .filter(|id| {
                state
                    .tasks
                    .get(*id)
                    .is_some_and(|t| t.is_fetchable(&request.topics, now))
            })
            .take(request.max_tasks as usize)
            .cloned()
            .collect();

        let mut locked = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(task) = state.tasks.get_mut(&id) {
                task.locked_by = Some(request.worker_id.clone());
                task.lock_expiration = Some(lock_expiration);

                let mut leased = task.template.clone();
                leased.worker_id = request.worker_id.clone();
                leased.lock_expiration = lock_expiration;
                locked.push(leased);
            }
        }
        locked
    }
}

#[async_trait]
impl EngineGateway for InMemoryEngine {
    async fn fetch_and_lock(&self, request: &FetchRequest) -> Result<Vec<ExternalTask>, LatchError> {
        request.validate()?;
        let deadline = tokio::time::Instant::now() + request.async_response_timeout;

        loop {
            // notified() は lock を取る前に作っておかないと publish を取りこぼす
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(LatchError::Closed);
                }
                if state.failing_fetches > 0 {
                    state.failing_fetches -= 1;
                    return Err(LatchError::Transport("injected fetch failure".into()));
                }

                let locked = self.try_lock_batch(&mut state, request);
                if !locked.is_empty() || tokio::time::Instant::now() >= deadline {
                    state.record_fetch(FetchRecord {
                        worker_id: request.worker_id.clone(),
                        topics: request.topics.clone(),
                        max_tasks: request.max_tasks,
                        returned: locked.iter().map(|t| t.id.clone()).collect(),
                    });
                    return Ok(locked);
                }
            }

            let wake = deadline.min(tokio::time::Instant::now() + RECHECK_INTERVAL);
            tokio::select! {
                _ = notified => {},
                _ = tokio::time::sleep_until(wake) => {},
            }
        }
    }

    async fn complete(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        variables: &Variables,
    ) -> Result<(), LatchError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(LatchError::Closed);
        }
        state.record_call(GatewayCall::Complete {
            task_id: task_id.clone(),
            worker_id: worker_id.clone(),
            variables: variables.clone(),
        });

        let task = state.locked_task(task_id, worker_id, now)?;
        task.state = EngineTaskState::Completed {
            variables: variables.clone(),
        };
        Ok(())
    }

    async fn report_business_error(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        error: &BusinessError,
    ) -> Result<(), LatchError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(LatchError::Closed);
        }
        state.record_call(GatewayCall::BusinessError {
            task_id: task_id.clone(),
            worker_id: worker_id.clone(),
            error: error.clone(),
        });

        let task = state.locked_task(task_id, worker_id, now)?;
        task.state = EngineTaskState::BusinessError {
            code: error.code.clone(),
        };
        Ok(())
    }

    async fn report_failure(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        failure: &Failure,
    ) -> Result<(), LatchError> {
        let now = self.clock.now();
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(LatchError::Closed);
            }
            state.record_call(GatewayCall::Failure {
                task_id: task_id.clone(),
                worker_id: worker_id.clone(),
                failure: failure.clone(),
            });

            let task = state.locked_task(task_id, worker_id, now)?;
            task.template.retries = Some(failure.retries);
            task.template.error_message = Some(failure.message.clone());
            task.locked_by = None;
            task.lock_expiration = None;
            if failure.is_terminal() {
                task.state = EngineTaskState::Incident {
                    message: failure.message.clone(),
                };
            } else {
                let delay = chrono::Duration::from_std(failure.retry_timeout)
                    .unwrap_or(chrono::Duration::MAX);
                task.available_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn extend_lock(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        new_duration: Duration,
    ) -> Result<(), LatchError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(LatchError::Closed);
        }
        state.record_call(GatewayCall::ExtendLock {
            task_id: task_id.clone(),
            worker_id: worker_id.clone(),
            new_duration,
        });

        let task = state.locked_task(task_id, worker_id, now)?;
        let extension =
            chrono::Duration::from_std(new_duration).unwrap_or(chrono::Duration::MAX);
        task.lock_expiration = Some(now.checked_add_signed(extension).unwrap_or(DateTime::<Utc>::MAX_UTC));
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.close_count += 1;
        drop(state);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::TimeZone;

    fn request(worker: &str, topic: &str, max_tasks: u32) -> FetchRequest {
        FetchRequest {
            worker_id: WorkerId::new(worker),
            topics: vec![topic.to_string()],
            max_tasks,
            lock_duration: Duration::from_secs(10),
            async_response_timeout: Duration::ZERO,
        }
    }

    fn fixed_engine() -> (Arc<FixedClock>, InMemoryEngine) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let engine = InMemoryEngine::with_clock(clock.clone());
        (clock, engine)
    }

    #[tokio::test]
    async fn fetch_respects_topic_and_batch_size() {
        let (_clock, engine) = fixed_engine();
        engine.publish("STEP_1", Variables::new()).await;
        engine.publish("STEP_1", Variables::new()).await;
        engine.publish("STEP_1", Variables::new()).await;
        engine.publish("STEP_2", Variables::new()).await;

        let first = engine.fetch_and_lock(&request("w1", "STEP_1", 2)).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|t| t.topic == "STEP_1"));
        assert!(first.iter().all(|t| t.worker_id.as_str() == "w1"));

        // 残り 1 件だけ、ロック済みのものは返らない
        let second = engine.fetch_and_lock(&request("w2", "STEP_1", 5)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert!(!first.iter().any(|t| t.id == second[0].id));
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let (clock, engine) = fixed_engine();
        let id = engine.publish("STEP_1", Variables::new()).await;

        engine.fetch_and_lock(&request("w1", "STEP_1", 1)).await.unwrap();
        clock.advance(chrono::Duration::seconds(10));
        let stolen = engine.fetch_and_lock(&request("w2", "STEP_1", 1)).await.unwrap();
        assert_eq!(stolen[0].id, id);

        let late = engine
            .complete(&id, &WorkerId::new("w1"), &Variables::new())
            .await;
        assert!(matches!(late, Err(LatchError::LockExpired { .. })));

        engine
            .complete(&id, &WorkerId::new("w2"), &Variables::new())
            .await
            .unwrap();
        let again = engine
            .complete(&id, &WorkerId::new("w2"), &Variables::new())
            .await;
        assert!(matches!(again, Err(LatchError::NotFound { .. })));
    }

    #[tokio::test]
    async fn failure_requeues_after_retry_timeout_then_raises_incident() {
        let (clock, engine) = fixed_engine();
        let id = engine.publish("STEP_3", Variables::new()).await;
        let w = WorkerId::new("w1");

        engine.fetch_and_lock(&request("w1", "STEP_3", 1)).await.unwrap();
        engine
            .report_failure(&id, &w, &Failure::new("boom", 1, Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(engine.fetch_and_lock(&request("w1", "STEP_3", 1)).await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(5));
        let retried = engine.fetch_and_lock(&request("w1", "STEP_3", 1)).await.unwrap();
        assert_eq!(retried[0].retries, Some(1));
        assert_eq!(retried[0].error_message.as_deref(), Some("boom"));

        engine
            .report_failure(&id, &w, &Failure::new("boom again", 0, Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(matches!(
            engine.state_of(&id).await,
            Some(EngineTaskState::Incident { .. })
        ));
    }

    #[tokio::test]
    async fn long_poll_wakes_on_publish() {
        let engine = Arc::new(InMemoryEngine::new());
        let waiting = tokio::spawn({
            let engine = engine.clone();
            async move {
                let mut req = request("w1", "STEP_1", 1);
                req.async_response_timeout = Duration::from_secs(5);
                engine.fetch_and_lock(&req).await
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.publish("STEP_1", Variables::new()).await;

        let tasks = waiting.await.unwrap().unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn long_poll_returns_empty_after_timeout() {
        let engine = InMemoryEngine::new();
        let mut req = request("w1", "STEP_1", 1);
        req.async_response_timeout = Duration::from_millis(60);

        let started = tokio::time::Instant::now();
        let tasks = engine.fetch_and_lock(&req).await.unwrap();
        assert!(tasks.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(engine.fetches().await.len(), 1);
    }

    #[tokio::test]
    async fn injected_and_closed_failures() {
        let engine = InMemoryEngine::new();
        engine.fail_next_fetches(1).await;
        let req = request("w1", "STEP_1", 1);

        assert!(matches!(
            engine.fetch_and_lock(&req).await,
            Err(LatchError::Transport(_))
        ));
        assert!(engine.fetch_and_lock(&req).await.unwrap().is_empty());

        engine.close().await;
        assert!(matches!(
            engine.fetch_and_lock(&req).await,
            Err(LatchError::Closed)
        ));
        assert_eq!(engine.close_count().await, 1);
    }

    #[tokio::test]
    async fn recording_keeps_only_the_latest_entries() {
        let (_clock, engine) = fixed_engine();
        let engine = engine.with_record_limit(3);

        for _ in 0..10 {
            engine.fetch_and_lock(&request("w1", "STEP_1", 1)).await.unwrap();
        }
        let id = engine.publish("STEP_1", Variables::new()).await;
        engine.fetch_and_lock(&request("w1", "STEP_1", 1)).await.unwrap();

        let fetches = engine.fetches().await;
        assert_eq!(fetches.len(), 3);
        assert_eq!(fetches[2].returned, vec![id.clone()]);

        let worker = WorkerId::new("w1");
        for secs in 1..=5 {
            engine
                .extend_lock(&id, &worker, Duration::from_secs(secs))
                .await
                .unwrap();
        }
        let calls = engine.calls().await;
        assert_eq!(calls.len(), 3);
        assert!(matches!(
            &calls[0],
            GatewayCall::ExtendLock { new_duration, .. } if *new_duration == Duration::from_secs(3)
        ));
    }
}
