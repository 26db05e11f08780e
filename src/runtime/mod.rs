//! Scheduler and worker pool.
//!
//! A [`Runtime`] owns one dispatcher task that receives instance wake-ups and
//! runs replay passes, plus a pool of activity workers bounded by a
//! semaphore. Passes never block on activity work: a pass appends what it
//! decided, dispatches it, and ends. Every recorded outcome wakes the
//! instance again.
use crate::client::Client;
use crate::providers::{HistoryError, HistoryStore};
use crate::{Action, EventKind, HistoryEvent, OrchestrationContext, WorkflowFault};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod activity;
pub mod registry;
pub mod replay;
pub mod retry;
pub mod status;

use async_trait::async_trait;
pub use activity::{ActivityHandler, ActivityInvoker, FnActivity};
pub use registry::{ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder};
pub use replay::{Pass, TurnOutcome, run_pass};

use activity::ActivityContext;
use retry::RetryPolicy;

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Polling interval used by [`Client::wait_for_orchestration`] on clients
    /// handed out by the runtime.
    /// Default: 10ms
    pub dispatcher_idle_sleep_ms: u64,
    /// Upper bound on activity attempts executing at once.
    /// Default: 16
    pub max_concurrent_activities: usize,
    /// Per-attempt timeout when the retry policy does not set one.
    /// Default: 30s
    pub activity_timeout: Duration,
    /// Retry policy for `schedule_activity` calls that do not pass their own.
    pub retry_policy: RetryPolicy,
    /// Terminate instances still running this long after creation.
    /// Default: none
    pub instance_timeout: Option<Duration>,
    /// How many times a history append is re-read and retried after a
    /// conflict or retryable storage error.
    /// Default: 5
    pub max_append_retries: u32,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep_ms: 10,
            max_concurrent_activities: 16,
            activity_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            instance_timeout: None,
            max_append_retries: 5,
        }
    }
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, WorkflowFault>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, WorkflowFault>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, WorkflowFault>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, WorkflowFault> {
        (self.0)(ctx, input).await
    }
}

/// One dispatched activity attempt. Never persisted; the `ActivityScheduled`
/// event it came from is the durable record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityTask {
    pub instance: String,
    pub correlation_id: u64,
    pub name: String,
    pub input: String,
    pub attempt: u32,
    pub delay: Duration,
    pub timeout: Duration,
}

/// Messages accepted by the dispatcher.
#[derive(Debug)]
pub(crate) enum Signal {
    /// A new instance was created.
    Started(String),
    /// History of an instance changed.
    Wake(String),
}

/// Outcome appends back off at most 10ms * 2^6 between rounds.
const MAX_OUTCOME_BACKOFF_STEP: u32 = 6;

/// Backoff between append retries: 10ms doubling, as the storage retry loop
/// elsewhere in the runtime does.
fn append_backoff(attempt: u32) -> Duration {
    Duration::from_millis(10u64.saturating_mul(1 << attempt.min(10)))
}

/// Append one event decided from the latest history, re-reading and retrying
/// on conflicts and retryable errors. `decide` returning `None` means there is
/// nothing to append; that is reported as `Ok(None)`.
pub(crate) async fn append_next<F>(
    store: &dyn HistoryStore,
    instance: &str,
    max_retries: u32,
    mut decide: F,
) -> Result<Option<u64>, HistoryError>
where
    F: FnMut(&[HistoryEvent]) -> Option<EventKind> + Send,
{
    let mut attempt = 0u32;
    loop {
        let result: Result<Option<u64>, HistoryError> = async {
            let history = store.read_all(instance).await?;
            let Some(kind) = decide(&history) else {
                return Ok(None);
            };
            let event = HistoryEvent::new(history.len() as u64, kind);
            store.append(instance, event).await.map(Some)
        }
        .await;
        match result {
            Err(e) if e.is_retryable() && attempt < max_retries => {
                let backoff = append_backoff(attempt);
                debug!(target: "petflow::runtime", instance = %instance, attempt, error = %e, "append failed; retrying");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// In-process runtime that replays orchestrations and executes activities
/// against a [`HistoryStore`].
pub struct Runtime {
    store: Arc<dyn HistoryStore>,
    orchestrations: OrchestrationRegistry,
    invoker: ActivityInvoker,
    options: RuntimeOptions,
    signals: mpsc::UnboundedSender<Signal>,
    permits: Arc<Semaphore>,
    /// One lock per instance; a pass or an outcome append holds it.
    instance_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Instances woken but whose pass has not started reading history yet.
    queued: std::sync::Mutex<HashSet<String>>,
    /// Attempts currently dispatched, keyed by (instance, correlation id, attempt).
    in_flight: std::sync::Mutex<HashSet<(String, u64, u32)>>,
    shutdown: AtomicBool,
    joins: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Runtime {
    /// Start a runtime over a fresh in-memory store.
    pub async fn start(
        activities: Arc<ActivityRegistry>,
        orchestrations: OrchestrationRegistry,
    ) -> Result<Arc<Self>, HistoryError> {
        let store: Arc<dyn HistoryStore> = Arc::new(crate::providers::in_memory::InMemoryHistoryStore::new());
        Self::start_with_store(store, activities, orchestrations).await
    }

    /// Start a runtime with a custom `HistoryStore` implementation.
    pub async fn start_with_store(
        store: Arc<dyn HistoryStore>,
        activities: Arc<ActivityRegistry>,
        orchestrations: OrchestrationRegistry,
    ) -> Result<Arc<Self>, HistoryError> {
        Self::start_with_options(store, activities, orchestrations, RuntimeOptions::default()).await
    }

    /// Start a runtime with custom options, then recover every non-terminal
    /// instance already in the store.
    pub async fn start_with_options(
        store: Arc<dyn HistoryStore>,
        activities: Arc<ActivityRegistry>,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Result<Arc<Self>, HistoryError> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = Arc::new(Self {
            store,
            orchestrations,
            invoker: ActivityInvoker::new(activities),
            permits: Arc::new(Semaphore::new(options.max_concurrent_activities.max(1))),
            options,
            signals: tx,
            instance_locks: std::sync::Mutex::new(HashMap::new()),
            queued: std::sync::Mutex::new(HashSet::new()),
            in_flight: std::sync::Mutex::new(HashSet::new()),
            shutdown: AtomicBool::new(false),
            joins: std::sync::Mutex::new(Vec::new()),
        });

        let handle = runtime.clone().start_dispatcher(rx);
        runtime.track(handle);
        runtime.recover().await?;
        Ok(runtime)
    }

    /// A client whose writes wake this runtime.
    pub fn client(&self) -> Client {
        Client::attached(
            self.store.clone(),
            self.orchestrations.clone(),
            self.signals.clone(),
            Duration::from_millis(self.options.dispatcher_idle_sleep_ms),
        )
    }

    pub fn store(&self) -> Arc<dyn HistoryStore> {
        self.store.clone()
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Stop dispatching and abort every background task. Attempts running at
    /// this moment are abandoned without recording an outcome; a later
    /// runtime over the same store re-dispatches them.
    pub async fn shutdown(self: Arc<Self>) {
        self.shutdown.store(true, Ordering::SeqCst);
        let joins: Vec<JoinHandle<()>> = lock(&self.joins).drain(..).collect();
        for j in joins {
            j.abort();
        }
        info!(target: "petflow::runtime", "runtime shut down");
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut joins = lock(&self.joins);
        joins.retain(|j| !j.is_finished());
        if self.is_shutting_down() {
            handle.abort();
        } else {
            joins.push(handle);
        }
    }

    fn spawn_tracked<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.track(tokio::spawn(fut));
    }

    fn instance_lock(&self, instance: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.instance_locks).entry(instance.to_string()).or_default().clone()
    }

    /// Forget the instance's lock once nobody holds or awaits it, so the map
    /// only tracks instances with work in progress.
    fn release_instance_lock(&self, instance: &str, guard: Arc<tokio::sync::Mutex<()>>) {
        drop(guard);
        let mut locks = lock(&self.instance_locks);
        if locks.get(instance).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(instance);
        }
    }

    #[cfg(test)]
    fn tracked_instance_locks(&self) -> usize {
        lock(&self.instance_locks).len()
    }

    pub(crate) fn wake(&self, instance: &str) {
        let _ = self.signals.send(Signal::Wake(instance.to_string()));
    }

    fn start_dispatcher(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Signal>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                if self.is_shutting_down() {
                    break;
                }
                let instance = match signal {
                    Signal::Started(instance) => {
                        self.arm_instance_timeout(&instance);
                        instance
                    }
                    Signal::Wake(instance) => instance,
                };
                // Coalesce wake-ups for an instance whose pass has not begun
                if !lock(&self.queued).insert(instance.clone()) {
                    continue;
                }
                let rt = self.clone();
                self.spawn_tracked(async move { rt.run_instance(instance).await });
            }
        })
    }

    /// Run one replay pass for `instance` and persist its decisions.
    async fn run_instance(self: Arc<Self>, instance: String) {
        let guard = self.instance_lock(&instance);
        {
            let _g = guard.lock().await;
            lock(&self.queued).remove(&instance);
            self.persist_pass(&instance).await;
        }
        self.release_instance_lock(&instance, guard);
    }

    async fn persist_pass(self: &Arc<Self>, instance: &str) {
        let mut attempt = 0u32;
        loop {
            if self.is_shutting_down() {
                return;
            }
            let history = match self.store.read_all(&instance).await {
                Ok(h) => h,
                Err(e) if e.is_retryable() && attempt < self.options.max_append_retries => {
                    tokio::time::sleep(append_backoff(attempt)).await;
                    attempt += 1;
                    continue;
                }
                Err(e) => {
                    error!(target: "petflow::runtime", instance = %instance, error = %e, "failed to read history");
                    return;
                }
            };

            let pass = run_pass(&instance, &history, &self.orchestrations, &self.options.retry_policy);
            if pass.history_delta.is_empty() {
                return;
            }

            match self.store.append_batch(&instance, pass.history_delta).await {
                Ok(_) => {
                    match &pass.outcome {
                        TurnOutcome::Continue => {
                            debug!(target: "petflow::runtime", instance = %instance, scheduled = pass.pending_actions.len(), "pass appended")
                        }
                        TurnOutcome::Completed(_) => info!(target: "petflow::runtime", instance = %instance, "orchestration completed"),
                        TurnOutcome::Failed(fault) => warn!(target: "petflow::runtime", instance = %instance, fault = %fault, "orchestration failed"),
                        TurnOutcome::Terminated(reason) => {
                            info!(target: "petflow::runtime", instance = %instance, reason = %reason, "orchestration terminated")
                        }
                        TurnOutcome::AlreadyTerminal => {}
                    }
                    for action in pass.pending_actions {
                        if let Some(task) = self.task_for(&instance, action) {
                            self.dispatch(task);
                        }
                    }
                    return;
                }
                Err(e) if e.is_retryable() && attempt < self.options.max_append_retries => {
                    debug!(target: "petflow::runtime", instance = %instance, attempt, error = %e, "pass append failed; replaying again");
                    tokio::time::sleep(append_backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(target: "petflow::runtime", instance = %instance, error = %e, "failed to append pass");
                    return;
                }
            }
        }
    }

    fn task_for(&self, instance: &str, action: Action) -> Option<ActivityTask> {
        match action {
            Action::ScheduleActivity {
                correlation_id,
                name,
                input,
                attempt,
                delay_ms,
                timeout_ms,
                ..
            } => Some(ActivityTask {
                instance: instance.to_string(),
                correlation_id,
                name,
                input,
                attempt,
                delay: Duration::from_millis(delay_ms),
                timeout: timeout_ms.map(Duration::from_millis).unwrap_or(self.options.activity_timeout),
            }),
            Action::SubscribeExternal { .. } => None,
        }
    }

    /// Hand an attempt to the worker pool unless it is already running.
    fn dispatch(self: &Arc<Self>, task: ActivityTask) {
        let key = (task.instance.clone(), task.correlation_id, task.attempt);
        if !lock(&self.in_flight).insert(key.clone()) {
            debug!(
                target: "petflow::runtime",
                instance = %task.instance,
                correlation_id = task.correlation_id,
                attempt = task.attempt,
                "attempt already in flight"
            );
            return;
        }
        let rt = self.clone();
        self.spawn_tracked(async move {
            rt.execute_activity(&task).await;
            lock(&rt.in_flight).remove(&key);
            rt.wake(&task.instance);
        });
    }

    async fn execute_activity(&self, task: &ActivityTask) {
        if !task.delay.is_zero() {
            tokio::time::sleep(task.delay).await;
        }
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return;
        };
        if self.is_shutting_down() {
            return;
        }

        // Skip attempts whose outcome is already known or whose instance ended
        match self.store.read_all(&task.instance).await {
            Ok(history) => {
                if history.iter().any(|e| e.kind.is_terminal()) {
                    debug!(target: "petflow::runtime", instance = %task.instance, "instance terminal; attempt skipped");
                    return;
                }
                if has_outcome(&history, task.correlation_id, task.attempt) {
                    return;
                }
            }
            Err(e) => {
                warn!(target: "petflow::runtime", instance = %task.instance, error = %e, "could not read history before invoking");
            }
        }

        let ctx = ActivityContext::new(&task.instance, &task.name, task.correlation_id, task.attempt);
        let result = self.invoker.invoke(ctx, task.input.clone(), task.timeout).await;
        if self.is_shutting_down() {
            return;
        }
        self.record_outcome(task, result).await;
    }

    /// Append the attempt's outcome unless the instance has ended or the
    /// outcome is already recorded.
    async fn record_outcome(&self, task: &ActivityTask, result: Result<String, activity::ActivityFailure>) {
        let guard = self.instance_lock(&task.instance);
        {
            let _g = guard.lock().await;
            self.append_outcome(task, result).await;
        }
        self.release_instance_lock(&task.instance, guard);
    }

    /// Retryable append failures are retried with a capped backoff until the
    /// outcome lands or the runtime shuts down; an outcome is never dropped
    /// while the runtime is live.
    async fn append_outcome(&self, task: &ActivityTask, result: Result<String, activity::ActivityFailure>) {
        let kind = match result {
            Ok(result) => EventKind::ActivityCompleted {
                correlation_id: task.correlation_id,
                attempt: task.attempt,
                result,
            },
            Err(failure) => EventKind::ActivityFailed {
                correlation_id: task.correlation_id,
                attempt: task.attempt,
                failure,
            },
        };

        let mut round = 0u32;
        loop {
            let mut discarded = false;
            let appended = append_next(
                self.store.as_ref(),
                &task.instance,
                self.options.max_append_retries,
                |history| {
                    if history.iter().any(|e| e.kind.is_terminal()) {
                        discarded = true;
                        return None;
                    }
                    if has_outcome(history, task.correlation_id, task.attempt) {
                        return None;
                    }
                    Some(kind.clone())
                },
            )
            .await;

            match appended {
                Ok(Some(seq)) => debug!(
                    target: "petflow::runtime",
                    instance = %task.instance,
                    correlation_id = task.correlation_id,
                    attempt = task.attempt,
                    seq,
                    "outcome recorded"
                ),
                Ok(None) if discarded => warn!(
                    target: "petflow::runtime",
                    instance = %task.instance,
                    correlation_id = task.correlation_id,
                    attempt = task.attempt,
                    "late outcome discarded; instance already ended"
                ),
                Ok(None) => debug!(
                    target: "petflow::runtime",
                    instance = %task.instance,
                    correlation_id = task.correlation_id,
                    "duplicate outcome ignored"
                ),
                Err(e) if e.is_retryable() && !self.is_shutting_down() => {
                    warn!(
                        target: "petflow::runtime",
                        instance = %task.instance,
                        correlation_id = task.correlation_id,
                        attempt = task.attempt,
                        round,
                        error = %e,
                        "outcome append still failing; retrying"
                    );
                    tokio::time::sleep(append_backoff(round.min(MAX_OUTCOME_BACKOFF_STEP))).await;
                    round = round.saturating_add(1);
                    continue;
                }
                Err(e) => error!(
                    target: "petflow::runtime",
                    instance = %task.instance,
                    correlation_id = task.correlation_id,
                    error = %e,
                    "failed to record outcome"
                ),
            }
            return;
        }
    }

    /// Schedule a `TerminateRequested` once the instance outlives
    /// `instance_timeout`, measured from its creation time.
    fn arm_instance_timeout(self: &Arc<Self>, instance: &str) {
        let Some(limit) = self.options.instance_timeout else {
            return;
        };
        let rt = self.clone();
        let instance = instance.to_string();
        self.spawn_tracked(async move {
            let created_at_ms = match rt.store.read_all(&instance).await {
                Ok(h) => h.first().map(|e| e.timestamp_ms).unwrap_or_else(crate::now_ms),
                Err(e) => {
                    warn!(target: "petflow::runtime", instance = %instance, error = %e, "cannot arm instance timeout");
                    return;
                }
            };
            let elapsed = Duration::from_millis(crate::now_ms().saturating_sub(created_at_ms));
            tokio::time::sleep(limit.saturating_sub(elapsed)).await;

            let appended = append_next(rt.store.as_ref(), &instance, rt.options.max_append_retries, |history| {
                let ended = history.iter().any(|e| {
                    e.kind.is_terminal() || matches!(e.kind, EventKind::TerminateRequested { .. })
                });
                (!ended).then(|| EventKind::TerminateRequested {
                    reason: "instance timeout".to_string(),
                })
            })
            .await;
            match appended {
                Ok(Some(_)) => {
                    info!(target: "petflow::runtime", instance = %instance, "instance timed out");
                    rt.wake(&instance);
                }
                Ok(None) => {}
                Err(e) => error!(target: "petflow::runtime", instance = %instance, error = %e, "failed to request timeout termination"),
            }
        });
    }

    /// Re-dispatch outstanding attempts and wake every non-terminal instance.
    async fn recover(self: &Arc<Self>) -> Result<(), HistoryError> {
        let instances = self.store.list_instances().await?;
        let mut recovered = 0usize;
        for instance in instances {
            // One unreadable history must not keep the others from resuming
            let history = match self.store.read_all(&instance).await {
                Ok(h) => h,
                Err(e) => {
                    error!(target: "petflow::runtime", instance = %instance, error = %e, "skipping unreadable instance during recovery");
                    continue;
                }
            };
            if history.iter().any(|e| e.kind.is_terminal()) {
                continue;
            }
            for event in &history {
                if let EventKind::ActivityScheduled {
                    correlation_id,
                    name,
                    input,
                    attempt,
                    max_attempts,
                    delay_ms,
                    timeout_ms,
                } = &event.kind
                    && !has_outcome(&history, *correlation_id, *attempt)
                {
                    let action = Action::ScheduleActivity {
                        correlation_id: *correlation_id,
                        name: name.clone(),
                        input: input.clone(),
                        attempt: *attempt,
                        max_attempts: *max_attempts,
                        delay_ms: *delay_ms,
                        timeout_ms: *timeout_ms,
                    };
                    if let Some(task) = self.task_for(&instance, action) {
                        debug!(
                            target: "petflow::runtime",
                            instance = %instance,
                            correlation_id,
                            attempt,
                            "re-dispatching outstanding attempt"
                        );
                        self.dispatch(task);
                    }
                }
            }
            let _ = self.signals.send(Signal::Started(instance));
            recovered += 1;
        }
        if recovered > 0 {
            info!(target: "petflow::runtime", recovered, "recovered in-progress instances");
        }
        Ok(())
    }
}

fn has_outcome(history: &[HistoryEvent], correlation_id: u64, attempt: u32) -> bool {
    history.iter().any(|e| match &e.kind {
        EventKind::ActivityCompleted {
            correlation_id: c,
            attempt: a,
            ..
        }
        | EventKind::ActivityFailed {
            correlation_id: c,
            attempt: a,
            ..
        } => *c == correlation_id && *a == attempt,
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instance_locks_are_pruned_once_instances_go_idle() {
        let activities = ActivityRegistry::builder()
            .register("Echo", |_ctx, input: String| async move { Ok(input) })
            .build();
        let orchestrations = OrchestrationRegistry::builder()
            .register("Twice", |ctx: OrchestrationContext, input: String| async move {
                let a = ctx.schedule_activity("Echo", input).into_activity().await?;
                let b = ctx.schedule_activity("Echo", a).into_activity().await?;
                Ok(b)
            })
            .build();
        let rt = Runtime::start(Arc::new(activities), orchestrations).await.unwrap();
        let client = rt.client();
        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(client.start_orchestration("Twice", format!("{i}")).await.unwrap());
        }
        for id in &ids {
            let status = client.wait_for_orchestration(id, Duration::from_secs(5)).await.unwrap();
            assert!(status.status.is_terminal());
        }
        for _ in 0..200 {
            if rt.tracked_instance_locks() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(rt.tracked_instance_locks(), 0);
        rt.shutdown().await;
    }
}
