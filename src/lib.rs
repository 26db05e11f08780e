//! Deterministic, replay-driven orchestration engine.
//!
//! Orchestrations are plain `async` functions over an [`OrchestrationContext`].
//! Every decision they make (scheduling an activity, subscribing to an external
//! event) is recorded as an append-only [`HistoryEvent`]. To advance an instance
//! the runtime replays the orchestration against its history: futures whose
//! outcome is already recorded resolve immediately, and anything new becomes an
//! [`Action`] that the runtime persists and then dispatches.
//!
//! The crate provides:
//!
//! - Public data model: [`HistoryEvent`], [`EventKind`], [`Action`], [`WorkflowFault`]
//! - One replay pass over a history: [`run_turn`]
//! - Storage backends behind [`providers::HistoryStore`]
//! - The scheduler/worker pool: [`runtime::Runtime`]
//! - The instance manager: [`Client`]
//! - The pet-identification workflow: [`workflows::pet_identification`]
//!
//! ```rust,no_run
//! use futures::future::join;
//! use petflow::{OrchestrationContext, WorkflowFault};
//!
//! async fn fan_out(ctx: OrchestrationContext, input: String) -> Result<String, WorkflowFault> {
//!     let a = ctx.schedule_activity("A", input.clone()).into_activity();
//!     let b = ctx.schedule_activity("B", input).into_activity();
//!     let (a, b) = join(a, b).await;
//!     Ok(format!("{}+{}", a?, b?))
//! }
//! ```
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod client;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;
pub mod workflows;

pub use client::{Client, ClientError};
pub use crate::futures::{ActivityError, DurableFuture, DurableOutput};
pub use runtime::activity::{ActivityContext, ActivityFailure, ActivityFailureKind};
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry};
pub use runtime::retry::{BackoffStrategy, RetryPolicy};
pub use runtime::status::{OrchestrationInstance, OrchestrationStatus};

// Internal codec utilities for typed I/O (kept private; public API remains ergonomic)
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};

    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }

    /// Every typed payload is a JSON document, strings included. Untyped
    /// `schedule_activity`/`register` callers pass raw strings and never go
    /// through here.
    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            serde_json::to_string(v).map_err(|e| e.to_string())
        }

        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            serde_json::from_str::<T>(s).map_err(|e| e.to_string())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::{Value, json};

        #[test]
        fn strings_that_look_like_other_json_keep_their_type() {
            for text in ["123", "true", "null", "[1]", "{\"a\":1}"] {
                let v = Value::String(text.to_string());
                let encoded = Json::encode(&v).unwrap();
                assert_eq!(Json::decode::<Value>(&encoded).unwrap(), v, "{text}");
                let s: String = Json::decode(&Json::encode(&text.to_string()).unwrap()).unwrap();
                assert_eq!(s, text);
            }
        }

        #[test]
        fn unquoted_text_is_not_a_string() {
            assert!(Json::decode::<String>("plain").is_err());
            assert_eq!(Json::decode::<Value>("123").unwrap(), json!(123));
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch. Only ever used for event
/// metadata, never as an input to orchestration decisions.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One entry of an instance's append-only history.
///
/// `seq` is assigned by the writer and must continue the log contiguously
/// starting at 0; stores reject any other value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEvent {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

impl HistoryEvent {
    pub fn new(seq: u64, kind: EventKind) -> Self {
        Self {
            seq,
            timestamp_ms: now_ms(),
            kind,
        }
    }
}

/// What a history entry records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum EventKind {
    /// Instance was created to run the named orchestration with `input`.
    OrchestratorStarted {
        name: String,
        input: String,
        idempotency_key: Option<String>,
    },
    /// An attempt of an activity was scheduled. Retries reuse the correlation id
    /// with an incremented `attempt`.
    ActivityScheduled {
        correlation_id: u64,
        name: String,
        input: String,
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        /// Per-attempt timeout; `None` uses the runtime default.
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    ActivityCompleted {
        correlation_id: u64,
        attempt: u32,
        result: String,
    },
    ActivityFailed {
        correlation_id: u64,
        attempt: u32,
        failure: ActivityFailure,
    },
    /// The orchestration started waiting for an external event by name.
    ExternalSubscribed { correlation_id: u64, name: String },
    /// An external event was raised into the instance.
    ExternalEventRaised { name: String, data: String },
    /// Termination was requested; the next pass ends the instance.
    TerminateRequested { reason: String },
    OrchestratorCompleted { output: String },
    OrchestratorFailed { fault: WorkflowFault },
    OrchestratorTerminated { reason: String },
}

impl EventKind {
    /// Stable discriminator used for logging and storage columns.
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::OrchestratorStarted { .. } => "OrchestratorStarted",
            EventKind::ActivityScheduled { .. } => "ActivityScheduled",
            EventKind::ActivityCompleted { .. } => "ActivityCompleted",
            EventKind::ActivityFailed { .. } => "ActivityFailed",
            EventKind::ExternalSubscribed { .. } => "ExternalSubscribed",
            EventKind::ExternalEventRaised { .. } => "ExternalEventRaised",
            EventKind::TerminateRequested { .. } => "TerminateRequested",
            EventKind::OrchestratorCompleted { .. } => "OrchestratorCompleted",
            EventKind::OrchestratorFailed { .. } => "OrchestratorFailed",
            EventKind::OrchestratorTerminated { .. } => "OrchestratorTerminated",
        }
    }

    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            EventKind::ActivityScheduled { correlation_id, .. }
            | EventKind::ActivityCompleted { correlation_id, .. }
            | EventKind::ActivityFailed { correlation_id, .. }
            | EventKind::ExternalSubscribed { correlation_id, .. } => Some(*correlation_id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::OrchestratorCompleted { .. }
                | EventKind::OrchestratorFailed { .. }
                | EventKind::OrchestratorTerminated { .. }
        )
    }
}

/// Classification of a domain-level orchestration fault.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FaultKind {
    /// An activity failed permanently (or exhausted its retries) and the
    /// orchestration did not handle it.
    ActivityFailed,
    /// Orchestration logic found an invalid intermediate state.
    InvalidState,
    /// Replay diverged from recorded history.
    Nondeterminism,
    /// No orchestration is registered under the started name.
    Unregistered,
    /// A payload could not be encoded or decoded.
    Codec,
    /// Orchestration code panicked.
    Panicked,
}

/// Structured fault recorded as the output of a `Failed` instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowFault {
    pub kind: FaultKind,
    pub activity: Option<String>,
    pub message: String,
}

impl WorkflowFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            activity: None,
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(FaultKind::InvalidState, message)
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Codec, message)
    }

    pub fn with_activity(mut self, activity: impl Into<String>) -> Self {
        self.activity = Some(activity.into());
        self
    }
}

impl std::fmt::Display for WorkflowFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.activity {
            Some(activity) => write!(f, "{:?} in activity '{}': {}", self.kind, activity, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for WorkflowFault {}

/// Declarative decisions produced by a replay pass. The runtime turns each
/// into a history event and, for activities, a dispatched task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ScheduleActivity {
        correlation_id: u64,
        name: String,
        input: String,
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        timeout_ms: Option<u64>,
    },
    SubscribeExternal {
        correlation_id: u64,
        name: String,
    },
}

impl Action {
    pub fn into_event_kind(self) -> EventKind {
        match self {
            Action::ScheduleActivity {
                correlation_id,
                name,
                input,
                attempt,
                max_attempts,
                delay_ms,
                timeout_ms,
            } => EventKind::ActivityScheduled {
                correlation_id,
                name,
                input,
                attempt,
                max_attempts,
                delay_ms,
                timeout_ms,
            },
            Action::SubscribeExternal { correlation_id, name } => {
                EventKind::ExternalSubscribed { correlation_id, name }
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) instance: String,
    pub(crate) history: Vec<HistoryEvent>,
    pub(crate) actions: Vec<Action>,
    pub(crate) next_correlation_id: u64,
    /// Correlation ids already present in history as schedules or subscriptions.
    pub(crate) recorded_ids: HashSet<u64>,
    /// Per-name ordinal for external waits, assigned in program order.
    pub(crate) external_ordinals: HashMap<String, usize>,
    pub(crate) default_retry: RetryPolicy,
    pub(crate) nondeterminism: Option<String>,
}

impl CtxInner {
    fn new(instance: String, history: Vec<HistoryEvent>, default_retry: RetryPolicy) -> Self {
        let recorded_ids = history
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::ActivityScheduled { correlation_id, .. }
                | EventKind::ExternalSubscribed { correlation_id, .. } => Some(*correlation_id),
                _ => None,
            })
            .collect();
        Self {
            instance,
            history,
            actions: Vec::new(),
            next_correlation_id: 0,
            recorded_ids,
            external_ordinals: HashMap::new(),
            default_retry,
            nondeterminism: None,
        }
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }

    pub(crate) fn record_action(&mut self, action: Action) {
        if !self.actions.contains(&action) {
            self.actions.push(action);
        }
    }

    /// Record the first divergence only; later ones are consequences of it.
    pub(crate) fn flag_nondeterminism(&mut self, message: String) {
        if self.nondeterminism.is_none() {
            self.nondeterminism = Some(message);
        }
    }
}

/// Orchestration-facing handle for scheduling work during a replay pass.
///
/// The context is rebuilt from history for every pass; it holds no state that
/// survives between passes.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a context over an existing history, using the default retry policy.
    pub fn new(instance: impl Into<String>, history: Vec<HistoryEvent>) -> Self {
        Self::with_retry_policy(instance, history, RetryPolicy::default())
    }

    pub fn with_retry_policy(instance: impl Into<String>, history: Vec<HistoryEvent>, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance.into(), history, retry))),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        // A poisoned lock can only come from a panic inside orchestration code,
        // which the replay engine already reports as a fault.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance.clone()
    }

    /// True while the orchestration is re-executing decisions that are already
    /// recorded in history. Use it to keep side-channel output (logs, metrics)
    /// from repeating on every pass.
    pub fn is_replaying(&self) -> bool {
        let inner = self.lock();
        inner.recorded_ids.contains(&inner.next_correlation_id)
    }

    /// Schedule an activity with the runtime's default retry policy.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let retry = self.lock().default_retry.clone();
        self.schedule_activity_with_retry(name, input, retry)
    }

    /// Schedule an activity with an explicit retry policy. Only timeouts and
    /// transient errors are retried.
    pub fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        retry: RetryPolicy,
    ) -> DurableFuture {
        let correlation_id = self.lock().next_id();
        DurableFuture::activity(self.clone(), correlation_id, name.into(), input.into(), retry)
    }

    /// Typed helper that serializes input as JSON. Pair with
    /// [`DurableFuture::into_activity_typed`].
    pub fn schedule_activity_typed<In: Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> Result<DurableFuture, WorkflowFault> {
        use crate::_typed_codec::Codec;
        let name = name.into();
        let payload = crate::_typed_codec::Json::encode(input)
            .map_err(|e| WorkflowFault::codec(format!("encode input: {e}")).with_activity(name.clone()))?;
        Ok(self.schedule_activity(name, payload))
    }

    /// Wait for an external event raised through [`Client::raise_event`]. The
    /// n-th wait on a name receives the n-th event raised with that name.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        let name = name.into();
        let (correlation_id, ordinal) = {
            let mut inner = self.lock();
            let id = inner.next_id();
            let slot = inner.external_ordinals.entry(name.clone()).or_insert(0);
            let ordinal = *slot;
            *slot += 1;
            (id, ordinal)
        };
        DurableFuture::external(self.clone(), correlation_id, name, ordinal)
    }

    fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.lock().actions)
    }

    /// Correlation ids recorded in history that this pass never claimed.
    fn unclaimed_ids(&self) -> Vec<u64> {
        let inner = self.lock();
        let mut ids: Vec<u64> = inner
            .recorded_ids
            .iter()
            .copied()
            .filter(|id| *id >= inner.next_correlation_id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// Result of polling an orchestration once against a history.
#[derive(Debug)]
pub struct TurnResult<O> {
    /// New decisions, in the order the orchestration made them.
    pub actions: Vec<Action>,
    /// Present when the orchestration ran to completion in this pass.
    pub output: Option<O>,
    /// Set when replay diverged from history.
    pub nondeterminism: Option<String>,
}

fn poll_once<F: Future>(fut: F) -> Poll<F::Output> {
    let mut fut = std::pin::pin!(fut);
    let mut cx = Context::from_waker(::futures::task::noop_waker_ref());
    fut.as_mut().poll(&mut cx)
}

/// Poll `orchestrator` once against `history`.
///
/// Every recorded outcome resolves synchronously, so a single poll replays
/// the whole history and stops at the first point that needs new work.
pub fn run_turn<O, F>(
    instance: &str,
    history: Vec<HistoryEvent>,
    retry: RetryPolicy,
    orchestrator: impl FnOnce(OrchestrationContext) -> F,
) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::with_retry_policy(instance, history, retry);
    let output = match poll_once(orchestrator(ctx.clone())) {
        Poll::Ready(out) => Some(out),
        Poll::Pending => None,
    };
    let mut nondeterminism = ctx.lock().nondeterminism.take();
    if output.is_some() && nondeterminism.is_none() {
        let unclaimed = ctx.unclaimed_ids();
        if !unclaimed.is_empty() {
            nondeterminism = Some(format!(
                "orchestration completed without reaching recorded correlation ids {unclaimed:?}"
            ));
        }
    }
    TurnResult {
        actions: ctx.take_actions(),
        output,
        nondeterminism,
    }
}
