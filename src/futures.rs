use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;

use crate::runtime::activity::{ActivityFailure, ActivityFailureKind};
use crate::{Action, CtxInner, EventKind, FaultKind, OrchestrationContext, RetryPolicy, WorkflowFault};

/// Terminal outcome of an activity as seen by orchestration code.
///
/// Timeouts and transient errors only surface here once retries are exhausted,
/// at which point they are reported as `PermanentError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityError {
    pub activity: String,
    pub correlation_id: u64,
    pub attempts: u32,
    pub kind: ActivityFailureKind,
    pub message: String,
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "activity '{}' (correlation_id={}) failed with {} after {} attempt(s): {}",
            self.activity, self.correlation_id, self.kind, self.attempts, self.message
        )
    }
}

impl std::error::Error for ActivityError {}

impl From<ActivityError> for WorkflowFault {
    fn from(err: ActivityError) -> Self {
        WorkflowFault {
            kind: FaultKind::ActivityFailed,
            message: format!("{}: {}", err.kind, err.message),
            activity: Some(err.activity),
        }
    }
}

/// Output of a [`DurableFuture`].
#[derive(Debug, Clone)]
pub enum DurableOutput {
    Activity(Result<String, ActivityError>),
    External(String),
}

/// A future correlated to one scheduling decision.
///
/// Polling never blocks: it either resolves from history or records the
/// action the runtime must take, then returns `Pending` so the pass can end.
pub struct DurableFuture(Kind);

enum Kind {
    Activity {
        ctx: OrchestrationContext,
        correlation_id: u64,
        name: String,
        input: String,
        retry: RetryPolicy,
    },
    External {
        ctx: OrchestrationContext,
        correlation_id: u64,
        name: String,
        ordinal: usize,
    },
}

impl DurableFuture {
    pub(crate) fn activity(
        ctx: OrchestrationContext,
        correlation_id: u64,
        name: String,
        input: String,
        retry: RetryPolicy,
    ) -> Self {
        Self(Kind::Activity {
            ctx,
            correlation_id,
            name,
            input,
            retry,
        })
    }

    pub(crate) fn external(ctx: OrchestrationContext, correlation_id: u64, name: String, ordinal: usize) -> Self {
        Self(Kind::External {
            ctx,
            correlation_id,
            name,
            ordinal,
        })
    }

    pub fn correlation_id(&self) -> u64 {
        match &self.0 {
            Kind::Activity { correlation_id, .. } | Kind::External { correlation_id, .. } => *correlation_id,
        }
    }

    /// Resolve only for an activity outcome.
    pub fn into_activity(self) -> impl Future<Output = Result<String, ActivityError>> + Send {
        struct Map(DurableFuture);
        impl Future for Map {
            type Output = Result<String, ActivityError>;
            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                match Pin::new(&mut self.get_mut().0).poll(cx) {
                    Poll::Ready(DurableOutput::Activity(v)) => Poll::Ready(v),
                    Poll::Ready(other) => panic!("into_activity used on non-activity future: {other:?}"),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
        Map(self)
    }

    /// Resolve an activity outcome and decode its JSON result.
    pub fn into_activity_typed<Out: DeserializeOwned>(self) -> impl Future<Output = Result<Out, WorkflowFault>> + Send {
        use crate::_typed_codec::Codec;
        let activity = match &self.0 {
            Kind::Activity { name, .. } | Kind::External { name, .. } => name.clone(),
        };
        async move {
            let raw = self.into_activity().await?;
            crate::_typed_codec::Json::decode::<Out>(&raw)
                .map_err(|e| WorkflowFault::codec(format!("decode result: {e}")).with_activity(activity))
        }
    }

    /// Resolve only for an external event payload.
    pub fn into_event(self) -> impl Future<Output = String> + Send {
        struct Map(DurableFuture);
        impl Future for Map {
            type Output = String;
            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                match Pin::new(&mut self.get_mut().0).poll(cx) {
                    Poll::Ready(DurableOutput::External(v)) => Poll::Ready(v),
                    Poll::Ready(other) => panic!("into_event used on non-external future: {other:?}"),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
        Map(self)
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &self.get_mut().0 {
            Kind::Activity {
                ctx,
                correlation_id,
                name,
                input,
                retry,
            } => {
                let mut inner = ctx.lock();
                poll_activity(&mut inner, *correlation_id, name, input, retry).map(DurableOutput::Activity)
            }
            Kind::External {
                ctx,
                correlation_id,
                name,
                ordinal,
            } => {
                let mut inner = ctx.lock();
                poll_external(&mut inner, *correlation_id, name, *ordinal).map(DurableOutput::External)
            }
        }
    }
}

fn poll_activity(
    inner: &mut CtxInner,
    correlation_id: u64,
    name: &str,
    input: &str,
    retry: &RetryPolicy,
) -> Poll<Result<String, ActivityError>> {
    let mut latest: Option<(u32, u32)> = None;
    let mut mismatch: Option<String> = None;
    for event in &inner.history {
        match &event.kind {
            EventKind::ActivityScheduled {
                correlation_id: c,
                name: n,
                input: i,
                attempt,
                max_attempts,
                ..
            } if *c == correlation_id => {
                if n != name || i != input {
                    mismatch = Some(format!(
                        "correlation_id={correlation_id}: history has ActivityScheduled('{n}','{i}') but orchestration requested ('{name}','{input}')"
                    ));
                }
                latest = Some((*attempt, *max_attempts));
            }
            EventKind::ExternalSubscribed { correlation_id: c, name: n } if *c == correlation_id => {
                mismatch = Some(format!(
                    "correlation_id={correlation_id}: history has ExternalSubscribed('{n}') but orchestration requested activity '{name}'"
                ));
            }
            _ => {}
        }
    }
    if let Some(message) = mismatch {
        inner.flag_nondeterminism(message);
        return Poll::Pending;
    }

    let Some((attempt, max_attempts)) = latest else {
        inner.record_action(Action::ScheduleActivity {
            correlation_id,
            name: name.to_string(),
            input: input.to_string(),
            attempt: 1,
            max_attempts: retry.max_attempts,
            delay_ms: 0,
            timeout_ms: timeout_ms(retry),
        });
        return Poll::Pending;
    };

    let outcome = inner.history.iter().find_map(|event| match &event.kind {
        EventKind::ActivityCompleted {
            correlation_id: c,
            attempt: a,
            result,
        } if *c == correlation_id && *a == attempt => Some(Ok(result.clone())),
        EventKind::ActivityFailed {
            correlation_id: c,
            attempt: a,
            failure,
        } if *c == correlation_id && *a == attempt => Some(Err(failure.clone())),
        _ => None,
    });

    match outcome {
        None => Poll::Pending,
        Some(Ok(result)) => Poll::Ready(Ok(result)),
        Some(Err(failure)) if failure.kind.is_retryable() && attempt < max_attempts => {
            let delay = retry.backoff.delay_for_attempt(attempt);
            inner.record_action(Action::ScheduleActivity {
                correlation_id,
                name: name.to_string(),
                input: input.to_string(),
                attempt: attempt + 1,
                max_attempts,
                delay_ms: delay.as_millis().min(u64::MAX as u128) as u64,
                timeout_ms: timeout_ms(retry),
            });
            Poll::Pending
        }
        Some(Err(ActivityFailure { kind, message })) => {
            let (kind, message) = if kind.is_retryable() {
                (
                    ActivityFailureKind::PermanentError,
                    format!("exhausted {attempt} attempts: {message}"),
                )
            } else {
                (kind, message)
            };
            Poll::Ready(Err(ActivityError {
                activity: name.to_string(),
                correlation_id,
                attempts: attempt,
                kind,
                message,
            }))
        }
    }
}

fn timeout_ms(retry: &RetryPolicy) -> Option<u64> {
    retry.timeout.map(|t| t.as_millis().min(u64::MAX as u128) as u64)
}

fn poll_external(inner: &mut CtxInner, correlation_id: u64, name: &str, ordinal: usize) -> Poll<String> {
    let mut subscribed = false;
    let mut mismatch: Option<String> = None;
    for event in &inner.history {
        match &event.kind {
            EventKind::ExternalSubscribed { correlation_id: c, name: n } if *c == correlation_id => {
                if n != name {
                    mismatch = Some(format!(
                        "correlation_id={correlation_id}: history has ExternalSubscribed('{n}') but orchestration waits for '{name}'"
                    ));
                }
                subscribed = true;
            }
            EventKind::ActivityScheduled { correlation_id: c, name: n, .. } if *c == correlation_id => {
                mismatch = Some(format!(
                    "correlation_id={correlation_id}: history has ActivityScheduled('{n}') but orchestration waits for external '{name}'"
                ));
            }
            _ => {}
        }
    }
    if let Some(message) = mismatch {
        inner.flag_nondeterminism(message);
        return Poll::Pending;
    }
    if !subscribed {
        inner.record_action(Action::SubscribeExternal {
            correlation_id,
            name: name.to_string(),
        });
    }
    let raised = inner
        .history
        .iter()
        .filter_map(|event| match &event.kind {
            EventKind::ExternalEventRaised { name: n, data } if n == name => Some(data),
            _ => None,
        })
        .nth(ordinal);
    match raised {
        Some(data) => Poll::Ready(data.clone()),
        None => Poll::Pending,
    }
}
