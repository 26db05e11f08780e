use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use super::registry::ActivityRegistry;

/// Classification of a single failed activity attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ActivityFailureKind {
    Timeout,
    TransientError,
    PermanentError,
    InvalidInput,
}

impl ActivityFailureKind {
    /// Timeouts and transient errors are retried by the scheduler.
    pub fn is_retryable(self) -> bool {
        matches!(self, ActivityFailureKind::Timeout | ActivityFailureKind::TransientError)
    }
}

impl std::fmt::Display for ActivityFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActivityFailureKind::Timeout => "Timeout",
            ActivityFailureKind::TransientError => "TransientError",
            ActivityFailureKind::PermanentError => "PermanentError",
            ActivityFailureKind::InvalidInput => "InvalidInput",
        };
        f.write_str(s)
    }
}

/// Typed failure returned by an activity attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityFailure {
    pub kind: ActivityFailureKind,
    pub message: String,
}

impl ActivityFailure {
    pub fn new(kind: ActivityFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ActivityFailureKind::Timeout, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ActivityFailureKind::TransientError, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ActivityFailureKind::PermanentError, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ActivityFailureKind::InvalidInput, message)
    }
}

impl std::fmt::Display for ActivityFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ActivityFailure {}

/// Identity of the attempt being executed, handed to every activity.
///
/// `(instance, correlation_id)` is stable across retries and restarts, which
/// makes it a natural idempotency key for downstream side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityContext {
    pub instance: String,
    pub activity_name: String,
    pub correlation_id: u64,
    pub attempt: u32,
}

impl ActivityContext {
    pub fn new(instance: impl Into<String>, activity_name: impl Into<String>, correlation_id: u64, attempt: u32) -> Self {
        Self {
            instance: instance.into(),
            activity_name: activity_name.into(),
            correlation_id,
            attempt,
        }
    }

    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.instance, self.correlation_id)
    }
}

/// Trait implemented by activity handlers that can be invoked by the runtime.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, ActivityFailure>;
}

/// Function wrapper that implements `ActivityHandler`.
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityFailure>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityFailure>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, ActivityFailure> {
        (self.0)(ctx, input).await
    }
}

/// Executes exactly one attempt of a named activity.
///
/// The invoker never retries; the outcome of every attempt is reported to the
/// caller, which owns retry policy.
#[derive(Clone)]
pub struct ActivityInvoker {
    registry: Arc<ActivityRegistry>,
}

impl ActivityInvoker {
    pub fn new(registry: Arc<ActivityRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    pub async fn invoke(&self, ctx: ActivityContext, input: String, timeout: Duration) -> Result<String, ActivityFailure> {
        let name = ctx.activity_name.clone();
        let Some(handler) = self.registry.get(&name) else {
            tracing::warn!(
                target: "petflow::runtime::activity",
                instance = %ctx.instance,
                activity_name = %name,
                "unregistered activity"
            );
            return Err(ActivityFailure::invalid_input(format!("unregistered activity: {name}")));
        };

        tracing::debug!(
            target: "petflow::runtime::activity",
            instance = %ctx.instance,
            activity_name = %name,
            correlation_id = ctx.correlation_id,
            attempt = ctx.attempt,
            "Activity started"
        );
        let start = Instant::now();
        let instance = ctx.instance.clone();
        let correlation_id = ctx.correlation_id;
        let attempt = ctx.attempt;

        let call = AssertUnwindSafe(handler.invoke(ctx, input)).catch_unwind();
        let outcome = match tokio::time::timeout(timeout, call).await {
            Err(_) => Err(ActivityFailure::timeout(format!(
                "activity '{name}' did not finish within {}ms",
                timeout.as_millis()
            ))),
            Ok(Err(panic)) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(ActivityFailure::permanent(format!("activity '{name}' panicked: {detail}")))
            }
            Ok(Ok(result)) => result,
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match &outcome {
            Ok(result) => tracing::debug!(
                target: "petflow::runtime::activity",
                instance = %instance,
                activity_name = %name,
                correlation_id,
                attempt,
                outcome = "success",
                duration_ms,
                result_size = result.len(),
                "Activity completed"
            ),
            Err(failure) => tracing::warn!(
                target: "petflow::runtime::activity",
                instance = %instance,
                activity_name = %name,
                correlation_id,
                attempt,
                outcome = %failure.kind,
                duration_ms,
                error = %failure.message,
                "Activity failed"
            ),
        }
        outcome
    }
}
