use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::_typed_codec::{Codec, Json};
use crate::providers::{HistoryError, HistoryStore};
use crate::runtime::registry::OrchestrationRegistry;
use crate::runtime::{Signal, append_next};
use crate::{EventKind, HistoryEvent, OrchestrationInstance};

/// Namespace for ids derived from idempotency keys.
const INSTANCE_KEY_NAMESPACE: Uuid = Uuid::from_u128(0x5c1e_7a4e_9d2b_4f0e_8a61_3b7d_2f4c_9e10);

/// Errors returned by [`Client`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    History(HistoryError),
    /// The runtime has no orchestration registered under this name.
    UnknownOrchestration { name: String },
    /// The instance did not reach a terminal state in time.
    Timeout { instance: String, waited: Duration },
    Codec(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::History(HistoryError::InstanceNotFound { .. }))
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::History(e) => write!(f, "{e}"),
            ClientError::UnknownOrchestration { name } => write!(f, "unknown orchestration: {name}"),
            ClientError::Timeout { instance, waited } => {
                write!(f, "instance {instance} not finished after {}ms", waited.as_millis())
            }
            ClientError::Codec(msg) => write!(f, "codec: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::History(e) => Some(e),
            _ => None,
        }
    }
}

impl From<HistoryError> for ClientError {
    fn from(e: HistoryError) -> Self {
        ClientError::History(e)
    }
}

/// Instance manager: starts instances, reports their status and injects
/// external signals.
///
/// A client built with [`Client::new`] only writes to the store; a runtime
/// started later over the same store picks the instances up. Clients from
/// [`crate::runtime::Runtime::client`] also wake the runtime directly and
/// reject names it does not know.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn HistoryStore>,
    orchestrations: Option<OrchestrationRegistry>,
    signals: Option<mpsc::UnboundedSender<Signal>>,
    poll_interval: Duration,
    max_append_retries: u32,
}

impl Client {
    /// Create a client bound to a HistoryStore instance.
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            orchestrations: None,
            signals: None,
            poll_interval: Duration::from_millis(10),
            max_append_retries: 5,
        }
    }

    pub(crate) fn attached(
        store: Arc<dyn HistoryStore>,
        orchestrations: OrchestrationRegistry,
        signals: mpsc::UnboundedSender<Signal>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            orchestrations: Some(orchestrations),
            signals: Some(signals),
            poll_interval,
            max_append_retries: 5,
        }
    }

    fn notify(&self, signal: Signal) {
        if let Some(tx) = &self.signals {
            // A closed channel means the runtime is gone; recovery will find the instance
            let _ = tx.send(signal);
        }
    }

    fn check_known(&self, name: &str) -> Result<(), ClientError> {
        match &self.orchestrations {
            Some(reg) if !reg.has(name) => Err(ClientError::UnknownOrchestration { name: name.to_string() }),
            _ => Ok(()),
        }
    }

    async fn create(
        &self,
        instance: String,
        name: &str,
        input: String,
        idempotency_key: Option<String>,
    ) -> Result<(), HistoryError> {
        let started = HistoryEvent::new(
            0,
            EventKind::OrchestratorStarted {
                name: name.to_string(),
                input,
                idempotency_key,
            },
        );
        self.store.create_instance(&instance, started).await?;
        tracing::info!(target: "petflow::client", instance = %instance, orchestration = %name, "instance started");
        self.notify(Signal::Started(instance));
        Ok(())
    }

    /// Start a new instance under a fresh id.
    pub async fn start_orchestration(&self, name: &str, input: impl Into<String>) -> Result<String, ClientError> {
        self.check_known(name)?;
        let instance = Uuid::new_v4().to_string();
        self.create(instance.clone(), name, input.into(), None).await?;
        Ok(instance)
    }

    /// Start an instance whose id is derived from `key`. Repeating the call
    /// with the same name and key returns the same id and starts nothing new.
    pub async fn start_orchestration_with_key(
        &self,
        name: &str,
        key: &str,
        input: impl Into<String>,
    ) -> Result<String, ClientError> {
        self.check_known(name)?;
        let instance = Uuid::new_v5(&INSTANCE_KEY_NAMESPACE, format!("{name}\n{key}").as_bytes()).to_string();
        match self.create(instance.clone(), name, input.into(), Some(key.to_string())).await {
            Ok(()) => Ok(instance),
            Err(HistoryError::InstanceAlreadyExists { .. }) => {
                tracing::debug!(target: "petflow::client", instance = %instance, key = %key, "instance already started for key");
                Ok(instance)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Start an orchestration with typed input (serialized to JSON).
    pub async fn start_orchestration_typed<In: Serialize>(&self, name: &str, input: &In) -> Result<String, ClientError> {
        let payload = Json::encode(input).map_err(ClientError::Codec)?;
        self.start_orchestration(name, payload).await
    }

    pub async fn get_status(&self, instance: &str) -> Result<OrchestrationInstance, ClientError> {
        let history = self.store.read_all(instance).await?;
        OrchestrationInstance::from_history(instance, &history).ok_or_else(|| {
            ClientError::History(HistoryError::permanent(
                "get_status",
                format!("history of {instance} does not begin with OrchestratorStarted"),
            ))
        })
    }

    pub async fn read_history(&self, instance: &str) -> Result<Vec<HistoryEvent>, ClientError> {
        Ok(self.store.read_all(instance).await?)
    }

    pub async fn list_instances(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.store.list_instances().await?)
    }

    /// Raise an external event into an instance. Events raised after the
    /// instance ended are dropped.
    pub async fn raise_event(
        &self,
        instance: &str,
        name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), ClientError> {
        let kind = EventKind::ExternalEventRaised {
            name: name.into(),
            data: data.into(),
        };
        let appended = append_next(self.store.as_ref(), instance, self.max_append_retries, |history| {
            (!history.iter().any(|e| e.kind.is_terminal())).then(|| kind.clone())
        })
        .await?;
        match appended {
            Some(_) => self.notify(Signal::Wake(instance.to_string())),
            None => tracing::warn!(target: "petflow::client", instance = %instance, "event raised on ended instance dropped"),
        }
        Ok(())
    }

    /// Request termination. The next pass ends the instance as `Terminated`;
    /// activity attempts still running are not cancelled, their outcomes are
    /// discarded. A no-op on instances that already ended.
    pub async fn terminate(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        let reason = reason.into();
        let appended = append_next(self.store.as_ref(), instance, self.max_append_retries, |history| {
            let ended = history
                .iter()
                .any(|e| e.kind.is_terminal() || matches!(e.kind, EventKind::TerminateRequested { .. }));
            (!ended).then(|| EventKind::TerminateRequested { reason: reason.clone() })
        })
        .await?;
        if appended.is_some() {
            tracing::info!(target: "petflow::client", instance = %instance, reason = %reason, "termination requested");
            self.notify(Signal::Wake(instance.to_string()));
        }
        Ok(())
    }

    /// Poll until the instance reaches a terminal status.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationInstance, ClientError> {
        let poll = async {
            loop {
                let status = self.get_status(instance).await?;
                if status.status.is_terminal() {
                    return Ok::<_, ClientError>(status);
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout {
                instance: instance.to_string(),
                waited: timeout,
            }),
        }
    }
}
