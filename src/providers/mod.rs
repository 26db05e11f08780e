use crate::{EventKind, HistoryEvent};

/// Storage abstraction for append-only orchestration history per instance.
///
/// Implementations must make every successful append durable before
/// returning, serialize appends to one instance, and reject any batch whose
/// first `seq` is not the current history length.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create an instance whose history is exactly `started` at seq 0.
    async fn create_instance(&self, instance: &str, started: HistoryEvent) -> Result<(), HistoryError>;

    /// Append one event; returns its sequence number.
    async fn append(&self, instance: &str, event: HistoryEvent) -> Result<u64, HistoryError> {
        self.append_batch(instance, vec![event]).await
    }

    /// Append events atomically; returns the last sequence number written.
    async fn append_batch(&self, instance: &str, events: Vec<HistoryEvent>) -> Result<u64, HistoryError>;

    /// Full history in `seq` order.
    async fn read_all(&self, instance: &str) -> Result<Vec<HistoryEvent>, HistoryError>;

    /// Enumerate known instances.
    async fn list_instances(&self) -> Result<Vec<String>, HistoryError>;
}

/// Validate a batch against the current history length. Shared by all
/// backends so they agree on the conflict contract.
pub(crate) fn check_batch(instance: &str, current_len: u64, events: &[HistoryEvent]) -> Result<(), HistoryError> {
    let Some(first) = events.first() else {
        return Err(HistoryError::permanent("append_batch", "empty batch"));
    };
    if first.seq != current_len {
        return Err(HistoryError::ConcurrentAppendConflict {
            instance: instance.to_string(),
            expected: current_len,
            attempted: first.seq,
        });
    }
    for (offset, event) in events.iter().enumerate() {
        if event.seq != current_len + offset as u64 {
            return Err(HistoryError::permanent(
                "append_batch",
                format!("non-contiguous seq {} at batch offset {offset}", event.seq),
            ));
        }
    }
    Ok(())
}

pub(crate) fn check_started(instance: &str, started: &HistoryEvent) -> Result<(), HistoryError> {
    if started.seq != 0 || !matches!(started.kind, EventKind::OrchestratorStarted { .. }) {
        return Err(HistoryError::permanent(
            "create_instance",
            format!("instance {instance} must start with OrchestratorStarted at seq 0"),
        ));
    }
    Ok(())
}

mod error;
pub use error::HistoryError;

/// In-memory store for tests.
pub mod in_memory;
/// Filesystem-backed JSONL store.
pub mod fs;
/// SQLite-backed store.
pub mod sqlite;
