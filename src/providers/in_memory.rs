use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{HistoryError, HistoryStore, check_batch, check_started};
use crate::HistoryEvent;

type Log = Arc<Mutex<Vec<HistoryEvent>>>;

/// Process-local store. Durable only for the life of the process.
///
/// The outer map lock is held just long enough to find an instance; each
/// instance's log has its own lock so appends to different instances never
/// wait on each other.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    instances: Mutex<HashMap<String, Log>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn log(&self, instance: &str) -> Result<Log, HistoryError> {
        self.instances
            .lock()
            .await
            .get(instance)
            .cloned()
            .ok_or_else(|| HistoryError::InstanceNotFound {
                instance: instance.to_string(),
            })
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(&self, instance: &str, started: HistoryEvent) -> Result<(), HistoryError> {
        check_started(instance, &started)?;
        let mut g = self.instances.lock().await;
        if g.contains_key(instance) {
            return Err(HistoryError::InstanceAlreadyExists {
                instance: instance.to_string(),
            });
        }
        g.insert(instance.to_string(), Arc::new(Mutex::new(vec![started])));
        Ok(())
    }

    async fn append_batch(&self, instance: &str, events: Vec<HistoryEvent>) -> Result<u64, HistoryError> {
        let log = self.log(instance).await?;
        let mut g = log.lock().await;
        check_batch(instance, g.len() as u64, &events)?;
        g.extend(events);
        Ok(g.len() as u64 - 1)
    }

    async fn read_all(&self, instance: &str) -> Result<Vec<HistoryEvent>, HistoryError> {
        let log = self.log(instance).await?;
        let g = log.lock().await;
        Ok(g.clone())
    }

    async fn list_instances(&self) -> Result<Vec<String>, HistoryError> {
        let mut ids: Vec<String> = self.instances.lock().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
