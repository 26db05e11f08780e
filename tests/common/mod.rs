#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use petflow::providers::HistoryStore;
use petflow::providers::fs::FsHistoryStore;
use petflow::providers::in_memory::InMemoryHistoryStore;
use petflow::providers::sqlite::SqliteHistoryStore;
use petflow::runtime::RuntimeOptions;
use petflow::{BackoffStrategy, EventKind, HistoryEvent, OrchestrationStatus, RetryPolicy};
use tempfile::TempDir;

pub async fn wait_for_history<F>(store: Arc<dyn HistoryStore>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[HistoryEvent]) -> bool,
{
    wait_for_history_event(
        store,
        instance,
        |hist| if predicate(hist) { Some(()) } else { None },
        timeout_ms,
    )
    .await
    .is_some()
}

pub async fn wait_for_history_event<T, F>(
    store: Arc<dyn HistoryStore>,
    instance: &str,
    selector: F,
    timeout_ms: u64,
) -> Option<T>
where
    F: Fn(&[HistoryEvent]) -> Option<T>,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(hist) = store.read_all(instance).await
            && let Some(found) = selector(&hist)
        {
            return Some(found);
        }
        if Instant::now() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Options with millisecond backoff so retry paths finish quickly.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        dispatcher_idle_sleep_ms: 5,
        retry_policy: RetryPolicy::new(3).with_backoff(BackoffStrategy::Fixed {
            delay: Duration::from_millis(1),
        }),
        ..RuntimeOptions::default()
    }
}

pub fn in_memory_store() -> Arc<dyn HistoryStore> {
    Arc::new(InMemoryHistoryStore::new())
}

pub fn fs_store() -> (Arc<dyn HistoryStore>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let store = FsHistoryStore::new(td.path().join("history"), false).unwrap();
    (Arc::new(store) as Arc<dyn HistoryStore>, td)
}

pub async fn create_sqlite_store_disk() -> (Arc<dyn HistoryStore>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let store = SqliteHistoryStore::open(td.path().join("history.db")).await.unwrap();
    (Arc::new(store) as Arc<dyn HistoryStore>, td)
}

pub fn count_scheduled(hist: &[HistoryEvent], activity: &str) -> usize {
    hist.iter()
        .filter(|e| matches!(&e.kind, EventKind::ActivityScheduled { name, .. } if name == activity))
        .count()
}

pub fn count_outcomes(hist: &[HistoryEvent], correlation_id: u64) -> usize {
    hist.iter()
        .filter(|e| match &e.kind {
            EventKind::ActivityCompleted { correlation_id: c, .. } | EventKind::ActivityFailed { correlation_id: c, .. } => {
                *c == correlation_id
            }
            _ => false,
        })
        .count()
}

/// Sequence numbers must run 0..len without gaps.
pub fn assert_contiguous(hist: &[HistoryEvent]) {
    for (i, e) in hist.iter().enumerate() {
        assert_eq!(e.seq, i as u64, "gap or reorder at position {i}: {hist:#?}");
    }
}

pub fn assert_single_terminal(hist: &[HistoryEvent]) {
    let terminals = hist.iter().filter(|e| e.kind.is_terminal()).count();
    assert_eq!(terminals, 1, "expected exactly one terminal event: {hist:#?}");
    assert!(hist.last().unwrap().kind.is_terminal(), "terminal event must be last");
}

pub fn is_terminal_status(status: OrchestrationStatus) -> bool {
    status.is_terminal()
}
