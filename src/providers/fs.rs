use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{HistoryError, HistoryStore, check_batch, check_started};
use crate::HistoryEvent;

/// Filesystem-backed history store writing one JSONL file per instance:
/// `<root>/<instance>.jsonl`, one event per line.
///
/// Appends are written with a single `write_all` and flushed with
/// `sync_all` before returning. A torn trailing line left by a crash is
/// ignored on read and truncated away by the next append. New instances are
/// staged in a hidden file and linked into place once their started event is
/// on disk.
#[derive(Clone)]
pub struct FsHistoryStore {
    root: PathBuf,
    locks: Arc<std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl FsHistoryStore {
    /// Create a new store rooted at the given directory path.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Result<Self, HistoryError> {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_error("reset", &e)),
            }
        }
        std::fs::create_dir_all(&path).map_err(|e| io_error("create_root", &e))?;
        Ok(Self {
            root: path,
            locks: Arc::new(std::sync::Mutex::new(HashMap::new())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, instance: &str) -> Result<PathBuf, HistoryError> {
        if instance.is_empty() || instance.contains(['/', '\\']) || instance.starts_with('.') {
            return Err(HistoryError::permanent(
                "path",
                format!("instance id not usable as a file name: {instance:?}"),
            ));
        }
        Ok(self.root.join(format!("{instance}.jsonl")))
    }

    fn lock_for(&self, instance: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut g = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        g.entry(instance.to_string()).or_default().clone()
    }

    /// Drop the instance's lock entry once no caller holds or awaits it.
    /// Clones are only taken under the map lock, so the count check is exact.
    fn release_lock(&self, instance: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        let mut g = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if g.get(instance).is_some_and(|l| Arc::strong_count(l) == 1) {
            g.remove(instance);
        }
    }

    /// Parse the file, returning the events and the byte length of the
    /// complete lines they came from. Bytes after the last newline are a torn
    /// write and may end mid-character, so lines are split as bytes.
    async fn load(&self, instance: &str, path: &Path) -> Result<(Vec<HistoryEvent>, u64), HistoryError> {
        let data = match fs::read(path).await {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(HistoryError::InstanceNotFound {
                    instance: instance.to_string(),
                });
            }
            Err(e) => return Err(io_error("read_all", &e)),
        };
        let mut out = Vec::new();
        let mut valid = 0u64;
        let mut rest = data.as_slice();
        while let Some(end) = rest.iter().position(|b| *b == b'\n') {
            let line = &rest[..end];
            if !line.iter().all(u8::is_ascii_whitespace) {
                let ev = serde_json::from_slice::<HistoryEvent>(line).map_err(|e| {
                    HistoryError::permanent("read_all", format!("{}: corrupt line {}: {e}", path.display(), out.len()))
                })?;
                out.push(ev);
            }
            valid += end as u64 + 1;
            rest = &rest[end + 1..];
        }
        if !rest.is_empty() {
            tracing::warn!(
                target: "petflow::providers::fs",
                instance = %instance,
                torn_bytes = rest.len(),
                "ignoring torn trailing line"
            );
        }
        Ok((out, valid))
    }

    async fn create_locked(&self, instance: &str, path: &Path, started: &HistoryEvent) -> Result<(), HistoryError> {
        if fs::try_exists(path).await.map_err(|e| io_error("create_instance", &e))? {
            return Err(HistoryError::InstanceAlreadyExists {
                instance: instance.to_string(),
            });
        }
        // Staged under a dot-name that is never listed, then linked into place
        // so a crash never leaves a visible instance without its started event.
        let staged = self.root.join(format!(".{instance}.jsonl.tmp"));
        let buf = encode_lines(std::slice::from_ref(started))?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&staged)
            .await
            .map_err(|e| io_error("create_instance", &e))?;
        file.write_all(&buf).await.map_err(|e| io_error("create_instance", &e))?;
        file.sync_all().await.map_err(|e| io_error("create_instance", &e))?;
        drop(file);

        let linked = fs::hard_link(&staged, path).await;
        let _ = fs::remove_file(&staged).await;
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(HistoryError::InstanceAlreadyExists {
                instance: instance.to_string(),
            }),
            Err(e) => Err(io_error("create_instance", &e)),
        }
    }

    async fn append_locked(&self, instance: &str, path: &Path, events: Vec<HistoryEvent>) -> Result<u64, HistoryError> {
        let (existing, valid_len) = self.load(instance, path).await?;
        check_batch(instance, existing.len() as u64, &events)?;
        let buf = encode_lines(&events)?;

        // Append mode writes land at the end even after truncation.
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(path)
            .await
            .map_err(|e| io_error("append_batch", &e))?;
        file.set_len(valid_len).await.map_err(|e| io_error("append_batch", &e))?;
        file.write_all(&buf).await.map_err(|e| io_error("append_batch", &e))?;
        file.sync_all().await.map_err(|e| io_error("append_batch", &e))?;
        Ok(existing.len() as u64 + events.len() as u64 - 1)
    }
}

fn io_error(operation: &str, e: &std::io::Error) -> HistoryError {
    let retryable = matches!(
        e.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    );
    HistoryError::Storage {
        operation: operation.to_string(),
        message: e.to_string(),
        retryable,
    }
}

fn encode_lines(events: &[HistoryEvent]) -> Result<Vec<u8>, HistoryError> {
    let mut buf = Vec::new();
    for ev in events {
        serde_json::to_writer(&mut buf, ev).map_err(|e| HistoryError::permanent("encode", e.to_string()))?;
        buf.push(b'\n');
    }
    Ok(buf)
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn create_instance(&self, instance: &str, started: HistoryEvent) -> Result<(), HistoryError> {
        check_started(instance, &started)?;
        let path = self.path(instance)?;
        let lock = self.lock_for(instance);
        let result = {
            let _g = lock.lock().await;
            self.create_locked(instance, &path, &started).await
        };
        self.release_lock(instance, lock);
        result
    }

    async fn append_batch(&self, instance: &str, events: Vec<HistoryEvent>) -> Result<u64, HistoryError> {
        let path = self.path(instance)?;
        let lock = self.lock_for(instance);
        let result = {
            let _g = lock.lock().await;
            self.append_locked(instance, &path, events).await
        };
        self.release_lock(instance, lock);
        result
    }

    async fn read_all(&self, instance: &str) -> Result<Vec<HistoryEvent>, HistoryError> {
        let path = self.path(instance)?;
        let lock = self.lock_for(instance);
        let result = {
            let _g = lock.lock().await;
            self.load(instance, &path).await.map(|(events, _)| events)
        };
        self.release_lock(instance, lock);
        result
    }

    async fn list_instances(&self) -> Result<Vec<String>, HistoryError> {
        let mut out = Vec::new();
        let mut rd = fs::read_dir(&self.root).await.map_err(|e| io_error("list_instances", &e))?;
        while let Some(entry) = rd.next_entry().await.map_err(|e| io_error("list_instances", &e))? {
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".jsonl")) {
                out.push(id.to_string());
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;

    fn started() -> HistoryEvent {
        HistoryEvent::new(
            0,
            EventKind::OrchestratorStarted {
                name: "Flow".into(),
                input: "x".into(),
                idempotency_key: None,
            },
        )
    }

    #[tokio::test]
    async fn torn_trailing_line_is_ignored_and_overwritten() {
        let td = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(td.path(), false).unwrap();
        store.create_instance("i1", started()).await.unwrap();

        // Simulate a crash halfway through writing a line
        let path = td.path().join("i1.jsonl");
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(b"{\"seq\":1,\"timest");
        std::fs::write(&path, raw).unwrap();

        assert_eq!(store.read_all("i1").await.unwrap().len(), 1);
        let ev = HistoryEvent::new(1, EventKind::TerminateRequested { reason: "r".into() });
        assert_eq!(store.append("i1", ev.clone()).await.unwrap(), 1);
        let hist = store.read_all("i1").await.unwrap();
        assert_eq!(hist.len(), 2);
        assert_eq!(hist[1], ev);
    }

    #[tokio::test]
    async fn torn_line_ending_inside_a_multibyte_character_is_ignored() {
        let td = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(td.path(), false).unwrap();
        store.create_instance("i1", started()).await.unwrap();

        // "café" cut between the two bytes of 'é'
        let path = td.path().join("i1.jsonl");
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(b"{\"seq\":1,\"timestamp_ms\":0,\"kind\":{\"ExternalEventRaised\":{\"name\":\"caf\xc3");
        std::fs::write(&path, raw).unwrap();

        let hist = store.read_all("i1").await.unwrap();
        assert_eq!(hist.len(), 1);
        assert!(matches!(hist[0].kind, EventKind::OrchestratorStarted { .. }));

        let ev = HistoryEvent::new(
            1,
            EventKind::ExternalEventRaised {
                name: "café".into(),
                data: "crème".into(),
            },
        );
        assert_eq!(store.append("i1", ev.clone()).await.unwrap(), 1);
        let hist = store.read_all("i1").await.unwrap();
        assert_eq!(hist, vec![hist[0].clone(), ev]);
    }

    #[tokio::test]
    async fn leftover_staging_file_is_invisible_and_replaced() {
        let td = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(td.path(), false).unwrap();

        // A crash after staging but before linking leaves only the staged file
        std::fs::write(td.path().join(".i1.jsonl.tmp"), b"").unwrap();
        assert!(store.list_instances().await.unwrap().is_empty());
        assert!(matches!(
            store.read_all("i1").await.unwrap_err(),
            HistoryError::InstanceNotFound { .. }
        ));

        store.create_instance("i1", started()).await.unwrap();
        assert_eq!(store.list_instances().await.unwrap(), vec!["i1"]);
        assert_eq!(store.read_all("i1").await.unwrap().len(), 1);
        assert!(!td.path().join(".i1.jsonl.tmp").exists());
        assert!(matches!(
            store.create_instance("i1", started()).await.unwrap_err(),
            HistoryError::InstanceAlreadyExists { .. }
        ));
    }

    #[tokio::test]
    async fn instance_locks_are_released_when_idle() {
        let td = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(td.path(), false).unwrap();
        for i in 0..5 {
            let id = format!("i{i}");
            store.create_instance(&id, started()).await.unwrap();
            store
                .append(&id, HistoryEvent::new(1, EventKind::TerminateRequested { reason: "r".into() }))
                .await
                .unwrap();
            store.read_all(&id).await.unwrap();
        }
        let _ = store.read_all("missing").await;
        assert!(store.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_path_like_instance_ids() {
        let td = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(td.path(), false).unwrap();
        let err = store.create_instance("../escape", started()).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
