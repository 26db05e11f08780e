use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use super::{HistoryError, HistoryStore, check_batch, check_started};
use crate::HistoryEvent;

/// SQLite-backed history store.
///
/// One row per event in `history(instance_id, seq, ...)` keyed by
/// `(instance_id, seq)`. Each batch is one transaction, so the primary key is
/// what finally serializes competing writers: whichever commits second sees
/// a constraint violation and gets `ConcurrentAppendConflict`.
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    /// Convert sqlx error to HistoryError with appropriate retry classification
    fn sqlx_to_history_error(operation: &str, e: sqlx::Error) -> HistoryError {
        let error_msg = e.to_string();

        // Check for SQLITE_BUSY (database locked) - retryable
        if error_msg.contains("database is locked") || error_msg.contains("SQLITE_BUSY") {
            return HistoryError::retryable(operation, format!("Database locked: {error_msg}"));
        }

        // Check for connection errors - retryable
        if error_msg.contains("connection") || error_msg.contains("timeout") {
            return HistoryError::retryable(operation, format!("Connection error: {error_msg}"));
        }

        HistoryError::permanent(operation, error_msg)
    }

    fn is_unique_violation(e: &sqlx::Error) -> bool {
        matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
    }

    /// Open (or create) a store.
    ///
    /// # Arguments
    /// * `database_url` - SQLite connection string (e.g., "sqlite:data.db?mode=rwc")
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new(database_url: &str) -> Result<Self, HistoryError> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        // An in-memory database lives only as long as its one connection
        let pool_options = if is_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        // Every commit must reach disk before append returns
                        sqlx::query("PRAGMA synchronous = FULL").execute(&mut *conn).await?;
                    }
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await
            .map_err(|e| Self::sqlx_to_history_error("connect", e))?;

        Self::create_schema(&pool).await?;
        tracing::debug!(target: "petflow::providers::sqlite", url = %database_url, "sqlite history store ready");
        Ok(Self { pool })
    }

    /// Open a database file under `path`, creating it if missing.
    pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self, HistoryError> {
        Self::new(&format!("sqlite:{}?mode=rwc", path.as_ref().display())).await
    }

    /// Private in-memory database, mainly for tests.
    pub async fn new_in_memory() -> Result<Self, HistoryError> {
        Self::new("sqlite::memory:").await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), HistoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                instance_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (instance_id, seq)
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| Self::sqlx_to_history_error("create_schema", e))?;
        Ok(())
    }

    fn encode(event: &HistoryEvent) -> Result<String, HistoryError> {
        serde_json::to_string(event).map_err(|e| HistoryError::permanent("encode", e.to_string()))
    }
}

#[async_trait::async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn create_instance(&self, instance: &str, started: HistoryEvent) -> Result<(), HistoryError> {
        check_started(instance, &started)?;
        let data = Self::encode(&started)?;
        let res = sqlx::query(
            "INSERT INTO history (instance_id, seq, event_type, event_data, created_at) VALUES (?, 0, ?, ?, ?)",
        )
        .bind(instance)
        .bind(started.kind.type_name())
        .bind(data)
        .bind(started.timestamp_ms as i64)
        .execute(&self.pool)
        .await;
        match res {
            Ok(_) => Ok(()),
            Err(e) if Self::is_unique_violation(&e) => Err(HistoryError::InstanceAlreadyExists {
                instance: instance.to_string(),
            }),
            Err(e) => Err(Self::sqlx_to_history_error("create_instance", e)),
        }
    }

    async fn append_batch(&self, instance: &str, events: Vec<HistoryEvent>) -> Result<u64, HistoryError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_history_error("append_batch", e))?;

        let len: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM history WHERE instance_id = ?")
            .bind(instance)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_history_error("append_batch", e))?;
        if len == 0 {
            return Err(HistoryError::InstanceNotFound {
                instance: instance.to_string(),
            });
        }
        check_batch(instance, len as u64, &events)?;

        for event in &events {
            let res = sqlx::query(
                "INSERT INTO history (instance_id, seq, event_type, event_data, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(instance)
            .bind(event.seq as i64)
            .bind(event.kind.type_name())
            .bind(Self::encode(event)?)
            .bind(event.timestamp_ms as i64)
            .execute(&mut *tx)
            .await;
            if let Err(e) = res {
                if Self::is_unique_violation(&e) {
                    return Err(HistoryError::ConcurrentAppendConflict {
                        instance: instance.to_string(),
                        expected: event.seq + 1,
                        attempted: event.seq,
                    });
                }
                return Err(Self::sqlx_to_history_error("append_batch", e));
            }
        }

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_history_error("append_batch", e))?;
        Ok(len as u64 + events.len() as u64 - 1)
    }

    async fn read_all(&self, instance: &str) -> Result<Vec<HistoryEvent>, HistoryError> {
        let rows = sqlx::query("SELECT event_data FROM history WHERE instance_id = ? ORDER BY seq")
            .bind(instance)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_history_error("read_all", e))?;
        if rows.is_empty() {
            return Err(HistoryError::InstanceNotFound {
                instance: instance.to_string(),
            });
        }

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let event_data: String = row
                .try_get("event_data")
                .map_err(|e| HistoryError::permanent("read_all", format!("Failed to get event_data: {e}")))?;
            let event: HistoryEvent = serde_json::from_str(&event_data)
                .map_err(|e| HistoryError::permanent("read_all", format!("Failed to deserialize event: {e}")))?;
            events.push(event);
        }
        Ok(events)
    }

    async fn list_instances(&self) -> Result<Vec<String>, HistoryError> {
        sqlx::query_scalar::<_, String>("SELECT DISTINCT instance_id FROM history ORDER BY instance_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_history_error("list_instances", e))
    }
}
