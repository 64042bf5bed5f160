use crate::{
    config::{StorageConfig, SyncConfig},
    error::{EdgesyncError, Result},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Event priority tiers. High-priority events are selected for upload before
/// normal ones regardless of age.
pub const PRIORITY_HIGH: i64 = 1;
pub const PRIORITY_NORMAL: i64 = 2;

/// A locally captured event awaiting (or finished with) synchronization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub local_id: String,
    pub event_type: String,
    pub operator_id: Option<String>,
    pub event_data: serde_json::Value,
    pub image_path: Option<String>,
    pub event_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub is_synced: bool,
    pub sync_batch_id: Option<String>,
    pub priority: i64,
}

/// Status of a sync batch. Transitions are forward-only:
/// pending → sent → confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Pending,
    Sent,
    Confirmed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Sent => "sent",
            BatchStatus::Confirmed => "confirmed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "sent" => Ok(BatchStatus::Sent),
            "confirmed" => Ok(BatchStatus::Confirmed),
            other => Err(EdgesyncError::component(
                "store",
                &format!("Unknown batch status: {}", other),
            )),
        }
    }
}

/// A fixed set of events grouped for one upload-and-confirm round trip
#[derive(Debug, Clone)]
pub struct SyncBatch {
    pub id: String,
    pub batch_size: i64,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

/// The single connection-status row maintained by the connectivity monitor
/// and the sync engine
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub is_online: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_online: Option<DateTime<Utc>>,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Durable local record of events, sync batches, and connection status.
///
/// All mutations serialize through a single pooled SQLite connection; this
/// layer performs no retries — storage failures surface to the caller and
/// retry policy belongs to the sync engine.
pub struct LocalEventStore {
    pool: SqlitePool,
    max_stored_events: u32,
    priority_types: Vec<String>,
}

impl LocalEventStore {
    /// Open (creating if necessary) the event database at the configured path
    pub async fn open(storage: &StorageConfig, sync: &SyncConfig) -> Result<Self> {
        if let Some(parent) = Path::new(&storage.db_path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&storage.db_path)
            .create_if_missing(true);

        let pool = Self::build_pool(options).await?;
        let store = Self {
            pool,
            max_stored_events: sync.max_stored_events,
            priority_types: sync.priority_types.clone(),
        };
        store.create_tables().await?;

        info!("Local event store opened: {}", storage.db_path);
        Ok(store)
    }

    /// Open an in-memory store (used by tests and dry runs)
    pub async fn open_in_memory(sync: &SyncConfig) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(EdgesyncError::Storage)?;
        let pool = Self::build_pool(options).await?;
        let store = Self {
            pool,
            max_stored_events: sync.max_stored_events,
            priority_types: sync.priority_types.clone(),
        };
        store.create_tables().await?;
        Ok(store)
    }

    // Single connection, never recycled: enforces single-writer discipline
    // and keeps in-memory databases alive for the store's lifetime.
    async fn build_pool(options: SqliteConnectOptions) -> Result<SqlitePool> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(pool)
    }

    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                local_id TEXT UNIQUE NOT NULL,
                event_type TEXT NOT NULL,
                operator_id TEXT,
                event_data TEXT,
                image_path TEXT,
                event_time TEXT NOT NULL,
                created_at TEXT NOT NULL,
                is_synced INTEGER NOT NULL DEFAULT 0,
                sync_batch_id TEXT,
                priority INTEGER NOT NULL DEFAULT 2
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_batches (
                id TEXT PRIMARY KEY,
                batch_size INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                sent_at TEXT,
                confirmed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS connection_status (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                is_online INTEGER NOT NULL DEFAULT 0,
                last_check TEXT,
                last_online TEXT,
                last_sync TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO connection_status (id, is_online) VALUES (1, 0)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Store a new event locally. Priority is derived from the configured
    /// high-priority event types. Returns the generated local id.
    pub async fn store_event(
        &self,
        event_type: &str,
        event_data: &serde_json::Value,
        image_path: Option<&str>,
        operator_id: Option<&str>,
    ) -> Result<String> {
        let local_id = Uuid::new_v4().to_string();
        let priority = if self.priority_types.iter().any(|t| t == event_type) {
            PRIORITY_HIGH
        } else {
            PRIORITY_NORMAL
        };
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO events
                (local_id, event_type, operator_id, event_data, image_path,
                 event_time, created_at, is_synced, priority)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&local_id)
        .bind(event_type)
        .bind(operator_id)
        .bind(event_data.to_string())
        .bind(image_path)
        .bind(now)
        .bind(now)
        .bind(priority)
        .execute(&self.pool)
        .await?;

        info!(
            event_type = %event_type,
            local_id = %local_id,
            priority = priority,
            "Event stored locally"
        );
        Ok(local_id)
    }

    /// Read up to `limit` unconfirmed events, high priority and older events
    /// first. Non-destructive: repeated calls return the same events until
    /// they are confirmed.
    pub async fn get_pending_events(&self, limit: u32) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT local_id, event_type, operator_id, event_data, image_path,
                   event_time, created_at, is_synced, sync_batch_id, priority
            FROM events
            WHERE is_synced = 0
            ORDER BY priority ASC, created_at ASC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    /// Number of events not yet confirmed by the server
    pub async fn count_pending_events(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM events WHERE is_synced = 0")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count as u64)
    }

    /// Number of events already confirmed by the server
    pub async fn count_synced_events(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM events WHERE is_synced = 1")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count as u64)
    }

    /// Atomically create a batch and assign its id to exactly the given
    /// events. Runs in a single transaction: if any event is missing or
    /// already assigned to another batch, nothing is written.
    pub async fn create_sync_batch(&self, event_ids: &[String]) -> Result<String> {
        if event_ids.is_empty() {
            return Err(EdgesyncError::component(
                "store",
                "Cannot create an empty sync batch",
            ));
        }

        let batch_id = format!(
            "batch_{}_{}",
            Utc::now().timestamp(),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO sync_batches (id, batch_size, status, created_at) VALUES (?, ?, 'pending', ?)",
        )
        .bind(&batch_id)
        .bind(event_ids.len() as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for event_id in event_ids {
            let result = sqlx::query(
                "UPDATE events SET sync_batch_id = ? WHERE local_id = ? AND sync_batch_id IS NULL",
            )
            .bind(&batch_id)
            .bind(event_id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() != 1 {
                tx.rollback().await?;
                return Err(EdgesyncError::component(
                    "store",
                    &format!(
                        "Event {} missing or already assigned to a batch",
                        event_id
                    ),
                ));
            }
        }

        tx.commit().await?;

        debug!(batch_id = %batch_id, size = event_ids.len(), "Sync batch created");
        Ok(batch_id)
    }

    /// Mark a pending batch as sent. Status moves forward only.
    pub async fn mark_batch_sent(&self, batch_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sync_batches SET status = 'sent', sent_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now())
        .bind(batch_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a batch and all its events as confirmed. Idempotent: repeating
    /// the call leaves identical final state and is not an error.
    pub async fn mark_batch_confirmed(&self, batch_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE sync_batches
            SET status = 'confirmed', confirmed_at = COALESCE(confirmed_at, ?)
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("UPDATE events SET is_synced = 1 WHERE sync_batch_id = ?")
            .bind(batch_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(
            batch_id = %batch_id,
            events = result.rows_affected(),
            "Batch confirmed"
        );
        Ok(())
    }

    /// Fetch a batch by id
    pub async fn get_batch(&self, batch_id: &str) -> Result<Option<SyncBatch>> {
        let row = sqlx::query(
            "SELECT id, batch_size, status, created_at, sent_at, confirmed_at FROM sync_batches WHERE id = ?",
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_batch).transpose()
    }

    /// The oldest batch not yet confirmed, if any. Used for crash recovery:
    /// an unconfirmed batch is always resumed before new events are batched.
    pub async fn get_oldest_unconfirmed_batch(&self) -> Result<Option<SyncBatch>> {
        let row = sqlx::query(
            r#"
            SELECT id, batch_size, status, created_at, sent_at, confirmed_at
            FROM sync_batches
            WHERE status != 'confirmed'
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_batch).transpose()
    }

    /// The fixed set of events assigned to a batch, priority/age ordered
    pub async fn get_batch_events(&self, batch_id: &str) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT local_id, event_type, operator_id, event_data, image_path,
                   event_time, created_at, is_synced, sync_batch_id, priority
            FROM events
            WHERE sync_batch_id = ?
            ORDER BY priority ASC, created_at ASC
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    /// Record the connectivity state observed by the monitor
    pub async fn update_connection_status(&self, is_online: bool) -> Result<()> {
        let now = Utc::now();
        if is_online {
            sqlx::query(
                "UPDATE connection_status SET is_online = 1, last_check = ?, last_online = ? WHERE id = 1",
            )
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query("UPDATE connection_status SET is_online = 0, last_check = ? WHERE id = 1")
                .bind(now)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Record a successful sync cycle completion time
    pub async fn update_last_sync_time(&self) -> Result<()> {
        sqlx::query("UPDATE connection_status SET last_sync = ? WHERE id = 1")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Read the single connection-status row
    pub async fn get_connection_status(&self) -> Result<ConnectionRecord> {
        let row = sqlx::query(
            "SELECT is_online, last_check, last_online, last_sync FROM connection_status WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await?;

        let is_online: i64 = row.try_get("is_online")?;
        Ok(ConnectionRecord {
            is_online: is_online != 0,
            last_check: row.try_get("last_check")?,
            last_online: row.try_get("last_online")?,
            last_sync: row.try_get("last_sync")?,
        })
    }

    /// Delete confirmed events beyond the retention cap, oldest first.
    /// Unconfirmed events are never touched. Returns the number deleted.
    pub async fn cleanup_old_events(&self) -> Result<u64> {
        let synced = self.count_synced_events().await?;
        let max = self.max_stored_events as u64;

        if synced <= max {
            return Ok(0);
        }

        let to_delete = (synced - max) as i64;
        let result = sqlx::query(
            r#"
            DELETE FROM events
            WHERE id IN (
                SELECT id FROM events
                WHERE is_synced = 1
                ORDER BY created_at ASC
                LIMIT ?
            )
            "#,
        )
        .bind(to_delete)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted = deleted, "Retention cleanup removed old confirmed events");
        } else {
            warn!("Retention cleanup expected to delete {} events but removed none", to_delete);
        }
        Ok(deleted)
    }
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<StoredEvent> {
    let event_data: Option<String> = row.try_get("event_data")?;
    let event_data = match event_data {
        Some(raw) => serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
        None => serde_json::Value::Null,
    };
    let is_synced: i64 = row.try_get("is_synced")?;

    Ok(StoredEvent {
        local_id: row.try_get("local_id")?,
        event_type: row.try_get("event_type")?,
        operator_id: row.try_get("operator_id")?,
        event_data,
        image_path: row.try_get("image_path")?,
        event_time: row.try_get("event_time")?,
        created_at: row.try_get("created_at")?,
        is_synced: is_synced != 0,
        sync_batch_id: row.try_get("sync_batch_id")?,
        priority: row.try_get("priority")?,
    })
}

fn row_to_batch(row: &sqlx::sqlite::SqliteRow) -> Result<SyncBatch> {
    let status: String = row.try_get("status")?;
    Ok(SyncBatch {
        id: row.try_get("id")?,
        batch_size: row.try_get("batch_size")?,
        status: BatchStatus::parse(&status)?,
        created_at: row.try_get("created_at")?,
        sent_at: row.try_get("sent_at")?,
        confirmed_at: row.try_get("confirmed_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use serde_json::json;

    fn test_sync_config() -> SyncConfig {
        SyncConfig {
            batch_size: 10,
            sync_interval_seconds: 60,
            max_stored_events: 5,
            priority_types: vec!["fatigue".to_string(), "cellphone".to_string()],
            retry_attempts: 3,
            retry_delay_seconds: 1,
        }
    }

    async fn open_store() -> LocalEventStore {
        LocalEventStore::open_in_memory(&test_sync_config())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_store_and_fetch_pending() {
        let store = open_store().await;

        let id = store
            .store_event("distraction", &json!({"duration": 4.2}), None, None)
            .await
            .unwrap();

        let pending = store.get_pending_events(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].local_id, id);
        assert_eq!(pending[0].priority, PRIORITY_NORMAL);
        assert!(!pending[0].is_synced);
        assert!(pending[0].sync_batch_id.is_none());
    }

    #[tokio::test]
    async fn test_priority_derived_from_type() {
        let store = open_store().await;

        store
            .store_event("fatigue", &json!({"level": 0.9}), None, Some("op-1"))
            .await
            .unwrap();
        store
            .store_event("distraction", &json!({}), None, None)
            .await
            .unwrap();

        let pending = store.get_pending_events(10).await.unwrap();
        assert_eq!(pending[0].event_type, "fatigue");
        assert_eq!(pending[0].priority, PRIORITY_HIGH);
        assert_eq!(pending[1].priority, PRIORITY_NORMAL);
    }

    #[tokio::test]
    async fn test_priority_ordering_before_age() {
        let store = open_store().await;

        // Older normal-priority event, then newer high-priority ones
        store.store_event("distraction", &json!({}), None, None).await.unwrap();
        store.store_event("distraction", &json!({}), None, None).await.unwrap();
        store.store_event("fatigue", &json!({}), None, None).await.unwrap();
        store.store_event("cellphone", &json!({}), None, None).await.unwrap();

        let pending = store.get_pending_events(10).await.unwrap();
        assert_eq!(pending.len(), 4);
        // All priority-1 events come before any priority-2 event
        assert_eq!(pending[0].priority, PRIORITY_HIGH);
        assert_eq!(pending[1].priority, PRIORITY_HIGH);
        assert_eq!(pending[2].priority, PRIORITY_NORMAL);
        assert_eq!(pending[3].priority, PRIORITY_NORMAL);
        // Within a tier, oldest first
        assert!(pending[0].created_at <= pending[1].created_at);
        assert!(pending[2].created_at <= pending[3].created_at);
    }

    #[tokio::test]
    async fn test_batch_creation_is_atomic() {
        let store = open_store().await;

        let a = store.store_event("fatigue", &json!({}), None, None).await.unwrap();
        let b = store.store_event("fatigue", &json!({}), None, None).await.unwrap();

        let batch_id = store
            .create_sync_batch(&[a.clone(), b.clone()])
            .await
            .unwrap();

        // Assigning the same events to a second batch must fail and leave
        // the first assignment intact
        let err = store.create_sync_batch(&[a.clone()]).await;
        assert!(err.is_err());

        let events = store.get_batch_events(&batch_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.sync_batch_id.as_deref() == Some(batch_id.as_str())));
    }

    #[tokio::test]
    async fn test_batch_with_unknown_event_rolls_back() {
        let store = open_store().await;

        let a = store.store_event("fatigue", &json!({}), None, None).await.unwrap();
        let result = store
            .create_sync_batch(&[a.clone(), "no-such-event".to_string()])
            .await;
        assert!(result.is_err());

        // The partial assignment must not be observable
        let pending = store.get_pending_events(10).await.unwrap();
        assert!(pending[0].sync_batch_id.is_none());
        assert!(store.get_oldest_unconfirmed_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_confirm_is_idempotent() {
        let store = open_store().await;

        let a = store.store_event("fatigue", &json!({}), None, None).await.unwrap();
        let batch_id = store.create_sync_batch(&[a]).await.unwrap();
        store.mark_batch_sent(&batch_id).await.unwrap();

        store.mark_batch_confirmed(&batch_id).await.unwrap();
        let first = store.get_batch(&batch_id).await.unwrap().unwrap();

        store.mark_batch_confirmed(&batch_id).await.unwrap();
        let second = store.get_batch(&batch_id).await.unwrap().unwrap();

        assert_eq!(first.status, BatchStatus::Confirmed);
        assert_eq!(second.status, BatchStatus::Confirmed);
        assert_eq!(first.confirmed_at, second.confirmed_at);
        assert_eq!(store.count_pending_events().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_confirmed_events_leave_pending_set() {
        let store = open_store().await;

        let a = store.store_event("fatigue", &json!({}), None, None).await.unwrap();
        assert_eq!(store.get_pending_events(10).await.unwrap().len(), 1);

        let batch_id = store.create_sync_batch(&[a]).await.unwrap();
        // Still pending until confirmed
        assert_eq!(store.get_pending_events(10).await.unwrap().len(), 1);

        store.mark_batch_sent(&batch_id).await.unwrap();
        store.mark_batch_confirmed(&batch_id).await.unwrap();
        assert!(store.get_pending_events(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_moves_forward_only() {
        let store = open_store().await;

        let a = store.store_event("fatigue", &json!({}), None, None).await.unwrap();
        let batch_id = store.create_sync_batch(&[a]).await.unwrap();
        store.mark_batch_sent(&batch_id).await.unwrap();

        // A stray "sent" transition after confirm must not regress status
        store.mark_batch_confirmed(&batch_id).await.unwrap();
        store.mark_batch_sent(&batch_id).await.unwrap();

        let batch = store.get_batch(&batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_cleanup_respects_retention_cap() {
        let store = open_store().await;

        // 8 confirmed events against a cap of 5, plus one unsynced
        let mut ids = Vec::new();
        for _ in 0..8 {
            ids.push(
                store
                    .store_event("distraction", &json!({}), None, None)
                    .await
                    .unwrap(),
            );
        }
        store.store_event("fatigue", &json!({}), None, None).await.unwrap();

        let batch_id = store.create_sync_batch(&ids).await.unwrap();
        store.mark_batch_sent(&batch_id).await.unwrap();
        store.mark_batch_confirmed(&batch_id).await.unwrap();

        let deleted = store.cleanup_old_events().await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(store.count_synced_events().await.unwrap(), 5);
        // The unsynced event is never removed
        assert_eq!(store.count_pending_events().await.unwrap(), 1);

        // A second pass is a no-op
        assert_eq!(store.cleanup_old_events().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connection_status_row() {
        let store = open_store().await;

        let status = store.get_connection_status().await.unwrap();
        assert!(!status.is_online);
        assert!(status.last_online.is_none());

        store.update_connection_status(true).await.unwrap();
        let status = store.get_connection_status().await.unwrap();
        assert!(status.is_online);
        assert!(status.last_check.is_some());
        assert!(status.last_online.is_some());

        store.update_connection_status(false).await.unwrap();
        let status = store.get_connection_status().await.unwrap();
        assert!(!status.is_online);
        // last_online is preserved across offline transitions
        assert!(status.last_online.is_some());

        store.update_last_sync_time().await.unwrap();
        let status = store.get_connection_status().await.unwrap();
        assert!(status.last_sync.is_some());
    }

    #[tokio::test]
    async fn test_oldest_unconfirmed_batch_recovery() {
        let store = open_store().await;

        let a = store.store_event("fatigue", &json!({}), None, None).await.unwrap();
        let batch_id = store.create_sync_batch(&[a]).await.unwrap();

        let recovered = store.get_oldest_unconfirmed_batch().await.unwrap().unwrap();
        assert_eq!(recovered.id, batch_id);
        assert_eq!(recovered.status, BatchStatus::Pending);

        store.mark_batch_sent(&batch_id).await.unwrap();
        let recovered = store.get_oldest_unconfirmed_batch().await.unwrap().unwrap();
        assert_eq!(recovered.status, BatchStatus::Sent);

        store.mark_batch_confirmed(&batch_id).await.unwrap();
        assert!(store.get_oldest_unconfirmed_batch().await.unwrap().is_none());
    }
}
