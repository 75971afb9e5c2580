// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::Path;

use asa_core::{CategoryMapping, Checkpoint, QueuedEvent};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::warn;

/// Maximum length, in bytes, a single `event_data` blob is allowed
/// before its `title` field is truncated on enqueue.
const MAX_EVENT_DATA_BYTES: usize = 8192;
/// Fraction of `max_size` above which [`OfflineQueue::is_near_capacity`]
/// reports true.
const NEAR_CAPACITY_THRESHOLD: f64 = 0.8;

/// Errors raised by [`OfflineQueue`] operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The underlying SQLite store failed.
    #[error("queue storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// A durable, bounded FIFO queue of events awaiting delivery, plus
/// per-bucket checkpoints and a cached category mapping table.
///
/// Invariant: `enqueue` never fails due to capacity; when the queue is
/// at `max_size` the oldest entries are evicted to make room, and the
/// caller is told how many were dropped.
pub struct OfflineQueue {
    conn: Mutex<Connection>,
    max_size: usize,
}

impl OfflineQueue {
    /// Open (creating if absent) the queue database at `path`.
    pub fn open(path: &Path, max_size: usize) -> Result<Self, QueueError> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_size,
        })
    }

    /// Open an in-memory queue, primarily for tests.
    pub fn open_in_memory(max_size: usize) -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_size,
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), QueueError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS queued_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS sync_checkpoints (
                bucket_id TEXT PRIMARY KEY,
                last_event_id INTEGER NOT NULL,
                last_timestamp TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS category_cache (
                pattern TEXT PRIMARY KEY,
                category TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queued_events_created_at
                ON queued_events(created_at);",
        )?;
        Ok(())
    }

    /// Enqueue an event. Truncates an oversized `title` field first; if
    /// the queue is already at capacity, evicts the oldest entries to
    /// make room. Returns the number of entries evicted.
    pub fn enqueue(&self, mut event_data: serde_json::Value) -> Result<usize, QueueError> {
        truncate_oversized_title(&mut event_data);
        let payload = serde_json::to_string(&event_data).expect("serde_json::Value always serializes");

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let current: i64 = tx.query_row("SELECT COUNT(*) FROM queued_events", [], |r| r.get(0))?;
        let mut evicted = 0usize;
        if current as usize >= self.max_size {
            let overflow = current as usize + 1 - self.max_size;
            evicted = Self::evict_oldest_tx(&tx, overflow)?;
            warn!(evicted, "offline queue at capacity, evicted oldest entries");
        }

        tx.execute(
            "INSERT INTO queued_events (event_data, created_at, retry_count) VALUES (?1, ?2, 0)",
            params![payload, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(evicted)
    }

    fn evict_oldest_tx(tx: &rusqlite::Transaction<'_>, count: usize) -> Result<usize, QueueError> {
        // row_id order is the true FIFO/insertion order; created_at is a
        // TEXT timestamp that ties within the same tick and can't be
        // trusted to break ties consistently.
        let removed = tx.execute(
            "DELETE FROM queued_events WHERE id IN (
                SELECT id FROM queued_events ORDER BY id ASC LIMIT ?1
            )",
            params![count as i64],
        )?;
        Ok(removed)
    }

    /// Dequeue up to `batch_size` events, oldest first, without removing
    /// them (callers remove only after a confirmed successful send).
    pub fn peek_batch(&self, batch_size: usize) -> Result<Vec<QueuedEvent>, QueueError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, event_data, created_at, retry_count FROM queued_events
             ORDER BY id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![batch_size as i64], |row| {
            let raw: String = row.get(1)?;
            let created_at: String = row.get(2)?;
            Ok((row.get::<_, i64>(0)?, raw, created_at, row.get::<_, u32>(3)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, raw, created_at, retry_count) = row?;
            let event_data: serde_json::Value = serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null);
            let created_at: DateTime<Utc> = created_at.parse().unwrap_or_else(|_| Utc::now());
            out.push(QueuedEvent { id, event_data, created_at, retry_count });
        }
        Ok(out)
    }

    /// Remove specific rows by id, typically after a confirmed send.
    pub fn remove(&self, ids: &[i64]) -> Result<usize, QueueError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("DELETE FROM queued_events WHERE id IN ({placeholders})");
        let params: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        Ok(conn.execute(&sql, params.as_slice())?)
    }

    /// Increment the retry counter for the given rows.
    pub fn increment_retry(&self, ids: &[i64]) -> Result<(), QueueError> {
        let conn = self.conn.lock();
        for id in ids {
            conn.execute(
                "UPDATE queued_events SET retry_count = retry_count + 1 WHERE id = ?1",
                params![id],
            )?;
        }
        Ok(())
    }

    /// Drop every row whose retry count has reached `max_retries`.
    /// Returns the number of rows dropped.
    pub fn remove_failed(&self, max_retries: u32) -> Result<usize, QueueError> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "DELETE FROM queued_events WHERE retry_count >= ?1",
            params![max_retries],
        )?)
    }

    /// Number of rows currently queued.
    pub fn len(&self) -> Result<usize, QueueError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM queued_events", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    /// Fraction of `max_size` currently occupied, in `[0.0, 1.0+]`.
    pub fn capacity_fraction(&self) -> Result<f64, QueueError> {
        Ok(self.len()? as f64 / self.max_size as f64)
    }

    /// Whether the queue has crossed the near-capacity warning threshold.
    pub fn is_near_capacity(&self) -> Result<bool, QueueError> {
        Ok(self.capacity_fraction()? >= NEAR_CAPACITY_THRESHOLD)
    }

    /// Remove every queued event.
    pub fn clear(&self) -> Result<(), QueueError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM queued_events", [])?;
        Ok(())
    }

    /// Drop every queued event older than `age`. Returns the number of
    /// rows dropped.
    pub fn expire_older_than(&self, age: chrono::Duration) -> Result<usize, QueueError> {
        let cutoff = (Utc::now() - age).to_rfc3339();
        let conn = self.conn.lock();
        Ok(conn.execute(
            "DELETE FROM queued_events WHERE created_at < ?1",
            params![cutoff],
        )?)
    }

    /// Fetch a bucket's checkpoint, if one has been recorded.
    pub fn get_checkpoint(&self, bucket_id: &str) -> Result<Option<Checkpoint>, QueueError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT bucket_id, last_event_id, last_timestamp, updated_at
             FROM sync_checkpoints WHERE bucket_id = ?1",
            params![bucket_id],
            |row| {
                Ok(Checkpoint {
                    bucket_id: row.get(0)?,
                    last_event_id: row.get(1)?,
                    last_timestamp: row.get::<_, String>(2)?.parse().unwrap_or_else(|_| Utc::now()),
                    updated_at: row.get::<_, String>(3)?.parse().unwrap_or_else(|_| Utc::now()),
                })
            },
        )
        .optional()
        .map_err(QueueError::from)
    }

    /// Upsert a bucket's checkpoint.
    pub fn set_checkpoint(
        &self,
        bucket_id: &str,
        last_event_id: i64,
        last_timestamp: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_checkpoints (bucket_id, last_event_id, last_timestamp, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(bucket_id) DO UPDATE SET
                last_event_id = excluded.last_event_id,
                last_timestamp = excluded.last_timestamp,
                updated_at = excluded.updated_at",
            params![bucket_id, last_event_id, last_timestamp.to_rfc3339(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Fetch every recorded checkpoint.
    pub fn all_checkpoints(&self) -> Result<Vec<Checkpoint>, QueueError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT bucket_id, last_event_id, last_timestamp, updated_at FROM sync_checkpoints",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Checkpoint {
                bucket_id: row.get(0)?,
                last_event_id: row.get(1)?,
                last_timestamp: row.get::<_, String>(2)?.parse().unwrap_or_else(|_| Utc::now()),
                updated_at: row.get::<_, String>(3)?.parse().unwrap_or_else(|_| Utc::now()),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(QueueError::from)
    }

    /// Replace the cached category mapping table wholesale.
    pub fn set_category_mappings(&self, mappings: &[CategoryMapping]) -> Result<(), QueueError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM category_cache", [])?;
        for m in mappings {
            tx.execute(
                "INSERT INTO category_cache (pattern, category, updated_at) VALUES (?1, ?2, ?3)",
                params![m.pattern, m.category, Utc::now().to_rfc3339()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Fetch the cached category mapping table.
    pub fn category_mappings(&self) -> Result<Vec<CategoryMapping>, QueueError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT pattern, category FROM category_cache")?;
        let rows = stmt.query_map([], |row| {
            Ok(CategoryMapping {
                pattern: row.get(0)?,
                category: row.get(1)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(QueueError::from)
    }
}

fn truncate_oversized_title(event_data: &mut serde_json::Value) {
    let Some(obj) = event_data.as_object_mut() else { return };
    let size = serde_json::to_string(&*obj).map(|s| s.len()).unwrap_or(0);
    if size <= MAX_EVENT_DATA_BYTES {
        return;
    }
    if let Some(serde_json::Value::String(title)) = obj.get_mut("title") {
        let truncated: String = title.chars().take(256).collect();
        *title = format!("{truncated}…[truncated]");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_dequeue_round_trip() {
        let q = OfflineQueue::open_in_memory(10).unwrap();
        q.enqueue(serde_json::json!({"id": 1})).unwrap();
        q.enqueue(serde_json::json!({"id": 2})).unwrap();
        assert_eq!(q.len().unwrap(), 2);
        let batch = q.peek_batch(10).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].event_data["id"], 1);
    }

    #[test]
    fn enqueue_evicts_oldest_at_capacity() {
        let q = OfflineQueue::open_in_memory(2).unwrap();
        q.enqueue(serde_json::json!({"id": 1})).unwrap();
        q.enqueue(serde_json::json!({"id": 2})).unwrap();
        let evicted = q.enqueue(serde_json::json!({"id": 3})).unwrap();
        assert_eq!(evicted, 1);
        let batch = q.peek_batch(10).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].event_data["id"], 2);
        assert_eq!(batch[1].event_data["id"], 3);
    }

    #[test]
    fn remove_failed_drops_exhausted_rows() {
        let q = OfflineQueue::open_in_memory(10).unwrap();
        q.enqueue(serde_json::json!({"id": 1})).unwrap();
        let batch = q.peek_batch(10).unwrap();
        for _ in 0..3 {
            q.increment_retry(&[batch[0].id]).unwrap();
        }
        let dropped = q.remove_failed(3).unwrap();
        assert_eq!(dropped, 1);
        assert!(q.is_empty().unwrap());
    }

    #[test]
    fn checkpoint_upserts() {
        let q = OfflineQueue::open_in_memory(10).unwrap();
        let ts = Utc::now();
        q.set_checkpoint("win_host", 5, ts).unwrap();
        q.set_checkpoint("win_host", 9, ts).unwrap();
        let cp = q.get_checkpoint("win_host").unwrap().unwrap();
        assert_eq!(cp.last_event_id, 9);
    }

    #[test]
    fn near_capacity_threshold() {
        let q = OfflineQueue::open_in_memory(10).unwrap();
        for i in 0..8 {
            q.enqueue(serde_json::json!({"id": i})).unwrap();
        }
        assert!(q.is_near_capacity().unwrap());
    }

    #[test]
    fn expire_older_than_drops_stale_rows() {
        let q = OfflineQueue::open_in_memory(10).unwrap();
        q.enqueue(serde_json::json!({"id": 1})).unwrap();
        {
            let conn = q.conn.lock();
            conn.execute(
                "UPDATE queued_events SET created_at = ?1",
                params![(Utc::now() - chrono::Duration::hours(48)).to_rfc3339()],
            )
            .unwrap();
        }
        q.enqueue(serde_json::json!({"id": 2})).unwrap();
        let dropped = q.expire_older_than(chrono::Duration::hours(24)).unwrap();
        assert_eq!(dropped, 1);
        assert_eq!(q.len().unwrap(), 1);
    }
}
