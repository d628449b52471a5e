//! Durable append log of events (§4.1).

use async_trait::async_trait;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;

use crate::clock::VectorClock;
use crate::event::{Event, EventId, Payload};
use crate::identity::NodeId;

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage failed: {0}")]
    StorageFailed(#[from] sqlx::Error),
    #[error("stored payload is not valid JSON: {0}")]
    CorruptPayload(String),
}

/// The durable event log contract (§4.1). Concurrent reads are allowed;
/// writes are serialized by the store itself (not by the caller) — the
/// reference implementation relies on `sqlx`'s SQLite connection pool and
/// a single writer transaction per `save_event(s)` call for that.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn initialize(&self) -> Result<(), EventStoreError>;

    /// Upsert by `id`. Returns `true` if the event was newly inserted,
    /// `false` if an event with that id already existed (a no-op that
    /// does NOT bump the watermark — §4.1, §8 property 6).
    async fn save_event(&self, event: Event) -> Result<bool, EventStoreError>;

    /// Batched, all-or-nothing version of [`EventStore::save_event`].
    /// Returns the number of events that were newly inserted.
    async fn save_events(&self, events: Vec<Event>) -> Result<usize, EventStoreError>;

    async fn get_events_since(
        &self,
        node_id: &NodeId,
        after_timestamp: u64,
        limit: Option<u32>,
    ) -> Result<Vec<Event>, EventStoreError>;

    async fn get_all_events(&self) -> Result<Vec<Event>, EventStoreError>;

    async fn get_events_in_range(
        &self,
        start: u64,
        end: u64,
        node_id: Option<&NodeId>,
        limit: Option<u32>,
    ) -> Result<Vec<Event>, EventStoreError>;

    async fn get_event(&self, id: &EventId) -> Result<Option<Event>, EventStoreError>;
    async fn has_event(&self, id: &EventId) -> Result<bool, EventStoreError>;
    async fn get_event_count(&self) -> Result<u64, EventStoreError>;
    async fn get_event_count_for_node(&self, node_id: &NodeId) -> Result<u64, EventStoreError>;

    /// The highest *contiguous* timestamp known for `node_id` (the
    /// watermark). If the store holds `{1,2,4}` this returns `2`, not `4`.
    async fn get_latest_timestamp_for_node(&self, node_id: &NodeId) -> Result<u64, EventStoreError>;

    /// The full watermark map — this IS the vector clock (§3).
    async fn get_latest_timestamps_for_all_nodes(&self) -> Result<VectorClock, EventStoreError>;

    async fn remove_events_older_than(&self, creation_timestamp: u64) -> Result<u64, EventStoreError>;
    async fn remove_events_for_node(&self, node_id: &NodeId) -> Result<u64, EventStoreError>;
    async fn clear(&self) -> Result<(), EventStoreError>;
    async fn close(&self) -> Result<(), EventStoreError>;
}

/// SQLite-backed reference implementation.
///
/// The watermark table is maintained inside the same transaction as every
/// insert so it can never diverge from the row set, even across a crash
/// between statements (§4.1 implementation note in SPEC_FULL.md).
pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Recompute the contiguous watermark for `node_id` from the rows
    /// currently present and persist it. Used both after a normal insert
    /// (cheap: the new watermark is either unchanged or the inserted
    /// timestamp) and after a prune (expensive but rare: a full scan).
    async fn recompute_watermark(
        tx: &mut Transaction<'_, Sqlite>,
        node_id: &NodeId,
    ) -> Result<u64, sqlx::Error> {
        let rows = sqlx::query("SELECT timestamp FROM events WHERE node_id = ? ORDER BY timestamp ASC")
            .bind(node_id.as_str())
            .fetch_all(&mut **tx)
            .await?;

        let mut watermark = 0u64;
        for row in rows {
            let ts: i64 = row.get("timestamp");
            let ts = ts as u64;
            if ts == watermark + 1 {
                watermark = ts;
            } else if ts <= watermark {
                continue;
            } else {
                break; // gap — stop at the end of the contiguous prefix
            }
        }

        sqlx::query(
            "INSERT INTO watermarks (node_id, watermark) VALUES (?, ?)
             ON CONFLICT(node_id) DO UPDATE SET watermark = excluded.watermark",
        )
        .bind(node_id.as_str())
        .bind(watermark as i64)
        .execute(&mut **tx)
        .await?;

        Ok(watermark)
    }

    fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<Event, EventStoreError> {
        let id: String = row.get("id");
        let node_id: String = row.get("node_id");
        let timestamp: i64 = row.get("timestamp");
        let creation_timestamp: i64 = row.get("creation_timestamp");
        let payload_json: String = row.get("payload_json");

        let payload: Payload = serde_json::from_str(&payload_json)
            .map_err(|e| EventStoreError::CorruptPayload(e.to_string()))?;

        Ok(Event {
            id: EventId::from(id),
            node_id: NodeId::new(node_id).expect("node ids stored by this crate are always valid"),
            timestamp: timestamp as u64,
            creation_timestamp: creation_timestamp as u64,
            payload,
        })
    }

    /// Insert `event` within an already-open transaction if it is new,
    /// advancing the watermark for its origin in the same transaction.
    /// Returns whether the row was newly inserted.
    async fn insert_one(
        tx: &mut Transaction<'_, Sqlite>,
        event: &Event,
    ) -> Result<bool, sqlx::Error> {
        let payload_json = serde_json::to_string(&event.payload)
            .expect("JSON objects always serialize");

        let result = sqlx::query(
            "INSERT OR IGNORE INTO events (id, node_id, timestamp, creation_timestamp, payload_json)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(event.id.as_str())
        .bind(event.node_id.as_str())
        .bind(event.timestamp as i64)
        .bind(event.creation_timestamp as i64)
        .bind(payload_json)
        .execute(&mut **tx)
        .await?;

        let inserted = result.rows_affected() > 0;
        if inserted {
            Self::recompute_watermark(tx, &event.node_id).await?;
        }
        Ok(inserted)
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn initialize(&self) -> Result<(), EventStoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| EventStoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn save_event(&self, event: Event) -> Result<bool, EventStoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = Self::insert_one(&mut tx, &event).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn save_events(&self, events: Vec<Event>) -> Result<usize, EventStoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted_count = 0usize;
        for event in &events {
            if Self::insert_one(&mut tx, event).await? {
                inserted_count += 1;
            }
        }
        tx.commit().await?;
        Ok(inserted_count)
    }

    async fn get_events_since(
        &self,
        node_id: &NodeId,
        after_timestamp: u64,
        limit: Option<u32>,
    ) -> Result<Vec<Event>, EventStoreError> {
        let limit = limit.unwrap_or(u32::MAX);
        let rows = sqlx::query(
            "SELECT * FROM events WHERE node_id = ? AND timestamp > ? ORDER BY timestamp ASC LIMIT ?",
        )
        .bind(node_id.as_str())
        .bind(after_timestamp as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_event).collect()
    }

    async fn get_all_events(&self) -> Result<Vec<Event>, EventStoreError> {
        let rows = sqlx::query(
            "SELECT * FROM events ORDER BY creation_timestamp ASC, node_id ASC, timestamp ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_event).collect()
    }

    async fn get_events_in_range(
        &self,
        start: u64,
        end: u64,
        node_id: Option<&NodeId>,
        limit: Option<u32>,
    ) -> Result<Vec<Event>, EventStoreError> {
        let limit = limit.unwrap_or(u32::MAX);
        let rows = match node_id {
            Some(node_id) => {
                sqlx::query(
                    "SELECT * FROM events WHERE node_id = ? AND timestamp >= ? AND timestamp <= ?
                     ORDER BY timestamp ASC LIMIT ?",
                )
                .bind(node_id.as_str())
                .bind(start as i64)
                .bind(end as i64)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM events WHERE timestamp >= ? AND timestamp <= ?
                     ORDER BY node_id ASC, timestamp ASC LIMIT ?",
                )
                .bind(start as i64)
                .bind(end as i64)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(Self::row_to_event).collect()
    }

    async fn get_event(&self, id: &EventId) -> Result<Option<Event>, EventStoreError> {
        let row = sqlx::query("SELECT * FROM events WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_event).transpose()
    }

    async fn has_event(&self, id: &EventId) -> Result<bool, EventStoreError> {
        let row = sqlx::query("SELECT 1 FROM events WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn get_event_count(&self) -> Result<u64, EventStoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS c FROM events")
            .fetch_one(&self.pool)
            .await?;
        let c: i64 = row.get("c");
        Ok(c as u64)
    }

    async fn get_event_count_for_node(&self, node_id: &NodeId) -> Result<u64, EventStoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS c FROM events WHERE node_id = ?")
            .bind(node_id.as_str())
            .fetch_one(&self.pool)
            .await?;
        let c: i64 = row.get("c");
        Ok(c as u64)
    }

    async fn get_latest_timestamp_for_node(&self, node_id: &NodeId) -> Result<u64, EventStoreError> {
        let row = sqlx::query("SELECT watermark FROM watermarks WHERE node_id = ?")
            .bind(node_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("watermark") as u64).unwrap_or(0))
    }

    async fn get_latest_timestamps_for_all_nodes(&self) -> Result<VectorClock, EventStoreError> {
        let rows = sqlx::query("SELECT node_id, watermark FROM watermarks")
            .fetch_all(&self.pool)
            .await?;

        let mut clock = VectorClock::new();
        for row in rows {
            let node_id: String = row.get("node_id");
            let watermark: i64 = row.get("watermark");
            if watermark > 0 {
                clock.set(
                    NodeId::new(node_id).expect("node ids stored by this crate are always valid"),
                    watermark as u64,
                );
            }
        }
        Ok(clock)
    }

    async fn remove_events_older_than(&self, creation_timestamp: u64) -> Result<u64, EventStoreError> {
        let mut tx = self.pool.begin().await?;

        let affected_nodes: Vec<String> = sqlx::query(
            "SELECT DISTINCT node_id FROM events WHERE creation_timestamp < ?",
        )
        .bind(creation_timestamp as i64)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|r| r.get::<String, _>("node_id"))
        .collect();

        let result = sqlx::query("DELETE FROM events WHERE creation_timestamp < ?")
            .bind(creation_timestamp as i64)
            .execute(&mut *tx)
            .await?;

        for node_id in affected_nodes {
            let node_id = NodeId::new(node_id).expect("node ids stored by this crate are always valid");
            Self::recompute_watermark(&mut tx, &node_id).await?;
        }

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn remove_events_for_node(&self, node_id: &NodeId) -> Result<u64, EventStoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM events WHERE node_id = ?")
            .bind(node_id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM watermarks WHERE node_id = ?")
            .bind(node_id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn clear(&self) -> Result<(), EventStoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM events").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM watermarks").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), EventStoreError> {
        self.pool.close().await;
        Ok(())
    }
}
