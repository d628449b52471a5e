//! Persistence of the local node's own vector clock (§4.2).

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::clock::VectorClock;
use crate::identity::NodeId;

#[derive(Debug, Error)]
pub enum ClockStoreError {
    #[error("storage failed: {0}")]
    StorageFailed(#[from] sqlx::Error),
    #[error("stored clock for {owner} is corrupt: {reason}")]
    Corrupt { owner: String, reason: String },
}

/// One persisted [`VectorClock`] per owning node (§4.2). Unlike
/// `EventStore::get_latest_timestamps_for_all_nodes`, which is always
/// derivable from the event log, this store exists so a node can recover
/// its own clock on restart without replaying the entire log — the same
/// shortcut the teacher's `db::get_cursor`/`set_cursor` pair takes for
/// projector progress.
#[async_trait]
pub trait VectorClockStore: Send + Sync {
    async fn initialize(&self) -> Result<(), ClockStoreError>;
    async fn save_clock(&self, owner: &NodeId, clock: &VectorClock) -> Result<(), ClockStoreError>;
    async fn load_clock(&self, owner: &NodeId) -> Result<Option<VectorClock>, ClockStoreError>;
    async fn has(&self, owner: &NodeId) -> Result<bool, ClockStoreError>;
    async fn clear(&self, owner: &NodeId) -> Result<(), ClockStoreError>;
    async fn close(&self) -> Result<(), ClockStoreError>;
}

pub struct SqliteVectorClockStore {
    pool: SqlitePool,
}

impl SqliteVectorClockStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorClockStore for SqliteVectorClockStore {
    async fn initialize(&self) -> Result<(), ClockStoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn save_clock(&self, owner: &NodeId, clock: &VectorClock) -> Result<(), ClockStoreError> {
        let map: std::collections::BTreeMap<NodeId, u64> =
            clock.iter().map(|(node, ts)| (node.clone(), *ts)).collect();
        let clock_json = serde_json::to_string(&map).expect("vector clocks always serialize");
        let saved_at = now_millis();

        sqlx::query(
            "INSERT INTO node_clocks (owner_node_id, clock_json, saved_at) VALUES (?, ?, ?)
             ON CONFLICT(owner_node_id) DO UPDATE SET clock_json = excluded.clock_json, saved_at = excluded.saved_at",
        )
        .bind(owner.as_str())
        .bind(clock_json)
        .bind(saved_at as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_clock(&self, owner: &NodeId) -> Result<Option<VectorClock>, ClockStoreError> {
        let row = sqlx::query("SELECT clock_json FROM node_clocks WHERE owner_node_id = ?")
            .bind(owner.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else { return Ok(None) };
        let clock_json: String = row.get("clock_json");

        let map: std::collections::BTreeMap<NodeId, u64> =
            serde_json::from_str(&clock_json).map_err(|e| ClockStoreError::Corrupt {
                owner: owner.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Some(VectorClock::from(map)))
    }

    async fn has(&self, owner: &NodeId) -> Result<bool, ClockStoreError> {
        let row = sqlx::query("SELECT 1 FROM node_clocks WHERE owner_node_id = ?")
            .bind(owner.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn clear(&self, owner: &NodeId) -> Result<(), ClockStoreError> {
        sqlx::query("DELETE FROM node_clocks WHERE owner_node_id = ?")
            .bind(owner.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ClockStoreError> {
        self.pool.close().await;
        Ok(())
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
