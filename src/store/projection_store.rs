//! Durable snapshots of projection state, keyed by projection type (§4.3).

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProjectionStoreError {
    #[error("storage failed: {0}")]
    StorageFailed(#[from] sqlx::Error),
}

/// An opaque, projection-defined snapshot plus the bookkeeping the
/// [`crate::projection::ProjectionEngine`] needs to resume incremental
/// processing from it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionStateSnapshot {
    pub state_json: String,
    pub last_processed_event_id: String,
    pub event_count: u64,
    pub saved_at: u64,
    pub version: String,
}

/// Metadata about a stored snapshot without its (potentially large)
/// `state_json` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionMetadata {
    pub projection_type: String,
    pub last_processed_event_id: String,
    pub event_count: u64,
    pub saved_at: u64,
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProjectionStats {
    pub projection_count: u64,
    pub total_event_count: u64,
}

/// `save_state`/`load_state`/`clear_state`/`clear_all`/`has_state`/
/// `list_metadata`/`get_stats`/`close` (§4.3).
#[async_trait]
pub trait ProjectionStore: Send + Sync {
    async fn initialize(&self) -> Result<(), ProjectionStoreError>;

    async fn save_state(
        &self,
        projection_type: &str,
        state_json: &str,
        last_processed_event_id: &str,
        event_count: u64,
        version: &str,
    ) -> Result<(), ProjectionStoreError>;

    /// Returns `None` both when no snapshot exists and when the stored
    /// `version` does not equal `expected_version` — callers cannot tell
    /// these apart and must not need to: either way the right response is
    /// a full replay (§4.3, §4.4 Startup path).
    async fn load_state(
        &self,
        projection_type: &str,
        expected_version: &str,
    ) -> Result<Option<ProjectionStateSnapshot>, ProjectionStoreError>;

    async fn clear_state(&self, projection_type: &str) -> Result<(), ProjectionStoreError>;
    async fn clear_all(&self) -> Result<(), ProjectionStoreError>;
    async fn has_state(&self, projection_type: &str) -> Result<bool, ProjectionStoreError>;
    async fn list_metadata(&self) -> Result<Vec<ProjectionMetadata>, ProjectionStoreError>;
    async fn get_stats(&self) -> Result<ProjectionStats, ProjectionStoreError>;
    async fn close(&self) -> Result<(), ProjectionStoreError>;
}

pub struct SqliteProjectionStore {
    pool: SqlitePool,
}

impl SqliteProjectionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProjectionStore for SqliteProjectionStore {
    async fn initialize(&self) -> Result<(), ProjectionStoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn save_state(
        &self,
        projection_type: &str,
        state_json: &str,
        last_processed_event_id: &str,
        event_count: u64,
        version: &str,
    ) -> Result<(), ProjectionStoreError> {
        let saved_at = now_millis();
        sqlx::query(
            "INSERT INTO projection_snapshots
                 (projection_type, state_json, last_processed_event_id, event_count, saved_at, version)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(projection_type) DO UPDATE SET
                 state_json = excluded.state_json,
                 last_processed_event_id = excluded.last_processed_event_id,
                 event_count = excluded.event_count,
                 saved_at = excluded.saved_at,
                 version = excluded.version",
        )
        .bind(projection_type)
        .bind(state_json)
        .bind(last_processed_event_id)
        .bind(event_count as i64)
        .bind(saved_at as i64)
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_state(
        &self,
        projection_type: &str,
        expected_version: &str,
    ) -> Result<Option<ProjectionStateSnapshot>, ProjectionStoreError> {
        let row = sqlx::query(
            "SELECT state_json, last_processed_event_id, event_count, saved_at, version
             FROM projection_snapshots WHERE projection_type = ?",
        )
        .bind(projection_type)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let version: String = row.get("version");
        if version != expected_version {
            return Ok(None);
        }

        Ok(Some(ProjectionStateSnapshot {
            state_json: row.get("state_json"),
            last_processed_event_id: row.get("last_processed_event_id"),
            event_count: row.get::<i64, _>("event_count") as u64,
            saved_at: row.get::<i64, _>("saved_at") as u64,
            version,
        }))
    }

    async fn clear_state(&self, projection_type: &str) -> Result<(), ProjectionStoreError> {
        sqlx::query("DELETE FROM projection_snapshots WHERE projection_type = ?")
            .bind(projection_type)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), ProjectionStoreError> {
        sqlx::query("DELETE FROM projection_snapshots").execute(&self.pool).await?;
        Ok(())
    }

    async fn has_state(&self, projection_type: &str) -> Result<bool, ProjectionStoreError> {
        let row = sqlx::query("SELECT 1 FROM projection_snapshots WHERE projection_type = ?")
            .bind(projection_type)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn list_metadata(&self) -> Result<Vec<ProjectionMetadata>, ProjectionStoreError> {
        let rows = sqlx::query(
            "SELECT projection_type, last_processed_event_id, event_count, saved_at, version
             FROM projection_snapshots ORDER BY projection_type ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ProjectionMetadata {
                projection_type: row.get("projection_type"),
                last_processed_event_id: row.get("last_processed_event_id"),
                event_count: row.get::<i64, _>("event_count") as u64,
                saved_at: row.get::<i64, _>("saved_at") as u64,
                version: row.get("version"),
            })
            .collect())
    }

    async fn get_stats(&self) -> Result<ProjectionStats, ProjectionStoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS c, COALESCE(SUM(event_count), 0) AS total FROM projection_snapshots",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(ProjectionStats {
            projection_count: row.get::<i64, _>("c") as u64,
            total_event_count: row.get::<i64, _>("total") as u64,
        })
    }

    async fn close(&self) -> Result<(), ProjectionStoreError> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_pool;

    async fn store() -> SqliteProjectionStore {
        let pool = open_pool("sqlite::memory:").await.unwrap();
        SqliteProjectionStore::new(pool)
    }

    #[tokio::test]
    async fn round_trips_state() {
        let store = store().await;
        store
            .save_state("members", "{\"count\":3}", "a_1_deadbeef", 1, "v1")
            .await
            .unwrap();

        let loaded = store.load_state("members", "v1").await.unwrap().unwrap();
        assert_eq!(loaded.state_json, "{\"count\":3}");
        assert_eq!(loaded.event_count, 1);
    }

    #[tokio::test]
    async fn stale_version_is_treated_as_absent() {
        let store = store().await;
        store
            .save_state("members", "{\"count\":3}", "a_1_deadbeef", 1, "v1")
            .await
            .unwrap();

        assert!(store.load_state("members", "v2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_metadata_omits_state_json() {
        let store = store().await;
        store
            .save_state("members", "{\"count\":3}", "a_1_deadbeef", 1, "v1")
            .await
            .unwrap();

        let metadata = store.list_metadata().await.unwrap();
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata[0].projection_type, "members");
    }

    #[tokio::test]
    async fn get_stats_sums_across_projections() {
        let store = store().await;
        store.save_state("a", "{}", "x", 2, "v1").await.unwrap();
        store.save_state("b", "{}", "y", 5, "v1").await.unwrap();

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.projection_count, 2);
        assert_eq!(stats.total_event_count, 7);
    }

    #[tokio::test]
    async fn clear_state_removes_only_that_projection() {
        let store = store().await;
        store.save_state("a", "{}", "x", 1, "v1").await.unwrap();
        store.save_state("b", "{}", "y", 1, "v1").await.unwrap();

        store.clear_state("a").await.unwrap();

        assert!(!store.has_state("a").await.unwrap());
        assert!(store.has_state("b").await.unwrap());
    }
}
