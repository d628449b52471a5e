//! Durable storage (§4.1-§4.3, §6.2).
//!
//! Three independent stores, each a thin trait plus a `sqlx`/SQLite
//! reference implementation, the way the teacher's `db.rs` and `store.rs`
//! split "how to open a pool and run migrations" from "what rows live in
//! it": `EventStore` owns the append log and the watermark index,
//! `VectorClockStore` owns the local node's persisted clock, and
//! `ProjectionStore` owns projection snapshots.

mod clock_store;
mod event_store;
mod projection_store;

pub use clock_store::{ClockStoreError, SqliteVectorClockStore, VectorClockStore};
pub use event_store::{EventStore, EventStoreError, SqliteEventStore};
pub use projection_store::{
    ProjectionMetadata, ProjectionStateSnapshot, ProjectionStats, ProjectionStore,
    ProjectionStoreError, SqliteProjectionStore,
};

use sqlx::SqlitePool;

/// Open (creating if necessary) a SQLite pool at `url` and run the schema
/// migrations shared by all three stores.
///
/// Mirrors the teacher's `store::init_op_store`/`init_read_pool` split,
/// collapsed into one helper since all three of our stores are willing to
/// share a single pool and a single SQLite file — there is no equivalent
/// here of keeping the p2panda operation log and the read model in
/// separate files.
pub async fn open_pool(url: &str) -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePool::connect(url).await?;
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA foreign_keys=ON;").execute(&pool).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id                  TEXT PRIMARY KEY,
            node_id             TEXT NOT NULL,
            timestamp           INTEGER NOT NULL,
            creation_timestamp  INTEGER NOT NULL,
            payload_json        TEXT NOT NULL,
            UNIQUE (node_id, timestamp)
        );

        CREATE INDEX IF NOT EXISTS idx_events_node_timestamp ON events (node_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_events_creation ON events (creation_timestamp, node_id, timestamp);

        CREATE TABLE IF NOT EXISTS watermarks (
            node_id     TEXT PRIMARY KEY,
            watermark   INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS node_clocks (
            owner_node_id   TEXT PRIMARY KEY,
            clock_json      TEXT NOT NULL,
            saved_at        INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS projection_snapshots (
            projection_type         TEXT PRIMARY KEY,
            state_json              TEXT NOT NULL,
            last_processed_event_id TEXT NOT NULL,
            event_count             INTEGER NOT NULL,
            saved_at                INTEGER NOT NULL,
            version                 TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}
