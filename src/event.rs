//! The replicated event record.
//!
//! Payloads are opaque JSON objects — the engine is payload-agnostic, so
//! unlike the teacher's `ops.rs` (which defines one Rust struct per chat
//! op and dispatches on a `log_id`/`op_type` string), this crate keeps a
//! single `Event` shape and leaves payload interpretation entirely to the
//! embedding application's projections.

use std::cmp::Ordering;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::NodeId;

/// Opaque payload carried by an event. Always a JSON object so unknown
/// fields round-trip untouched through projections that don't understand
/// them (§1 non-goals: "no schema migration of historical payloads").
pub type Payload = Map<String, Value>;

/// Globally unique event identifier, conventionally `{nodeId}_{timestamp}_{nonce}`
/// but treated as opaque by every consumer except the generator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    fn new(node_id: &NodeId, timestamp: u64) -> Self {
        let nonce: u32 = rand::thread_rng().next_u32();
        Self(format!("{node_id}_{timestamp}_{nonce:08x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EventId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// An immutable, origin-stamped record in the replicated log.
///
/// `timestamp` is the origin's own strictly monotonic, gap-free logical
/// clock (§3); `creation_timestamp` is advisory wall-clock milliseconds
/// used only to break ties deterministically during projection rebuild
/// (§4.4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    pub node_id: NodeId,
    pub timestamp: u64,
    pub creation_timestamp: u64,
    pub payload: Payload,
}

impl Event {
    /// Build a new event originating at `node_id` with logical clock
    /// value `timestamp`. Callers are responsible for ensuring `timestamp`
    /// is exactly `local_watermark + 1` (§4.6 `createEvent`).
    pub fn new(node_id: NodeId, timestamp: u64, payload: Payload) -> Self {
        let id = EventId::new(&node_id, timestamp);
        let creation_timestamp = now_millis();
        Self {
            id,
            node_id,
            timestamp,
            creation_timestamp,
            payload,
        }
    }

    /// Total ordering key used by [`crate::projection::ProjectionEngine::process_events`]
    /// for deterministic rebuild: `(creationTimestamp asc, nodeId asc, timestamp asc)`.
    /// This is the only permitted source of cross-origin order (§4.4).
    pub fn sort_key(&self) -> (u64, &NodeId, u64) {
        (self.creation_timestamp, &self.node_id, self.timestamp)
    }
}

/// Comparator implementing the rebuild-determinism sort key, exposed as a
/// free function so callers can use `events.sort_by(event_order)` without
/// reaching into `Event` internals.
pub fn event_order(a: &Event, b: &Event) -> Ordering {
    a.sort_key().cmp(&b.sort_key())
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
