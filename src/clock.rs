//! The in-memory vector clock: a map from origin node id to the highest
//! *contiguous* timestamp known locally for that origin (§3 "VectorClock").
//!
//! This is the same cursor-bookkeeping idea as the teacher's
//! `projector_cursors` table (`db::get_cursor`/`set_cursor`, one row per
//! `(log_id, author)`), generalized from "how far the read-model projector
//! has consumed a given author's log" to "how far the event log itself is
//! known to be gap-free for a given origin".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

/// `nodeId → highest consecutive timestamp observed from that node`.
///
/// Uses a `BTreeMap` so iteration (e.g. when building a `Digest` frame) is
/// in a stable, deterministic order, which keeps wire traffic and test
/// fixtures reproducible.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorClock(BTreeMap<NodeId, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// The watermark for `node`, or 0 if nothing has been observed yet.
    pub fn get(&self, node: &NodeId) -> u64 {
        self.0.get(node).copied().unwrap_or(0)
    }

    /// Unconditionally set the watermark for `node`.
    ///
    /// Callers must never pass a value lower than the current one — that
    /// would be a watermark regression, which is a bug in this crate, not
    /// a recoverable condition (§9 DESIGN NOTES). Use
    /// [`VectorClock::advance_to`] when the caller cannot already prove
    /// monotonicity.
    pub fn set(&mut self, node: NodeId, timestamp: u64) {
        if let Some(existing) = self.0.get(&node) {
            assert!(
                timestamp >= *existing,
                "watermark regression for {node}: {existing} -> {timestamp}"
            );
        }
        self.0.insert(node, timestamp);
    }

    /// Advance the watermark for `node` to `timestamp` if and only if that
    /// is strictly greater than the current value. No-op (and not an
    /// error) if `timestamp` is not newer — this is the normal shape of a
    /// duplicate or already-applied event (§4.6 tie-breaks).
    pub fn advance_to(&mut self, node: NodeId, timestamp: u64) {
        let entry = self.0.entry(node).or_insert(0);
        if timestamp > *entry {
            *entry = timestamp;
        }
    }

    /// Increment and return the new watermark for `node` — used only for
    /// the local node's own entry when creating an event (§4.6 step 1).
    pub fn bump(&mut self, node: &NodeId) -> u64 {
        let entry = self.0.entry(node.clone()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &u64)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_map(self) -> BTreeMap<NodeId, u64> {
        self.0
    }
}

impl From<BTreeMap<NodeId, u64>> for VectorClock {
    fn from(map: BTreeMap<NodeId, u64>) -> Self {
        Self(map)
    }
}

impl FromIterator<(NodeId, u64)> for VectorClock {
    fn from_iter<T: IntoIterator<Item = (NodeId, u64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
