//! PeerManager sub-policies (§4.6): admission, attempt backoff, and
//! correlation-id bookkeeping for in-flight gossip rounds.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{oneshot, Mutex};

use crate::gossip::GossipError;
use crate::identity::NodeId;
use crate::wire::{Frame, Rid};

struct PeerState {
    last_contact: Instant,
    attempts: u32,
}

struct PendingRequest {
    peer: NodeId,
    reply: oneshot::Sender<Frame>,
}

pub struct PeerManager {
    max_concurrent_peers: usize,
    max_connection_attempts: u32,
    active: Mutex<HashMap<NodeId, PeerState>>,
    pending_dials: Mutex<std::collections::HashSet<NodeId>>,
    correlation: Mutex<HashMap<Rid, PendingRequest>>,
}

impl PeerManager {
    pub fn new(max_concurrent_peers: usize, max_connection_attempts: u32) -> Self {
        Self {
            max_concurrent_peers,
            max_connection_attempts,
            active: Mutex::new(HashMap::new()),
            pending_dials: Mutex::new(std::collections::HashSet::new()),
            correlation: Mutex::new(HashMap::new()),
        }
    }

    /// Admission control for a new inbound or outbound peer (§4.6:
    /// "reject new inbound when active_peers + pending >= maxConcurrentPeers").
    pub async fn try_admit(&self, peer: &NodeId) -> bool {
        let active = self.active.lock().await;
        let pending = self.pending_dials.lock().await;
        if active.contains_key(peer) || pending.contains(peer) {
            return true;
        }
        active.len() + pending.len() < self.max_concurrent_peers
    }

    pub async fn mark_dialing(&self, peer: &NodeId) {
        self.pending_dials.lock().await.insert(peer.clone());
    }

    pub async fn mark_contacted(&self, peer: &NodeId) {
        self.pending_dials.lock().await.remove(peer);
        self.active.lock().await.insert(
            peer.clone(),
            PeerState {
                last_contact: Instant::now(),
                attempts: 0,
            },
        );
    }

    /// Peer whose `last_contact` is oldest among currently active peers —
    /// the anti-entropy sweep target.
    pub async fn stalest_peer(&self) -> Option<NodeId> {
        let active = self.active.lock().await;
        active
            .iter()
            .min_by_key(|(_, state)| state.last_contact)
            .map(|(id, _)| id.clone())
    }

    pub async fn active_peers(&self) -> Vec<NodeId> {
        self.active.lock().await.keys().cloned().collect()
    }

    /// Record a failed round attempt against `peer` and return the
    /// backoff to wait before retrying, or `None` if the attempt budget
    /// is exhausted (§4.6: capped at `maxConnectionAttempts`, exponential
    /// `2s * 2^attempt` jittered, forced longer on transport-level faults).
    pub async fn record_failure(&self, peer: &NodeId, transport_fault: bool) -> Option<Duration> {
        self.pending_dials.lock().await.remove(peer);
        let mut active = self.active.lock().await;
        let state = active.entry(peer.clone()).or_insert(PeerState {
            last_contact: Instant::now(),
            attempts: 0,
        });
        state.attempts += 1;
        if state.attempts > self.max_connection_attempts {
            return None;
        }

        let base = if transport_fault {
            Duration::from_secs(3) * state.attempts
        } else {
            Duration::from_secs(2) * 2u32.pow(state.attempts.saturating_sub(1))
        };
        Some(jittered(base))
    }

    pub async fn clear_attempts(&self, peer: &NodeId) {
        if let Some(state) = self.active.lock().await.get_mut(peer) {
            state.attempts = 0;
        }
    }

    pub async fn remove(&self, peer: &NodeId) {
        self.active.lock().await.remove(peer);
        self.pending_dials.lock().await.remove(peer);
    }

    /// Register a one-shot slot awaiting the next frame tagged `rid` from
    /// `peer`. Returns the receiving half.
    pub async fn await_reply(&self, rid: Rid, peer: NodeId) -> oneshot::Receiver<Frame> {
        let (tx, rx) = oneshot::channel();
        self.correlation.lock().await.insert(rid, PendingRequest { peer, reply: tx });
        rx
    }

    /// Deliver `frame` to whoever is waiting on its `rid`, if anyone.
    /// Returns `true` if a waiter was found.
    pub async fn complete(&self, frame: Frame) -> bool {
        let pending = self.correlation.lock().await.remove(frame.rid());
        match pending {
            Some(pending) => pending.reply.send(frame).is_ok(),
            None => false,
        }
    }

    /// Fail every pending request addressed to `peer` with *PeerDown*
    /// (§4.6: "Per-peer cancellation on {down, peerId}").
    pub async fn fail_all_for_peer(&self, peer: &NodeId) {
        let mut correlation = self.correlation.lock().await;
        let dead: Vec<Rid> = correlation
            .iter()
            .filter(|(_, req)| &req.peer == peer)
            .map(|(rid, _)| rid.clone())
            .collect();
        for rid in dead {
            correlation.remove(&rid);
        }
        drop(correlation);
        self.remove(peer).await;
    }

    /// Drop every pending request, as part of `stop()` (§5: "drains
    /// in-flight protocol requests with *Shutdown*").
    pub async fn fail_all(&self) {
        self.correlation.lock().await.clear();
    }
}

fn jittered(base: Duration) -> Duration {
    let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
    let nanos = base.as_nanos() as f64 * (1.0 + jitter_frac);
    Duration::from_nanos(nanos.max(0.0) as u64)
}

/// Await a registered reply with a deadline, translating expiry/drop into
/// the appropriate [`GossipError`].
pub async fn wait_for_reply(
    rx: oneshot::Receiver<Frame>,
    peer: &NodeId,
    deadline: Duration,
) -> Result<Frame, GossipError> {
    match tokio::time::timeout(deadline, rx).await {
        Ok(Ok(frame)) => Ok(frame),
        Ok(Err(_)) => Err(GossipError::PeerDown(peer.clone())),
        Err(_) => Err(GossipError::Timeout(peer.clone())),
    }
}
