//! The gossip replication engine (§4.6): per-node state machine, timers,
//! and the wire-level anti-entropy protocol built on top of the
//! [`crate::store`] and [`crate::transport`] modules.
//!
//! Grounded on the teacher's actor-ish split between `network.rs` (wiring)
//! and `sync.rs` (ingestion), but restructured around explicit
//! `tokio::sync` primitives rather than a process-wide `OnceLock` core
//! (§9 DESIGN NOTES).

mod peer_manager;
mod round;

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::clock::VectorClock;
use crate::config::EngineConfig;
use crate::event::{Event, Payload};
use crate::identity::NodeId;
use crate::projection::ProjectionEngine;
use crate::store::{ClockStoreError, EventStore, EventStoreError, VectorClockStore};
use crate::transport::{Inbound, PeerEvent, TransportAdapter, TransportError};
use crate::wire::{Frame, WireError};

pub use peer_manager::PeerManager;

#[derive(Debug, Error)]
pub enum GossipError {
    #[error("peer {0} went down mid-round")]
    PeerDown(NodeId),
    #[error("no reply from {0} within the gossip deadline")]
    Timeout(NodeId),
    #[error("gossip node is shutting down")]
    Shutdown,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Store(#[from] EventStoreError),
    #[error(transparent)]
    Clock(#[from] ClockStoreError),
}

/// Shared state behind every clone of a [`GossipNode`] handle.
pub(crate) struct Inner {
    node_id: NodeId,
    transport: Arc<dyn TransportAdapter>,
    event_store: Arc<dyn EventStore>,
    clock_store: Arc<dyn VectorClockStore>,
    projection_engine: Arc<ProjectionEngine>,
    config: EngineConfig,
    clock: Mutex<VectorClock>,
    peer_manager: PeerManager,
    on_event_created: broadcast::Sender<Event>,
    on_event_received: broadcast::Sender<Event>,
    on_peer_up: broadcast::Sender<NodeId>,
    on_peer_down: broadcast::Sender<NodeId>,
}

/// One replica's gossip state machine: **Stopped** → `start()` → **Running**
/// → `stop()` → **Stopped** (§4.6).
#[derive(Clone)]
pub struct GossipNode {
    inner: Arc<Inner>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GossipNode {
    pub fn new(
        node_id: NodeId,
        transport: Arc<dyn TransportAdapter>,
        event_store: Arc<dyn EventStore>,
        clock_store: Arc<dyn VectorClockStore>,
        projection_engine: Arc<ProjectionEngine>,
        config: EngineConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let peer_manager = PeerManager::new(config.max_concurrent_peers, config.max_connection_attempts);
        Self {
            inner: Arc::new(Inner {
                node_id,
                transport,
                event_store,
                clock_store,
                projection_engine,
                config,
                clock: Mutex::new(VectorClock::new()),
                peer_manager,
                on_event_created: broadcast::channel(256).0,
                on_event_received: broadcast::channel(256).0,
                on_peer_up: broadcast::channel(64).0,
                on_peer_down: broadcast::channel(64).0,
            }),
            tasks: Arc::new(Mutex::new(Vec::new())),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    pub fn subscribe_event_created(&self) -> broadcast::Receiver<Event> {
        self.inner.on_event_created.subscribe()
    }

    pub fn subscribe_event_received(&self) -> broadcast::Receiver<Event> {
        self.inner.on_event_received.subscribe()
    }

    pub fn subscribe_peer_up(&self) -> broadcast::Receiver<NodeId> {
        self.inner.on_peer_up.subscribe()
    }

    pub fn subscribe_peer_down(&self) -> broadcast::Receiver<NodeId> {
        self.inner.on_peer_down.subscribe()
    }

    /// **Stopped** → **Running** (§4.6): opens the clock, subscribes to the
    /// transport's streams, and schedules the three periodic timers.
    pub async fn start(&self) -> Result<(), GossipError> {
        self.inner.transport.start().await?;

        let loaded = self.inner.clock_store.load_clock(&self.inner.node_id).await?;
        *self.inner.clock.lock().await = loaded.unwrap_or_default();

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_peer_events_task());
        if let Some(incoming) = self.inner.transport.take_incoming() {
            tasks.push(self.spawn_inbound_task(incoming));
        }
        tasks.push(self.spawn_gossip_tick_task());
        if self.inner.config.enable_anti_entropy {
            tasks.push(self.spawn_anti_entropy_tick_task());
        }
        tasks.push(self.spawn_discovery_tick_task());

        info!("gossip node {} started", self.inner.node_id);
        Ok(())
    }

    /// **Running** → **Stopped** (§4.6, §5): cancels timers, fails every
    /// pending round with *Shutdown*, persists the clock, and closes the
    /// transport.
    pub async fn stop(&self) -> Result<(), GossipError> {
        let _ = self.shutdown_tx.send(true);

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        drop(tasks);

        self.inner.peer_manager.fail_all().await;

        let clock = self.inner.clock.lock().await;
        round::persist_clock(&self.inner, &clock).await;
        drop(clock);

        self.inner.transport.stop().await?;
        info!("gossip node {} stopped", self.inner.node_id);
        Ok(())
    }

    /// `createEvent` (§4.6): bump the local clock, persist, persist the
    /// clock, and notify local projections. Does NOT eagerly broadcast —
    /// the next gossip round carries it.
    pub async fn create_event(&self, payload: Payload) -> Result<Event, GossipError> {
        let mut clock = self.inner.clock.lock().await;
        let ts = clock.bump(&self.inner.node_id);
        let event = Event::new(self.inner.node_id.clone(), ts, payload);

        self.inner.event_store.save_event(event.clone()).await?;
        round::persist_clock(&self.inner, &clock).await;
        drop(clock);

        self.inner.projection_engine.process_event(&event).await;
        let _ = self.inner.on_event_created.send(event.clone());
        Ok(event)
    }

    fn spawn_peer_events_task(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let mut shutdown = self.shutdown_rx.clone();
        let mut events = self.inner.transport.subscribe_peer_events();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => {
                        match event {
                            Ok(PeerEvent::Up(peer)) => {
                                inner.peer_manager.mark_contacted(&peer).await;
                                let _ = inner.on_peer_up.send(peer);
                            }
                            Ok(PeerEvent::Down(peer)) => {
                                inner.peer_manager.fail_all_for_peer(&peer).await;
                                let _ = inner.on_peer_down.send(peer);
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        })
    }

    fn spawn_inbound_task(&self, mut incoming: tokio::sync::mpsc::Receiver<Inbound>) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    frame = incoming.recv() => {
                        let Some(frame) = frame else { break };
                        dispatch_inbound(inner.clone(), frame).await;
                    }
                }
            }
        })
    }

    fn spawn_gossip_tick_task(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let mut shutdown = self.shutdown_rx.clone();
        let interval = self.inner.config.gossip_interval;
        let fanout = self.inner.config.fanout;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(jittered(interval)) => {
                        let mut active = inner.peer_manager.active_peers().await;
                        active.shuffle(&mut rand::thread_rng());
                        for peer in active.into_iter().take(fanout) {
                            spawn_round(inner.clone(), peer);
                        }
                    }
                }
            }
        })
    }

    fn spawn_anti_entropy_tick_task(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let mut shutdown = self.shutdown_rx.clone();
        let interval = self.inner.config.anti_entropy_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(jittered(interval)) => {
                        if let Some(peer) = inner.peer_manager.stalest_peer().await {
                            spawn_round(inner.clone(), peer);
                        }
                    }
                }
            }
        })
    }

    fn spawn_discovery_tick_task(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let mut shutdown = self.shutdown_rx.clone();
        let interval = self.inner.config.peer_discovery_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(jittered(interval)) => {
                        reconcile_peers(&inner).await;
                    }
                }
            }
        })
    }
}

async fn reconcile_peers(inner: &Inner) {
    let transport_peers: std::collections::HashSet<NodeId> =
        inner.transport.peers().await.into_iter().collect();
    let known = inner.peer_manager.active_peers().await;

    for peer in &transport_peers {
        if !known.contains(peer) && inner.peer_manager.try_admit(peer).await {
            inner.peer_manager.mark_contacted(peer).await;
            let _ = inner.on_peer_up.send(peer.clone());
        }
    }
    for peer in known {
        if !transport_peers.contains(&peer) {
            inner.peer_manager.fail_all_for_peer(&peer).await;
            let _ = inner.on_peer_down.send(peer);
        }
    }
}

fn spawn_round(inner: Arc<Inner>, peer: NodeId) {
    tokio::spawn(async move {
        if let Err(err) = round::run_initiator_round(&inner, peer.clone()).await {
            let transport_fault = matches!(err, GossipError::Transport(TransportError::Unreachable(_)));
            warn!("gossip round with {peer} failed: {err}");
            if inner.peer_manager.record_failure(&peer, transport_fault).await.is_none() {
                inner.peer_manager.remove(&peer).await;
                let _ = inner.on_peer_down.send(peer);
            }
        }
    });
}

async fn dispatch_inbound(inner: Arc<Inner>, inbound: Inbound) {
    let frame = match Frame::decode(&inbound.bytes) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("dropping malformed frame from {}: {err}", inbound.from);
            return;
        }
    };

    match frame {
        Frame::Digest { rid, .. } => {
            round::handle_digest(&inner, inbound.from, rid).await;
        }
        Frame::Events { rid, message } => {
            round::handle_events(&inner, inbound.from, rid, message).await;
        }
        reply @ (Frame::DigestResponse { .. } | Frame::EventsAck { .. }) => {
            if !inner.peer_manager.complete(reply).await {
                warn!("no pending request matched a reply from {}", inbound.from);
            }
        }
    }
}

fn jittered(base: Duration) -> Duration {
    let jitter_frac: f64 = rand::thread_rng().gen_range(-0.2..=0.2);
    let nanos = base.as_nanos() as f64 * (1.0 + jitter_frac);
    Duration::from_nanos(nanos.max(0.0) as u64)
}
