//! One gossip round, both sides (§4.6 "Gossip round").

use log::{debug, trace, warn};

use crate::clock::VectorClock;
use crate::event::Event;
use crate::gossip::peer_manager::wait_for_reply;
use crate::gossip::{GossipError, Inner};
use crate::identity::NodeId;
use crate::wire::{Frame, GossipEventMessage, Rid};

/// Initiator side: run one full round with `peer` (§4.6 steps 1-5).
pub(super) async fn run_initiator_round(inner: &Inner, peer: NodeId) -> Result<(), GossipError> {
    let rid = Rid::generate(&inner.node_id);
    trace!("gossip round {rid} with {peer}: sending digest");

    let w_self = inner.event_store.get_latest_timestamps_for_all_nodes().await?;
    let digest = Frame::Digest {
        rid: rid.clone(),
        clock: w_self.iter().map(|(n, t)| (n.clone(), *t)).collect(),
    };

    let response_rx = inner.peer_manager.await_reply(rid.clone(), peer.clone()).await;
    send_frame(inner, &peer, &digest).await?;
    let response = wait_for_reply(response_rx, &peer, inner.config.gossip_timeout).await?;

    let Frame::DigestResponse { clock: w_peer, .. } = response else {
        return Err(GossipError::ProtocolViolation(format!(
            "expected digest_response for {rid}, got a different frame type"
        )));
    };

    let mut to_send = Vec::new();
    let mut budget = inner.config.max_events_per_message;
    for (node_id, _) in w_self.iter() {
        if budget == 0 {
            break;
        }
        let their_ts = w_peer.get(node_id).copied().unwrap_or(0);
        let events = inner
            .event_store
            .get_events_since(node_id, their_ts, Some(budget as u32))
            .await?;
        budget = budget.saturating_sub(events.len());
        to_send.extend(events);
    }

    debug!("gossip round {rid} with {peer}: sending {} event(s)", to_send.len());
    let events_frame = Frame::Events {
        rid: rid.clone(),
        message: GossipEventMessage {
            events: to_send,
            from_clock: w_self.into_map(),
        },
    };

    let ack_rx = inner.peer_manager.await_reply(rid.clone(), peer.clone()).await;
    send_frame(inner, &peer, &events_frame).await?;
    let ack = wait_for_reply(ack_rx, &peer, inner.config.gossip_timeout).await?;

    if !matches!(ack, Frame::EventsAck { .. }) {
        return Err(GossipError::ProtocolViolation(format!(
            "expected events_ack for {rid}, got a different frame type"
        )));
    }

    inner.peer_manager.mark_contacted(&peer).await;
    inner.peer_manager.clear_attempts(&peer).await;
    Ok(())
}

/// Responder side, `Digest` branch (§4.6 step 1): reply with our own
/// watermark map. `needed_ids` is reserved by the protocol but this
/// implementation never populates it.
pub(super) async fn handle_digest(inner: &Inner, from: NodeId, rid: Rid) {
    let w_self = match inner.event_store.get_latest_timestamps_for_all_nodes().await {
        Ok(clock) => clock,
        Err(err) => {
            warn!("failed to read local watermarks answering digest from {from}: {err}");
            return;
        }
    };

    let response = Frame::DigestResponse {
        rid,
        clock: w_self.iter().map(|(n, t)| (n.clone(), *t)).collect(),
        needed_ids: None,
    };

    if let Err(err) = send_frame(inner, &from, &response).await {
        warn!("failed to send digest_response to {from}: {err}");
    }
}

/// Responder side, `Events` branch (§4.6 steps 2-3).
///
/// Every event is saved regardless of arrival order — `EventStore` is
/// happy to hold a non-contiguous set and always knows the contiguous
/// prefix actually present (§4.1). But local projections must still see
/// each origin's events in strictly increasing timestamp order (§5), and a
/// gap must not surface the events above it early. So delivery to
/// projections is gated on the store's own contiguous watermark: after
/// saving this batch, for every origin it touched we compare the new
/// watermark against what we'd already delivered and fan out exactly the
/// newly-closed contiguous run, in order. An event landing beyond a gap is
/// durably stored but silently withheld from projections until the gap
/// closes — on a later round, the same event (now contiguous) is part of
/// the newly-closed run and gets delivered then. This replaces the source
/// design's in-memory per-node buffer-and-flush with the same observable
/// effect, using the store itself as the buffer (§4.1 implementation
/// note).
pub(super) async fn handle_events(inner: &Inner, from: NodeId, rid: Rid, message: GossipEventMessage) {
    let mut events = message.events;
    // Group by origin and sort each group by timestamp ascending (§4.6
    // responder step 2).
    events.sort_by(|a, b| (&a.node_id, a.timestamp).cmp(&(&b.node_id, b.timestamp)));

    let mut touched: Vec<NodeId> = Vec::new();
    for event in events {
        let origin = event.node_id.clone();
        match inner.event_store.save_event(event).await {
            Ok(true) => {
                if !touched.contains(&origin) {
                    touched.push(origin);
                }
            }
            Ok(false) => {}
            Err(err) => warn!("failed to persist an event from {from}: {err}"),
        }
    }

    let mut advanced: Vec<(NodeId, u64)> = Vec::new();
    for origin in touched {
        let previously_delivered = inner.clock.lock().await.get(&origin);
        let new_watermark = match inner.event_store.get_latest_timestamp_for_node(&origin).await {
            Ok(w) => w,
            Err(err) => {
                warn!("failed to read watermark for {origin} after insert: {err}");
                continue;
            }
        };
        if new_watermark <= previously_delivered {
            continue; // still gapped; nothing new is deliverable yet
        }

        let span = (new_watermark - previously_delivered) as u32;
        match inner.event_store.get_events_since(&origin, previously_delivered, Some(span)).await {
            Ok(newly_contiguous) => {
                for event in &newly_contiguous {
                    inner.projection_engine.process_event(event).await;
                    let _ = inner.on_event_received.send(event.clone());
                }
                advanced.push((origin, new_watermark));
            }
            Err(err) => warn!("failed to read newly-contiguous run for {origin}: {err}"),
        }
    }

    if !advanced.is_empty() {
        let mut clock = inner.clock.lock().await;
        for (node_id, watermark) in advanced {
            clock.advance_to(node_id, watermark);
        }
        persist_clock(inner, &clock).await;
    }

    let ack = Frame::EventsAck {
        rid,
        timestamp: now_millis(),
    };
    if let Err(err) = send_frame(inner, &from, &ack).await {
        warn!("failed to send events_ack to {from}: {err}");
    }
}

pub(super) async fn persist_clock(inner: &Inner, clock: &VectorClock) {
    if let Err(err) = inner.clock_store.save_clock(&inner.node_id, clock).await {
        warn!("failed to persist local vector clock: {err}");
    }
}

async fn send_frame(inner: &Inner, peer: &NodeId, frame: &Frame) -> Result<(), GossipError> {
    let bytes = frame.encode()?;
    inner.transport.send(peer, bytes, inner.config.gossip_timeout).await?;
    Ok(())
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
