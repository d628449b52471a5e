//! End-to-end scenarios from SPEC_FULL.md §8, against the real SQLite
//! store stack and the in-memory reference transport.

mod common;

use std::time::Duration;

use common::{fast_test_config, node, payload, spawn_node};
use meshlog::store::{open_pool, ProjectionStore, SqliteProjectionStore};
use meshlog::InProcessNetwork;
use serde_json::json;
use tokio::time::sleep;

/// S1 — Two-peer baseline: one event each side, one mutual round, both
/// converge on both events.
#[tokio::test]
async fn s1_two_peer_baseline() {
    let network = InProcessNetwork::new();
    let config = fast_test_config();

    let a = spawn_node(&network, node("a"), config.clone()).await;
    let b = spawn_node(&network, node("b"), config.clone()).await;

    let mut a_received = a.on_event_received().await.unwrap();
    let mut b_received = b.on_event_received().await.unwrap();

    let e1 = a.create_event(payload(&[("t", json!("x")), ("v", json!(1))])).await.unwrap();
    let e2 = b.create_event(payload(&[("t", json!("x")), ("v", json!(2))])).await.unwrap();

    let got_on_b = tokio::time::timeout(Duration::from_secs(2), b_received.recv())
        .await
        .expect("b should receive a's event")
        .unwrap();
    let got_on_a = tokio::time::timeout(Duration::from_secs(2), a_received.recv())
        .await
        .expect("a should receive b's event")
        .unwrap();

    assert_eq!(got_on_b.id, e1.id);
    assert_eq!(got_on_a.id, e2.id);
    assert_eq!(e1.timestamp, 1);
    assert_eq!(e2.timestamp, 1);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

/// S3 — Dedup: the same events survive a second, redundant gossip round
/// with no observable duplicate delivery.
#[tokio::test]
async fn s3_dedup_across_repeated_rounds() {
    let network = InProcessNetwork::new();
    let config = fast_test_config();

    let a = spawn_node(&network, node("a"), config.clone()).await;
    let b = spawn_node(&network, node("b"), config.clone()).await;

    let mut b_received = b.on_event_received().await.unwrap();
    a.create_event(payload(&[("v", json!(1))])).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), b_received.recv())
        .await
        .unwrap()
        .unwrap();

    // Let several more rounds elapse with no new events; a second
    // delivery of the same event must never surface.
    sleep(Duration::from_millis(200)).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(100), b_received.recv())
            .await
            .is_err(),
        "the same event must not be redelivered as a new onEventReceived notification"
    );
    assert_eq!(first.timestamp, 1);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

/// S4 — Partition and heal: three nodes create events in isolation, then
/// gossip resumes and they all converge on the full 10-event set.
#[tokio::test]
async fn s4_partition_and_heal() {
    let network = InProcessNetwork::new();
    let config = fast_test_config();

    // Start only A in its own partition first. Subscribe before creating
    // any events so no onEventReceived notification is missed (broadcast
    // channels drop sends that precede a subscriber).
    let a = spawn_node(&network, node("a"), config.clone()).await;
    let mut a_received = a.on_event_received().await.unwrap();
    for i in 1..=5u64 {
        a.create_event(payload(&[("v", json!(i))])).await.unwrap();
    }

    // B and C join as a second partition and create their own events
    // before ever meeting A (simulated by creating everything before any
    // cross-partition round has had a chance to run, since the in-memory
    // transport only starts delivering once both sides have joined).
    let b = spawn_node(&network, node("b"), config.clone()).await;
    let mut b_received = b.on_event_received().await.unwrap();
    let c = spawn_node(&network, node("c"), config.clone()).await;
    let mut c_received = c.on_event_received().await.unwrap();
    for i in 1..=3u64 {
        b.create_event(payload(&[("v", json!(i))])).await.unwrap();
    }
    for i in 1..=2u64 {
        c.create_event(payload(&[("v", json!(i))])).await.unwrap();
    }

    let mut seen_by_a = 0;
    let mut seen_by_b = 0;
    let mut seen_by_c = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline && (seen_by_a < 5 || seen_by_b < 7 || seen_by_c < 8) {
        tokio::select! {
            Ok(_) = a_received.recv() => seen_by_a += 1,
            Ok(_) = b_received.recv() => seen_by_b += 1,
            Ok(_) = c_received.recv() => seen_by_c += 1,
            _ = sleep(Duration::from_millis(20)) => {}
        }
    }

    // A only ever hears B's 3 and C's 2 (its own 5 are never "received",
    // only "created"); B and C each hear everyone else's events.
    assert_eq!(seen_by_a, 5, "a should receive b's 3 and c's 2 events");
    assert_eq!(seen_by_b, 7, "b should receive a's 5 and c's 2 events");
    assert_eq!(seen_by_c, 8, "c should receive a's 5 and b's 3 events");

    a.stop().await.unwrap();
    b.stop().await.unwrap();
    c.stop().await.unwrap();
}

/// S5 — Snapshot & resume: a projection's auto-saved snapshot survives a
/// restart and the engine resumes from it rather than replaying from
/// scratch.
#[tokio::test]
async fn s5_snapshot_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("node.sqlite3");
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());

    let network = InProcessNetwork::new();
    let mut config = fast_test_config();
    config.auto_save_event_count = 10;

    {
        let transport = std::sync::Arc::new(network.join(node("solo")).await);
        let service = meshlog::Service::new(transport, config.clone());
        service.set_identity(node("solo")).await.unwrap();
        service
            .initialize(&db_url, vec![Box::new(common::PayloadLog::new())])
            .await
            .unwrap();
        service.start().await.unwrap();

        for i in 0..25u64 {
            service.create_event(payload(&[("v", json!(i))])).await.unwrap();
        }
        service.save_projection_states().await.unwrap();
        service.stop().await.unwrap();
    }

    let pool = open_pool(&db_url).await.unwrap();
    let projection_store = SqliteProjectionStore::new(pool);
    let before = projection_store.load_state("payload_log", "v1").await.unwrap().unwrap();

    // Fresh process-like restart: new Service, same db file, empty
    // in-memory projection state.
    let transport = std::sync::Arc::new(network.join(node("solo-2")).await);
    let service = meshlog::Service::new(transport, config);
    service.set_identity(node("solo-2")).await.unwrap();
    service
        .initialize(&db_url, vec![Box::new(common::PayloadLog::new())])
        .await
        .unwrap();

    let after = projection_store.load_state("payload_log", "v1").await.unwrap().unwrap();
    assert_eq!(before.state_json, after.state_json);
    assert_eq!(after.event_count, 25);
}

/// S6 — Peer churn, at reduced/deterministic scale (§8 implementation
/// note): a handful of peers, some leaving and not returning mid-run,
/// still converge among the peers that stay up.
#[tokio::test]
async fn s6_peer_churn_reduced_scale() {
    let network = InProcessNetwork::new();
    let config = fast_test_config();

    let mut services = Vec::new();
    for name in ["a", "b", "c", "d"] {
        services.push(spawn_node(&network, node(name), config.clone()).await);
    }

    // Subscribe before creating any events so no onEventReceived
    // notification is missed (broadcast channels drop sends that precede
    // a subscriber, the same rule as the transport's peer-event stream).
    let mut receivers = Vec::new();
    for service in &services[..3] {
        receivers.push(service.on_event_received().await.unwrap());
    }

    for (idx, service) in services.iter().enumerate() {
        for v in 0..5u64 {
            service
                .create_event(payload(&[("origin", json!(idx)), ("v", json!(v))]))
                .await
                .unwrap();
        }
    }

    // Churn: node "d" drops out partway through and never returns.
    sleep(Duration::from_millis(100)).await;
    services[3].stop().await.unwrap();

    // Each of the three surviving nodes should see the 15 events created
    // by the other two surviving nodes (d's events may or may not have
    // landed depending on timing before it dropped, so we only assert a
    // lower bound on convergence among survivors).
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let mut counts = vec![0usize; receivers.len()];
    while tokio::time::Instant::now() < deadline && counts.iter().any(|&c| c < 10) {
        for (idx, rx) in receivers.iter_mut().enumerate() {
            if let Ok(Ok(_)) = tokio::time::timeout(Duration::from_millis(20), rx.recv()).await {
                counts[idx] += 1;
            }
        }
    }

    for count in counts {
        assert!(count >= 10, "surviving peers should converge on each other's events");
    }

    for service in &services[..3] {
        service.stop().await.unwrap();
    }
}
