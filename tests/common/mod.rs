//! Shared scaffolding for the end-to-end scenario tests (§8).

use std::sync::Arc;
use std::time::Duration;

use meshlog::{EngineConfig, Event, NodeId, Payload, Projection, ProjectionError, Service};
use meshlog::{InProcessNetwork, InProcessTransport};
use serde_json::json;

/// A test-only projection that folds every applied event's payload into a
/// JSON array, in application order. Its `snapshot_state()` is therefore a
/// direct, easily-asserted witness of "which events has this projection
/// seen, and in what order".
pub struct PayloadLog {
    entries: Vec<serde_json::Value>,
}

impl PayloadLog {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }
}

impl Projection for PayloadLog {
    fn projection_type(&self) -> &str {
        "payload_log"
    }

    fn state_version(&self) -> &str {
        "v1"
    }

    fn apply(&mut self, event: &Event) -> Result<(), ProjectionError> {
        self.entries.push(json!({
            "node": event.node_id.as_str(),
            "ts": event.timestamp,
            "payload": event.payload,
        }));
        Ok(())
    }

    fn reset(&mut self) {
        self.entries.clear();
    }

    fn snapshot_state(&self) -> String {
        serde_json::to_string(&self.entries).expect("array of JSON values always serializes")
    }

    fn restore_state(&mut self, state: &str) -> bool {
        match serde_json::from_str(state) {
            Ok(entries) => {
                self.entries = entries;
                true
            }
            Err(_) => false,
        }
    }
}

/// Fast timers so integration tests converge in milliseconds rather than
/// the protocol's real-world defaults (§6.3).
pub fn fast_test_config() -> EngineConfig {
    EngineConfig {
        gossip_interval: Duration::from_millis(20),
        fanout: 8,
        gossip_timeout: Duration::from_secs(2),
        max_events_per_message: 50,
        enable_anti_entropy: false,
        anti_entropy_interval: Duration::from_secs(120),
        peer_discovery_interval: Duration::from_millis(10),
        max_concurrent_peers: 16,
        max_connection_attempts: 3,
        auto_save_event_count: 100,
    }
}

/// Build and fully start a [`Service`] joined to `network` as `node_id`,
/// backed by its own private in-memory SQLite store.
pub async fn spawn_node(
    network: &InProcessNetwork,
    node_id: NodeId,
    config: EngineConfig,
) -> Service {
    let transport: Arc<InProcessTransport> = Arc::new(network.join(node_id.clone()).await);
    let service = Service::new(transport, config);
    service.set_identity(node_id).await.unwrap();
    service
        .initialize("sqlite::memory:", vec![Box::new(PayloadLog::new())])
        .await
        .unwrap();
    service.start().await.unwrap();
    service
}

pub fn node(s: &str) -> NodeId {
    NodeId::new(s).unwrap()
}

pub fn payload(pairs: &[(&str, serde_json::Value)]) -> Payload {
    let mut map = Payload::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}
