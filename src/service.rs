//! The Service façade (§4.7): the only thing an embedding application
//! talks to. Holds no domain logic of its own — it wires together the
//! stores, the projection engine, and the gossip node, and forwards calls.

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event::{Event, Payload};
use crate::gossip::GossipNode;
use crate::identity::NodeId;
use crate::projection::{AutoSavePolicy, Projection, ProjectionEngine};
use crate::store::{
    open_pool, EventStore, ProjectionStore, SqliteEventStore, SqliteProjectionStore,
    SqliteVectorClockStore, VectorClockStore,
};
use crate::transport::TransportAdapter;

struct Resources {
    event_store: Arc<dyn EventStore>,
    clock_store: Arc<dyn VectorClockStore>,
    projection_engine: Arc<ProjectionEngine>,
    gossip: Option<GossipNode>,
}

/// Exposes only `set_identity`, `initialize`, `start`, `stop`,
/// `create_event`, the four event/peer streams, `save_projection_states`,
/// and `clear_projection_states` (§4.7).
pub struct Service {
    transport: Arc<dyn TransportAdapter>,
    config: EngineConfig,
    node_id: Mutex<Option<NodeId>>,
    resources: Mutex<Option<Resources>>,
}

impl Service {
    pub fn new(transport: Arc<dyn TransportAdapter>, config: EngineConfig) -> Self {
        Self {
            transport,
            config,
            node_id: Mutex::new(None),
            resources: Mutex::new(None),
        }
    }

    /// Must be called exactly once, before [`Service::initialize`].
    pub async fn set_identity(&self, node_id: NodeId) -> Result<(), EngineError> {
        let mut slot = self.node_id.lock().await;
        if slot.is_some() {
            return Err(EngineError::InvalidState("identity is already set".into()));
        }
        *slot = Some(node_id);
        Ok(())
    }

    /// Opens the stores at `db_url`, registers `projections`, and either
    /// restores or rebuilds their state from the persisted event log
    /// (§4 control flow). Must be called before [`Service::start`].
    pub async fn initialize(
        &self,
        db_url: &str,
        projections: Vec<Box<dyn Projection>>,
    ) -> Result<(), EngineError> {
        self.config.validate()?;

        if self.node_id.lock().await.is_none() {
            return Err(EngineError::InvalidState(
                "set_identity must be called before initialize".into(),
            ));
        }

        let mut resources = self.resources.lock().await;
        if resources.is_some() {
            return Err(EngineError::InvalidState("already initialized".into()));
        }

        let pool = open_pool(db_url)
            .await
            .map_err(|e| EngineError::InvalidState(format!("failed to open storage: {e}")))?;

        let event_store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::new(pool.clone()));
        let clock_store: Arc<dyn VectorClockStore> = Arc::new(SqliteVectorClockStore::new(pool.clone()));
        let projection_store: Arc<dyn ProjectionStore> = Arc::new(SqliteProjectionStore::new(pool));

        let projection_engine = Arc::new(ProjectionEngine::new(
            projection_store,
            AutoSavePolicy {
                every_n_events: self.config.auto_save_event_count,
            },
        ));
        for projection in projections {
            projection_engine.register(projection).await;
        }

        let all_events = event_store.get_all_events().await?;
        projection_engine.load_or_rebuild(&all_events).await?;

        *resources = Some(Resources {
            event_store,
            clock_store,
            projection_engine,
            gossip: None,
        });
        Ok(())
    }

    /// **Stopped** → **Running** (§4.6): builds and starts the
    /// [`GossipNode`]. Requires [`Service::initialize`] to have run.
    pub async fn start(&self) -> Result<(), EngineError> {
        let node_id = self
            .node_id
            .lock()
            .await
            .clone()
            .ok_or_else(|| EngineError::InvalidState("identity is not set".into()))?;

        let mut resources = self.resources.lock().await;
        let resources = resources
            .as_mut()
            .ok_or_else(|| EngineError::InvalidState("not initialized".into()))?;

        if resources.gossip.is_some() {
            return Err(EngineError::InvalidState("already started".into()));
        }

        let gossip = GossipNode::new(
            node_id,
            self.transport.clone(),
            resources.event_store.clone(),
            resources.clock_store.clone(),
            resources.projection_engine.clone(),
            self.config.clone(),
        );
        gossip.start().await?;
        resources.gossip = Some(gossip);
        Ok(())
    }

    /// **Running** → **Stopped** (§4.6).
    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut resources = self.resources.lock().await;
        let resources = resources
            .as_mut()
            .ok_or_else(|| EngineError::InvalidState("not initialized".into()))?;

        let Some(gossip) = resources.gossip.take() else {
            return Err(EngineError::InvalidState("not running".into()));
        };
        gossip.stop().await?;
        Ok(())
    }

    /// `createEvent(payload)` (§4.6). Requires the node to be running.
    pub async fn create_event(&self, payload: Payload) -> Result<Event, EngineError> {
        let resources = self.resources.lock().await;
        let gossip = resources
            .as_ref()
            .and_then(|r| r.gossip.as_ref())
            .ok_or_else(|| EngineError::InvalidState("not running".into()))?;
        Ok(gossip.create_event(payload).await?)
    }

    pub async fn on_event_created(&self) -> Result<broadcast::Receiver<Event>, EngineError> {
        self.with_gossip(|g| g.subscribe_event_created()).await
    }

    pub async fn on_event_received(&self) -> Result<broadcast::Receiver<Event>, EngineError> {
        self.with_gossip(|g| g.subscribe_event_received()).await
    }

    pub async fn on_peer_up(&self) -> Result<broadcast::Receiver<NodeId>, EngineError> {
        self.with_gossip(|g| g.subscribe_peer_up()).await
    }

    pub async fn on_peer_down(&self) -> Result<broadcast::Receiver<NodeId>, EngineError> {
        self.with_gossip(|g| g.subscribe_peer_down()).await
    }

    /// Force-save every projection's state regardless of the auto-save
    /// cadence. Save failures are logged inside the engine, never
    /// propagated here (§4.4).
    pub async fn save_projection_states(&self) -> Result<(), EngineError> {
        let resources = self.resources.lock().await;
        let resources = resources
            .as_ref()
            .ok_or_else(|| EngineError::InvalidState("not initialized".into()))?;
        resources.projection_engine.save_all().await;
        Ok(())
    }

    pub async fn clear_projection_states(&self) -> Result<(), EngineError> {
        let resources = self.resources.lock().await;
        let resources = resources
            .as_ref()
            .ok_or_else(|| EngineError::InvalidState("not initialized".into()))?;
        resources.projection_engine.clear_all().await?;
        Ok(())
    }

    async fn with_gossip<T>(&self, f: impl FnOnce(&GossipNode) -> T) -> Result<T, EngineError> {
        let resources = self.resources.lock().await;
        let gossip = resources
            .as_ref()
            .and_then(|r| r.gossip.as_ref())
            .ok_or_else(|| EngineError::InvalidState("not running".into()))?;
        Ok(f(gossip))
    }
}
