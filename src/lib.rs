//! A gossip replication engine for intermittently-connected peers:
//! per-origin vector clocks over an append-only event log, a pull-based
//! anti-entropy protocol, and a CQRS projection engine for read models
//! built on top of it.
//!
//! The crate has no opinion on the transport carrying bytes between
//! peers, on the credential that names a node, or on what an event's
//! payload means — those are supplied by the embedding application
//! through [`transport::TransportAdapter`], [`identity::NodeId`], and
//! [`projection::Projection`] respectively.

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod gossip;
pub mod identity;
pub mod projection;
pub mod service;
pub mod store;
pub mod transport;
pub mod wire;

pub use clock::VectorClock;
pub use config::EngineConfig;
pub use error::EngineError;
pub use event::{Event, EventId, Payload};
pub use gossip::{GossipError, GossipNode};
pub use identity::NodeId;
pub use projection::{Projection, ProjectionEngine, ProjectionError};
pub use service::Service;
pub use transport::{InProcessNetwork, InProcessTransport, TransportAdapter, TransportError};
