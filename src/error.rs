//! Top-level error type surfaced by the [`crate::service::Service`] façade.
//!
//! Internal modules keep their own focused `thiserror` enums; this type
//! wraps them with `#[from]` so callers of the façade only ever match on
//! one error type, the way the teacher's FFI boundary (`CoreError`) wraps
//! `StoreError`, `NetworkError`, `OpsError`, etc.

use thiserror::Error;

use crate::gossip::GossipError;
use crate::store::{ClockStoreError, EventStoreError, ProjectionStoreError};
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error(transparent)]
    Storage(#[from] EventStoreError),

    #[error(transparent)]
    Clock(#[from] ClockStoreError),

    #[error(transparent)]
    Projection(#[from] ProjectionStoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Gossip(#[from] GossipError),

    #[error("engine is shutting down")]
    Shutdown,

    #[error("invalid operation for the engine's current state: {0}")]
    InvalidState(String),
}
