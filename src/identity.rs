//! Local node identity.
//!
//! A `NodeId` is an opaque, UUID-shaped string that the caller persists
//! across restarts (the credential store holding it is out of scope here,
//! per the purpose statement — the engine only ever receives it through
//! [`crate::service::Service::set_identity`]).

use std::fmt;

/// Stable identifier for a replica. Treated as opaque everywhere except
/// that it must be non-empty and must not contain the `_` separator used
/// by [`crate::event::EventId`] and correlation ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Generate a fresh, UUID-shaped node id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing string as a node id.
    ///
    /// Returns `None` if `raw` is empty or contains `_`, since that
    /// character separates the components of event ids and correlation
    /// ids on the wire (§6.1) and would make them ambiguous to parse.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if raw.is_empty() || raw.contains('_') {
            return None;
        }
        Some(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_is_non_empty_and_unique() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert!(!a.as_str().is_empty());
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_empty_and_underscored() {
        assert!(NodeId::new("").is_none());
        assert!(NodeId::new("a_b").is_none());
        assert!(NodeId::new("node-a").is_some());
    }
}
