use std::fmt;

use serde::{Deserialize, Serialize};

/// Key prefix shared by every backend that stores presence records under a
/// flat key space.
pub const GLOBAL_KEY_PREFIX: &str = "distributed-cron";

/// Identity of one scheduler process. Opaque to everything but the backend
/// that minted it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identity for a node that is about to register.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
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

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// `distributed-cron:<namespace>:`. Every presence key of a namespace starts with this.
pub fn namespace_prefix(namespace: &str) -> String {
    format!("{GLOBAL_KEY_PREFIX}:{namespace}:")
}

/// `distributed-cron:<namespace>:<node_id>`
pub fn presence_key(namespace: &str, node_id: &NodeId) -> String {
    format!("{}{}", namespace_prefix(namespace), node_id)
}

/// Inverse of [`presence_key`]. Returns `None` for keys outside the namespace
/// or with an empty id segment.
pub fn node_id_from_key(namespace: &str, key: &str) -> Option<NodeId> {
    let id = key.strip_prefix(&namespace_prefix(namespace))?;
    if id.is_empty() || id.contains(':') {
        return None;
    }
    Some(NodeId::new(id))
}
