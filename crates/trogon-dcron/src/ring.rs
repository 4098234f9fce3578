//! Consistent-hash ring mapping job names to owning nodes.
//!
//! Each node gets `replicas` virtual positions, `sha256(node_id ++ be(index))`
//! truncated to its first 8 bytes. A key belongs to the first position at or
//! after its own hash, wrapping around past the largest position. The ring is
//! immutable: membership changes build a new ring.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

use crate::node::NodeId;

pub const DEFAULT_REPLICAS: usize = 50;

#[derive(Debug, Clone, Default)]
pub struct HashRing {
    positions: Vec<(u64, NodeId)>,
    nodes: Vec<NodeId>,
    replicas: usize,
}

impl HashRing {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn build<I>(nodes: I, replicas: usize) -> Self
    where
        I: IntoIterator<Item = NodeId>,
    {
        let replicas = replicas.max(1);
        let nodes: Vec<NodeId> = nodes.into_iter().collect::<BTreeSet<_>>().into_iter().collect();

        let mut positions = Vec::with_capacity(nodes.len() * replicas);
        for node in &nodes {
            for index in 0..replicas {
                positions.push((virtual_position(node, index), node.clone()));
            }
        }
        // Ties on position are resolved by node id so every process sorts identically.
        positions.sort_unstable();

        Self {
            positions,
            nodes,
            replicas,
        }
    }

    /// Owner of `key`, or `None` when the ring has no members.
    pub fn locate(&self, key: &str) -> Option<&NodeId> {
        if self.positions.is_empty() {
            return None;
        }
        let hash = key_hash(key.as_bytes());
        let idx = self.positions.partition_point(|(pos, _)| *pos < hash);
        let idx = if idx == self.positions.len() { 0 } else { idx };
        Some(&self.positions[idx].1)
    }

    /// Distinct members, sorted.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.binary_search(node).is_ok()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }
}

fn virtual_position(node: &NodeId, index: usize) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(node.as_str().as_bytes());
    hasher.update((index as u64).to_be_bytes());
    truncate(&hasher.finalize())
}

fn key_hash(key: &[u8]) -> u64 {
    truncate(&Sha256::digest(key))
}

fn truncate(digest: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(buf)
}
