use std::future::Future;
use std::time::Duration;

use crate::node::NodeId;

/// What a single heartbeat did to the presence record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renewal {
    /// The record was still live; its TTL was pushed out.
    Extended,
    /// The record had already expired and was written again.
    Recreated,
}

/// Liveness protocol used by the node pool to find its peers.
///
/// A backend keeps one TTL-bounded presence record per node and namespace.
/// Records disappear on their own once heartbeats stop, so there is no
/// deregistration operation. Implementations only perform single calls; the
/// renewal loop and its retry policy belong to [`NodePool`](crate::NodePool).
pub trait LivenessBackend: Send + Sync + Clone + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Check the backend connection itself.
    fn ping(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Create a presence record for a freshly generated node id.
    fn register_node(
        &self,
        namespace: &str,
    ) -> impl Future<Output = Result<NodeId, Self::Error>> + Send;

    /// Extend the record's TTL, recreating it if it has already expired.
    fn heartbeat(
        &self,
        namespace: &str,
        node_id: &NodeId,
    ) -> impl Future<Output = Result<Renewal, Self::Error>> + Send;

    /// Every node currently live in `namespace`, sorted and de-duplicated.
    ///
    /// Paginated backends must drain the whole cursor; a failure on any page
    /// fails the call rather than returning what was read so far.
    fn list_nodes(
        &self,
        namespace: &str,
    ) -> impl Future<Output = Result<Vec<NodeId>, Self::Error>> + Send;

    /// Lifetime of a presence record without renewal.
    fn ttl(&self) -> Duration;

    /// Renewal cadence. Half the TTL leaves room for one missed renewal.
    fn heartbeat_interval(&self) -> Duration {
        (self.ttl() / 2).max(Duration::from_millis(1))
    }
}
