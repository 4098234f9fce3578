use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, Span, debug, info, trace, warn};

use crate::backend::{LivenessBackend, Renewal};
use crate::config::DcronOptions;
use crate::error::{DcronError, validate_namespace};
use crate::node::NodeId;
use crate::ring::HashRing;

struct Loops {
    shutdown: watch::Sender<bool>,
    heartbeat: JoinHandle<()>,
    refresh: JoinHandle<()>,
}

/// This node's view of its namespace: its own registration, the heartbeat
/// that keeps it alive and the hash ring built from the live membership.
pub struct NodePool<B: LivenessBackend> {
    namespace: String,
    backend: B,
    replicas: usize,
    refresh_interval: Duration,
    span: Span,
    node_id: RwLock<Option<NodeId>>,
    ring: RwLock<Arc<HashRing>>,
    loops: Mutex<Option<Loops>>,
}

impl<B: LivenessBackend> NodePool<B> {
    pub fn new(namespace: impl Into<String>, backend: B, options: &DcronOptions, span: Span) -> Self {
        Self {
            namespace: namespace.into(),
            backend,
            replicas: options.hash_replicas.max(1),
            refresh_interval: options.refresh_interval.max(Duration::from_millis(1)),
            span,
            node_id: RwLock::new(None),
            ring: RwLock::new(Arc::new(HashRing::empty())),
            loops: Mutex::new(None),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The id registered by the last successful [`start`](Self::start), until stopped.
    pub fn node_id(&self) -> Option<NodeId> {
        self.node_id.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_running(&self) -> bool {
        self.node_id().is_some()
    }

    /// Snapshot of the current ring.
    pub fn ring(&self) -> Arc<HashRing> {
        Arc::clone(&self.ring.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.ring().nodes().to_vec()
    }

    /// Owner of `key` on the current ring, `None` while the ring is empty.
    pub fn locate(&self, key: &str) -> Option<NodeId> {
        self.ring().locate(key).cloned()
    }

    /// Register this node, then spawn the heartbeat and refresh loops.
    ///
    /// Registration failure is returned and nothing is spawned. A failed
    /// initial discovery only leaves the ring empty until the next refresh.
    /// Calling `start` on a running pool returns the existing id.
    pub async fn start(self: &Arc<Self>) -> Result<NodeId, DcronError> {
        let mut loops = self.loops.lock().await;
        if loops.is_some() {
            if let Some(node_id) = self.node_id() {
                return Ok(node_id);
            }
        }

        validate_namespace(&self.namespace)?;

        let node_id = self
            .backend
            .register_node(&self.namespace)
            .instrument(self.span.clone())
            .await
            .map_err(|e| {
                warn!(parent: &self.span, error = %e, "Node registration failed");
                DcronError::backend("register_node", e)
            })?;
        *self.node_id.write().unwrap_or_else(PoisonError::into_inner) = Some(node_id.clone());
        info!(parent: &self.span, node_id = %node_id, ttl_ms = self.backend.ttl().as_millis() as u64, "Node registered");

        let (shutdown, rx) = watch::channel(false);
        let heartbeat = tokio::spawn(
            heartbeat_loop(self.backend.clone(), self.namespace.clone(), node_id.clone(), rx.clone())
                .instrument(self.span.clone()),
        );

        match self.refresh().await {
            Ok(members) => debug!(parent: &self.span, members, "Initial discovery complete"),
            Err(e) => warn!(parent: &self.span, error = %e, "Initial discovery failed, ring stays empty until next refresh"),
        }

        let refresh = tokio::spawn(
            refresh_loop(Arc::downgrade(self), self.refresh_interval, rx).instrument(self.span.clone()),
        );

        *loops = Some(Loops {
            shutdown,
            heartbeat,
            refresh,
        });
        Ok(node_id)
    }

    /// Rediscover membership and swap in a freshly built ring.
    ///
    /// On failure the previous ring is kept. An empty membership is a valid
    /// answer and empties the ring.
    pub async fn refresh(&self) -> Result<usize, DcronError> {
        let nodes = self
            .backend
            .list_nodes(&self.namespace)
            .instrument(self.span.clone())
            .await
            .map_err(|e| DcronError::backend("list_nodes", e))?;

        let ring = Arc::new(HashRing::build(nodes, self.replicas));
        let members = ring.len();
        let previous = {
            let mut current = self.ring.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, Arc::clone(&ring))
        };

        if previous.nodes() != ring.nodes() {
            info!(parent: &self.span, members, previous = previous.len(), "Membership changed");
        }
        Ok(members)
    }

    /// Stop both loops and forget the registration. The presence record is
    /// left to expire on its own.
    pub async fn stop(&self) {
        let Some(loops) = self.loops.lock().await.take() else {
            return;
        };
        let _ = loops.shutdown.send(true);
        let _ = loops.heartbeat.await;
        let _ = loops.refresh.await;

        let node_id = self.node_id.write().unwrap_or_else(PoisonError::into_inner).take();
        *self.ring.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(HashRing::empty());
        if let Some(node_id) = node_id {
            info!(parent: &self.span, node_id = %node_id, "Node pool stopped");
        }
    }
}

impl<B: LivenessBackend> Drop for NodePool<B> {
    fn drop(&mut self) {
        if let Some(loops) = self.loops.get_mut().take() {
            let _ = loops.shutdown.send(true);
        }
    }
}

async fn heartbeat_loop<B: LivenessBackend>(
    backend: B,
    namespace: String,
    node_id: NodeId,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = backend.heartbeat_interval();
    let mut tick = tokio::time::interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => match backend.heartbeat(&namespace, &node_id).await {
                Ok(Renewal::Extended) => trace!(node_id = %node_id, "Heartbeat"),
                Ok(Renewal::Recreated) => {
                    warn!(node_id = %node_id, "Presence record had expired, recreated")
                }
                Err(e) => warn!(node_id = %node_id, error = %e, "Heartbeat failed, retrying next interval"),
            },
        }
    }

    debug!(node_id = %node_id, "Heartbeat loop stopped");
}

async fn refresh_loop<B: LivenessBackend>(
    pool: Weak<NodePool<B>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                let Some(pool) = pool.upgrade() else { break };
                if let Err(e) = pool.refresh().await {
                    warn!(error = %e, "Membership refresh failed, keeping previous ring");
                }
            }
        }
    }

    debug!("Refresh loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryBackend;
    use crate::clock::ManualClock;

    const TTL: Duration = Duration::from_secs(2);

    fn pool(namespace: &str, backend: MemoryBackend<ManualClock>) -> Arc<NodePool<MemoryBackend<ManualClock>>> {
        Arc::new(NodePool::new(namespace, backend, &DcronOptions::default(), Span::none()))
    }

    fn backend() -> MemoryBackend<ManualClock> {
        MemoryBackend::with_clock(TTL, ManualClock::new())
    }

    #[tokio::test]
    async fn start_registers_and_owns_every_key_alone() {
        let backend = backend();
        let pool = pool("svc", backend.clone());

        let id = pool.start().await.unwrap();
        assert!(pool.is_running());
        assert_eq!(pool.node_id(), Some(id.clone()));
        assert_eq!(pool.members(), vec![id.clone()]);
        assert_eq!(pool.locate("daily-report"), Some(id.clone()));
        assert_eq!(backend.value_of("svc", &id), Some(id.to_string()));

        pool.stop().await;
    }

    #[tokio::test]
    async fn start_twice_keeps_the_same_identity() {
        let pool = pool("svc", backend());
        let first = pool.start().await.unwrap();
        let second = pool.start().await.unwrap();
        assert_eq!(first, second);
        pool.stop().await;
    }

    #[tokio::test]
    async fn start_fails_when_backend_is_down() {
        let backend = backend();
        backend.set_unavailable(true);
        let pool = pool("svc", backend.clone());

        let err = pool.start().await.unwrap_err();
        assert!(matches!(err, DcronError::BackendUnavailable { operation: "register_node", .. }));
        assert!(!pool.is_running());
        assert!(pool.loops.lock().await.is_none());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn start_rejects_invalid_namespace() {
        let pool = pool("bad:namespace", backend());
        let err = pool.start().await.unwrap_err();
        assert!(matches!(err, DcronError::InvalidNamespace { .. }));
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn refresh_failure_keeps_previous_ring() {
        let backend = backend();
        let peer = NodeId::new("peer");
        backend.insert_node("svc", &peer);
        let pool = pool("svc", backend.clone());
        let id = pool.start().await.unwrap();
        assert_eq!(pool.members().len(), 2);

        backend.fail_scan_after(0);
        assert!(pool.refresh().await.is_err());
        let members = pool.members();
        assert!(members.contains(&id));
        assert!(members.contains(&peer));

        backend.clear_faults();
        pool.stop().await;
    }

    #[tokio::test]
    async fn empty_discovery_empties_the_ring() {
        let backend = backend();
        let pool = pool("svc", backend.clone());
        let id = pool.start().await.unwrap();
        assert_eq!(pool.locate("job"), Some(id.clone()));

        backend.evict_node("svc", &id);
        assert_eq!(pool.refresh().await.unwrap(), 0);
        assert!(pool.ring().is_empty());
        assert_eq!(pool.locate("job"), None);

        pool.stop().await;
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let backend = backend();
        let a = pool("svc-a", backend.clone());
        let b = pool("svc-b", backend.clone());
        let id_a = a.start().await.unwrap();
        let id_b = b.start().await.unwrap();

        assert_eq!(a.members(), vec![id_a]);
        assert_eq!(b.members(), vec![id_b]);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_recreates_an_expired_record() {
        let backend = backend();
        let pool = pool("svc", backend.clone());
        let id = pool.start().await.unwrap();

        backend.evict_node("svc", &id);
        assert!(backend.value_of("svc", &id).is_none());

        // One heartbeat interval (ttl / 2) later the loop has renewed.
        tokio::time::sleep(TTL / 2 + Duration::from_millis(50)).await;
        assert_eq!(backend.value_of("svc", &id), Some(id.to_string()));

        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_loop_picks_up_new_members() {
        let backend = backend();
        let pool = pool("svc", backend.clone());
        pool.start().await.unwrap();
        assert_eq!(pool.members().len(), 1);

        backend.insert_node("svc", &NodeId::new("late-joiner"));
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(pool.members().len(), 2);

        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn loops_retry_after_an_outage() {
        let backend = backend();
        let pool = pool("svc", backend.clone());
        let id = pool.start().await.unwrap();

        // Heartbeat and refresh both tick every second with a 2 s TTL.
        backend.set_unavailable(true);
        backend.evict_node("svc", &id);
        let peer = NodeId::new("peer");
        backend.insert_node("svc", &peer);
        tokio::time::sleep(Duration::from_millis(1050)).await;
        assert!(backend.value_of("svc", &id).is_none());
        assert_eq!(pool.members(), vec![id.clone()]);

        backend.set_unavailable(false);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(backend.value_of("svc", &id), Some(id.to_string()));
        assert!(pool.members().contains(&peer));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let members = pool.members();
        assert!(members.contains(&id));
        assert!(members.contains(&peer));
        assert!(pool.is_running());

        pool.stop().await;
    }

    #[tokio::test]
    async fn stop_clears_identity_and_ring_but_not_the_record() {
        let backend = backend();
        let pool = pool("svc", backend.clone());
        let id = pool.start().await.unwrap();

        pool.stop().await;
        assert!(!pool.is_running());
        assert!(pool.ring().is_empty());
        assert_eq!(pool.locate("job"), None);
        assert!(backend.value_of("svc", &id).is_some());

        pool.stop().await;
    }

    #[tokio::test]
    async fn restart_registers_a_fresh_identity() {
        let pool = pool("svc", backend());
        let first = pool.start().await.unwrap();
        pool.stop().await;
        let second = pool.start().await.unwrap();
        assert_ne!(first, second);
        pool.stop().await;
    }
}
