//! [`LivenessBackend`] backed by a NATS JetStream KV bucket.
//!
//! The bucket's `max_age` is the presence TTL: every `put` writes a new
//! revision with a fresh age, and a key whose last revision ages out vanishes
//! from `keys()`. NATS keys cannot contain `:`, so the global prefix becomes
//! the bucket name and records are stored as `<namespace>.<node_id>`.

use std::time::Duration;

use async_nats::jetstream::{self, kv};
use bytes::Bytes;
use futures::StreamExt;

use crate::backend::{LivenessBackend, Renewal};
use crate::error::{DcronError, validate_namespace};
use crate::node::{GLOBAL_KEY_PREFIX, NodeId};

pub const BUCKET: &str = GLOBAL_KEY_PREFIX;

#[derive(Debug)]
pub struct NatsKvError(pub String);

impl std::fmt::Display for NatsKvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NATS KV error: {}", self.0)
    }
}

impl std::error::Error for NatsKvError {}

#[derive(Clone)]
pub struct NatsKvBackend {
    store: kv::Store,
    ttl: Duration,
}

impl NatsKvBackend {
    /// Get or create the presence bucket with `max_age = ttl`.
    ///
    /// An existing bucket keeps the `max_age` it was created with; every node
    /// sharing a bucket should be configured with the same TTL.
    pub async fn new(js: &jetstream::Context, ttl: Duration) -> Result<Self, DcronError> {
        let config = kv::Config {
            bucket: BUCKET.to_string(),
            history: 1,
            max_age: ttl,
            ..Default::default()
        };
        let store = match js.create_key_value(config).await {
            Ok(store) => store,
            Err(_) => js
                .get_key_value(BUCKET)
                .await
                .map_err(|e| DcronError::Connect(e.to_string()))?,
        };
        Ok(Self { store, ttl })
    }

    pub async fn connect(client: async_nats::Client, ttl: Duration) -> Result<Self, DcronError> {
        let js = jetstream::new(client);
        Self::new(&js, ttl).await
    }
}

fn record_key(namespace: &str, node_id: &NodeId) -> String {
    format!("{namespace}.{node_id}")
}

fn check_namespace(namespace: &str) -> Result<(), NatsKvError> {
    validate_namespace(namespace).map_err(|e| NatsKvError(e.to_string()))
}

impl LivenessBackend for NatsKvBackend {
    type Error = NatsKvError;

    async fn ping(&self) -> Result<(), NatsKvError> {
        self.store
            .status()
            .await
            .map(|_| ())
            .map_err(|e| NatsKvError(e.to_string()))
    }

    async fn register_node(&self, namespace: &str) -> Result<NodeId, NatsKvError> {
        check_namespace(namespace)?;
        let node_id = NodeId::generate();
        self.store
            .create(record_key(namespace, &node_id), Bytes::from(node_id.to_string()))
            .await
            .map_err(|e| NatsKvError(e.to_string()))?;
        Ok(node_id)
    }

    async fn heartbeat(&self, namespace: &str, node_id: &NodeId) -> Result<Renewal, NatsKvError> {
        check_namespace(namespace)?;
        let key = record_key(namespace, node_id);
        let value = Bytes::from(node_id.to_string());

        let live = self
            .store
            .entry(key.as_str())
            .await
            .map_err(|e| NatsKvError(e.to_string()))?
            .is_some_and(|entry| entry.operation == kv::Operation::Put);

        if live {
            self.store
                .put(key, value)
                .await
                .map_err(|e| NatsKvError(e.to_string()))?;
            Ok(Renewal::Extended)
        } else {
            self.store
                .create(key, value)
                .await
                .map_err(|e| NatsKvError(e.to_string()))?;
            Ok(Renewal::Recreated)
        }
    }

    async fn list_nodes(&self, namespace: &str) -> Result<Vec<NodeId>, NatsKvError> {
        check_namespace(namespace)?;
        let prefix = format!("{namespace}.");
        let mut keys = self
            .store
            .keys()
            .await
            .map_err(|e| NatsKvError(e.to_string()))?;

        let mut nodes = Vec::new();
        // A broken stream fails the whole listing; a half-read key set would
        // look like membership loss to the ring.
        while let Some(key) = keys.next().await {
            let key = key.map_err(|e| NatsKvError(e.to_string()))?;
            if let Some(id) = key.strip_prefix(&prefix) {
                if !id.is_empty() {
                    nodes.push(NodeId::new(id));
                }
            }
        }

        nodes.sort();
        nodes.dedup();
        Ok(nodes)
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}
