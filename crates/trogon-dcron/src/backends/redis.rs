//! [`LivenessBackend`] backed by Redis (requires the `redis` feature).
//!
//! Presence records are `SETEX distributed-cron:<namespace>:<node_id> <ttl> <node_id>`.
//! Heartbeats `EXPIRE` the key and fall back to `SETEX` when Redis reports the
//! key is gone. Discovery drains `SCAN ... MATCH distributed-cron:<namespace>:*`
//! until the cursor returns to `0`.

use std::time::Duration;

use redis::aio::MultiplexedConnection;

use crate::backend::{LivenessBackend, Renewal};
use crate::error::{DcronError, validate_namespace};
use crate::node::{NodeId, namespace_prefix, node_id_from_key, presence_key};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
const SCAN_COUNT: usize = 100;

#[derive(Debug)]
pub enum RedisBackendError {
    Redis(redis::RedisError),
    InvalidNamespace(String),
}

impl std::fmt::Display for RedisBackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Redis(e) => write!(f, "Redis error: {e}"),
            Self::InvalidNamespace(ns) => write!(f, "invalid namespace '{ns}'"),
        }
    }
}

impl std::error::Error for RedisBackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Redis(e) => Some(e),
            Self::InvalidNamespace(_) => None,
        }
    }
}

impl From<redis::RedisError> for RedisBackendError {
    fn from(e: redis::RedisError) -> Self {
        Self::Redis(e)
    }
}

#[derive(Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    ttl: Duration,
}

impl RedisBackend {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self, DcronError> {
        let client = redis::Client::open(url).map_err(|e| DcronError::Connect(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection_with_timeouts(RESPONSE_TIMEOUT, CONNECT_TIMEOUT)
            .await
            .map_err(|e| DcronError::Connect(e.to_string()))?;
        tracing::info!(url, ttl_secs = ttl.as_secs(), "Connected to Redis liveness backend");
        Ok(Self { conn, ttl })
    }

    /// Redis TTLs have whole-second resolution.
    fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }
}

fn check_namespace(namespace: &str) -> Result<(), RedisBackendError> {
    validate_namespace(namespace).map_err(|_| RedisBackendError::InvalidNamespace(namespace.to_string()))
}

impl LivenessBackend for RedisBackend {
    type Error = RedisBackendError;

    async fn ping(&self) -> Result<(), RedisBackendError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn register_node(&self, namespace: &str) -> Result<NodeId, RedisBackendError> {
        check_namespace(namespace)?;
        let node_id = NodeId::generate();
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SETEX")
            .arg(presence_key(namespace, &node_id))
            .arg(self.ttl_secs())
            .arg(node_id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(node_id)
    }

    async fn heartbeat(&self, namespace: &str, node_id: &NodeId) -> Result<Renewal, RedisBackendError> {
        check_namespace(namespace)?;
        let key = presence_key(namespace, node_id);
        let mut conn = self.conn.clone();

        let extended: i64 = redis::cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_secs())
            .query_async(&mut conn)
            .await?;
        if extended == 1 {
            return Ok(Renewal::Extended);
        }

        let _: () = redis::cmd("SETEX")
            .arg(&key)
            .arg(self.ttl_secs())
            .arg(node_id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(Renewal::Recreated)
    }

    async fn list_nodes(&self, namespace: &str) -> Result<Vec<NodeId>, RedisBackendError> {
        check_namespace(namespace)?;
        let pattern = format!("{}*", namespace_prefix(namespace));
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut nodes = Vec::new();

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            nodes.extend(keys.iter().filter_map(|key| node_id_from_key(namespace, key)));
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once across pages.
        nodes.sort();
        nodes.dedup();
        Ok(nodes)
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}
