use std::time::Duration;

use crate::engine::EngineOptions;
use crate::env::ReadEnv;
use crate::ring::DEFAULT_REPLICAS;

const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(1);
const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(1);
const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_NODE_TTL: Duration = Duration::from_secs(10);
const DEFAULT_NATS_URL: &str = "nats://localhost:4222";
const DEFAULT_ROLL_CALL_SCHEDULE: &str = "*/10 * * * * *";

/// Tuning knobs for one [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone)]
pub struct DcronOptions {
    /// How often the node pool rediscovers membership and rebuilds the ring.
    pub refresh_interval: Duration,
    /// Virtual positions per node on the hash ring.
    pub hash_replicas: usize,
    pub engine: EngineOptions,
}

impl Default for DcronOptions {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            hash_replicas: DEFAULT_REPLICAS,
            engine: EngineOptions::default(),
        }
    }
}

impl DcronOptions {
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval.max(MIN_REFRESH_INTERVAL);
        self
    }

    pub fn with_hash_replicas(mut self, replicas: usize) -> Self {
        self.hash_replicas = replicas.max(1);
        self
    }

    pub fn with_engine(mut self, engine: EngineOptions) -> Self {
        self.engine = engine;
        self
    }

    /// Resolved from environment variables, falling back to defaults on
    /// missing or unparsable values:
    /// - `DCRON_REFRESH_INTERVAL_MS` (default 1000)
    /// - `DCRON_HASH_REPLICAS` (default 50)
    /// - `DCRON_ENGINE_TICK_MS` (default 500)
    /// - `DCRON_SKIP_IF_RUNNING` (default false)
    pub fn from_env<E: ReadEnv>(env: &E) -> Self {
        let defaults = Self::default();
        let refresh_interval = parse::<u64, _>(env, "DCRON_REFRESH_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.refresh_interval);
        let hash_replicas = parse(env, "DCRON_HASH_REPLICAS").unwrap_or(defaults.hash_replicas);

        let mut engine = defaults.engine;
        if let Some(ms) = parse::<u64, _>(env, "DCRON_ENGINE_TICK_MS") {
            engine = engine.with_tick(Duration::from_millis(ms));
        }
        if let Some(skip) = parse(env, "DCRON_SKIP_IF_RUNNING") {
            engine = engine.with_skip_if_running(skip);
        }

        Self::default()
            .with_refresh_interval(refresh_interval)
            .with_hash_replicas(hash_replicas)
            .with_engine(engine)
    }
}

/// Process-level settings for the `trogon-dcron` binary.
///
/// Resolved from environment variables:
/// - `DCRON_NAMESPACE`: service name scoping discovery (default: `default`)
/// - `DCRON_NODE_TTL_SECS`: presence record TTL (default: 10)
/// - `DCRON_ROLL_CALL_SCHEDULE`: schedule of the fleet roll call job (default: every 10 s)
/// - `NATS_URL`: NATS server (default: `nats://localhost:4222`)
/// - Everything [`DcronOptions::from_env`] reads
#[derive(Debug, Clone)]
pub struct DcronConfig {
    pub namespace: String,
    pub node_ttl: Duration,
    pub roll_call_schedule: String,
    pub nats_url: String,
    pub options: DcronOptions,
}

impl DcronConfig {
    pub fn from_env<E: ReadEnv>(env: &E) -> Self {
        Self {
            namespace: env
                .var("DCRON_NAMESPACE")
                .ok()
                .filter(|ns| !ns.is_empty())
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            node_ttl: parse::<u64, _>(env, "DCRON_NODE_TTL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_NODE_TTL),
            roll_call_schedule: env
                .var("DCRON_ROLL_CALL_SCHEDULE")
                .unwrap_or_else(|_| DEFAULT_ROLL_CALL_SCHEDULE.to_string()),
            nats_url: env
                .var("NATS_URL")
                .unwrap_or_else(|_| DEFAULT_NATS_URL.to_string()),
            options: DcronOptions::from_env(env),
        }
    }
}

fn parse<T: std::str::FromStr, E: ReadEnv>(env: &E, key: &str) -> Option<T> {
    env.var(key).ok().and_then(|v| v.trim().parse().ok())
}
