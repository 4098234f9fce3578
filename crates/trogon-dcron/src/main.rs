mod signal;

use std::sync::Arc;
use std::time::Duration;

use trogon_dcron::config::DcronConfig;
use trogon_dcron::env::SystemEnv;
use trogon_dcron::{NatsKvBackend, Scheduler};

const ROLL_CALL_JOB: &str = "fleet-roll-call";
const NATS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = DcronConfig::from_env(&SystemEnv);

    tracing::info!(nats_url = %config.nats_url, namespace = %config.namespace, "Connecting to NATS");

    let nats = async_nats::ConnectOptions::new()
        .connection_timeout(NATS_CONNECT_TIMEOUT)
        .connect(&config.nats_url)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to connect to NATS");
            std::process::exit(1);
        });

    let backend = NatsKvBackend::connect(nats, config.node_ttl)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to open presence bucket");
            std::process::exit(1);
        });

    let scheduler = Scheduler::new(config.namespace.clone(), backend, config.options.clone());

    let pool = Arc::clone(scheduler.node_pool());
    if let Err(e) = scheduler.add_func(ROLL_CALL_JOB, &config.roll_call_schedule, move || {
        tracing::info!(
            node_id = ?pool.node_id(),
            members = pool.members().len(),
            "Fleet roll call ran on this node"
        );
    }) {
        tracing::error!(error = %e, "Invalid roll call schedule");
        std::process::exit(1);
    }

    if let Err(e) = scheduler.start().await {
        tracing::error!(error = %e, "Failed to join namespace");
        std::process::exit(1);
    }

    match serde_json::to_string(&scheduler.status()) {
        Ok(status) => tracing::info!(%status, "Joined namespace"),
        Err(e) => tracing::warn!(error = %e, "Failed to serialize status"),
    }

    let signal = signal::wait_for_shutdown().await;
    tracing::info!(
        signal = signal.name(),
        node_id = ?scheduler.node_id(),
        namespace = %config.namespace,
        "Leaving namespace"
    );
    scheduler.stop().await;
}
