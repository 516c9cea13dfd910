//! IndexSync Agent Binary
//!
//! Standalone agent process. Joins the cluster, drains its shard of the
//! outbox and logs every event it applies.
//!
//! # Environment Variables
//!
//! - `AGENT_NAME`: Name stored in the membership row (default: hostname-based)
//! - `METADATA_STORE`: SQLite path or PostgreSQL URL (required)
//! - `AGENT_TYPE`: `dynamic` or `static` (default: dynamic)
//! - `TOTAL_SHARD_COUNT`: Static sharding only
//! - `ASSIGNED_SHARD_INDEX`: Static sharding only
//! - `LEASE_DURATION_MS`: Membership lease (default: 30000)
//! - `PULSE_INTERVAL_MS`: Time between pulses (default: 2000)
//! - `STABILIZATION_READS`: Identical reads before draining (default: 2)
//! - `BATCH_SIZE`: Events per batch (default: 50)
//! - `METRICS_ADDR`: Address of the metrics server, `metrics` feature only
//!
//! # Example
//!
//! ```bash
//! export AGENT_NAME=indexer-1
//! export METADATA_STORE=./data/coordination.db
//! cargo run --bin indexsync-agent
//! ```

use async_trait::async_trait;
use indexsync_agent::{Agent, AgentConfig, IndexingEventHandler};
use indexsync_core::IndexingQueueEventPayload;
use indexsync_metadata::{AgentType, OutboxEvent, SqliteCoordinationStore};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Handler that only logs what it would reindex.
struct LoggingEventHandler;

#[async_trait]
impl IndexingEventHandler for LoggingEventHandler {
    async fn apply(
        &self,
        event: &OutboxEvent,
        payload: &IndexingQueueEventPayload,
    ) -> indexsync_agent::Result<()> {
        let dirty_paths = payload
            .dirtiness
            .as_ref()
            .map(|d| d.dirty_paths.len())
            .unwrap_or(0);
        info!(
            event_id = event.id,
            entity = %event.entity_name,
            entity_id = %event.entity_id,
            routing_key = ?payload.routes.current_route.routing_key,
            stale_routes = payload.routes.stale_routes().count(),
            dirty_paths,
            "Reindex"
        );
        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>, Box<dyn std::error::Error>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("invalid value for {}: {:?}", name, value).into()),
        Err(_) => Ok(None),
    }
}

fn load_config() -> Result<AgentConfig, Box<dyn std::error::Error>> {
    let mut config = AgentConfig::default();

    config.name = std::env::var("AGENT_NAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.to_str().map(|s| format!("indexer-{}", s)))
            .unwrap_or_else(|| format!("indexer-{}", uuid::Uuid::new_v4()))
    });

    config.agent_type = match std::env::var("AGENT_TYPE").as_deref() {
        Ok("static") => AgentType::EventProcessingStaticSharding,
        Ok("dynamic") | Err(_) => AgentType::EventProcessingDynamicSharding,
        Ok(other) => AgentType::from_str(other)
            .map_err(|_| format!("invalid value for AGENT_TYPE: {:?}", other))?,
    };
    config.total_shard_count = env_parse("TOTAL_SHARD_COUNT")?;
    config.assigned_shard_index = env_parse("ASSIGNED_SHARD_INDEX")?;

    if let Some(ms) = env_parse::<u64>("LEASE_DURATION_MS")? {
        config.lease_duration = Duration::from_millis(ms);
    }
    if let Some(ms) = env_parse::<u64>("PULSE_INTERVAL_MS")? {
        config.pulse_interval = Duration::from_millis(ms);
    }
    if let Some(reads) = env_parse("STABILIZATION_READS")? {
        config.stabilization_reads = reads;
    }
    if let Some(batch_size) = env_parse("BATCH_SIZE")? {
        config.batch_size = batch_size;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    let log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .parse()
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("IndexSync agent starting");

    let config = load_config()?;
    info!(config = %serde_json::to_string(&config)?, "Configuration loaded");

    // Connect to metadata store
    let metadata_store_url = std::env::var("METADATA_STORE")
        .map_err(|_| "METADATA_STORE environment variable required")?;

    let builder = Agent::builder()
        .config(config)
        .handler(Arc::new(LoggingEventHandler));

    let builder = if metadata_store_url.starts_with("postgresql://")
        || metadata_store_url.starts_with("postgres://")
    {
        #[cfg(feature = "postgres")]
        {
            info!("Using PostgreSQL metadata store");
            builder.store(Arc::new(
                indexsync_metadata::PostgresCoordinationStore::new(&metadata_store_url).await?,
            ))
        }
        #[cfg(not(feature = "postgres"))]
        {
            error!("PostgreSQL URL provided but postgres feature not enabled");
            error!("Rebuild with: cargo build --features postgres");
            return Err("postgres feature not enabled".into());
        }
    } else {
        info!(path = %metadata_store_url, "Using SQLite metadata store");
        builder.store(Arc::new(
            SqliteCoordinationStore::new(&metadata_store_url).await?,
        ))
    };

    let agent = Arc::new(builder.build().await?);
    let shutdown = CancellationToken::new();

    #[cfg(feature = "metrics")]
    let metrics_handle = match std::env::var("METRICS_ADDR") {
        Ok(addr) => {
            let ready_agent = Arc::clone(&agent);
            let server = indexsync_agent::metrics_server::MetricsServer::new(
                addr.parse()?,
                Arc::new(move || ready_agent.status().draining().is_some()),
            );
            let token = shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = server.start(token).await {
                    error!(error = %e, "Metrics server failed");
                }
            }))
        }
        Err(_) => None,
    };

    agent.start().await?;
    info!(
        name = %agent.name(),
        agent_id = ?agent.agent_id(),
        "Agent is running"
    );

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, stopping agent");

    if let Err(e) = agent.stop().await {
        error!(error = %e, "Error during shutdown");
    }
    shutdown.cancel();

    #[cfg(feature = "metrics")]
    if let Some(handle) = metrics_handle {
        handle.await.ok();
    }

    Ok(())
}
