//! Simple Agent Example
//!
//! Starts two agents against one SQLite file, queues a few indexing events
//! and watches the agents split and drain them.
//!
//! Run with: cargo run --example simple_agent

use indexsync_agent::{Agent, FnHandler};
use indexsync_core::{
    DirtinessDescriptor, DocumentRouteDescriptor, DocumentRoutesDescriptor,
    IndexingQueueEventPayload,
};
use indexsync_metadata::{MembershipDirectory, NewOutboxEvent, OutboxStore, SqliteCoordinationStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting IndexSync agent example");

    // Setup coordination store (SQLite for demo)
    let store = Arc::new(SqliteCoordinationStore::new("/tmp/indexsync_agent_example.db").await?);

    let mut agents = Vec::new();
    for name in ["indexer-1", "indexer-2"] {
        let agent = Agent::builder()
            .name(name)
            .lease_duration(Duration::from_secs(5))
            .pulse_interval(Duration::from_millis(500)) // Fast pulses for demo
            .store(Arc::clone(&store))
            .handler(Arc::new(FnHandler::new(move |event, payload| {
                info!(
                    agent = name,
                    entity_id = %event.entity_id,
                    routing_key = ?payload.routes.current_route.routing_key,
                    "Reindexing"
                );
                Ok(())
            })))
            .build()
            .await?;
        agent.start().await?;
        agents.push(agent);
    }

    let members = store.find_all_agents_order_by_id().await?;
    info!("Registered agents: {}", members.len());
    for member in members {
        info!("  - {} ({}) {}", member.id, member.name, member.state);
    }

    // Queue some events
    let events = (0..20)
        .map(|i| {
            let payload = IndexingQueueEventPayload::new(
                DocumentRoutesDescriptor::new(
                    DocumentRouteDescriptor::of(format!("tenant-{}", i % 2)),
                    vec![],
                ),
                Some(DirtinessDescriptor::from_paths(["title"])),
            );
            NewOutboxEvent::new("Book", format!("book-{}", i), &payload)
        })
        .collect();
    store.append_events(events).await?;

    // Run for a while
    info!("Running for 10 seconds...");
    tokio::time::sleep(Duration::from_secs(10)).await;
    info!("Pending events: {}", store.count_pending_events().await?);

    // Graceful shutdown
    for agent in &agents {
        info!("Stopping {}...", agent.name());
        agent.stop().await?;
    }

    let members = store.find_all_agents_order_by_id().await?;
    info!("Agents after shutdown: {}", members.len());

    Ok(())
}
