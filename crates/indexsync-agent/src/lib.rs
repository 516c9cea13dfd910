//! IndexSync Agent - Database-Polling Cluster Coordination
//!
//! This crate lets several indexing nodes split one outbox queue of indexing
//! events without talking to each other: every coordination decision is
//! derived from rows in a shared database.
//!
//! ## Architecture
//!
//! Agents are **stateless**. Each one owns a row in the membership table and
//! renews it every pulse. From the rows it reads, each agent derives the same
//! ordered cluster descriptor and takes the shard matching its position. A
//! shard is a contiguous range of entity-id hashes.
//!
//! ## Components
//!
//! - **Agent**: Main agent struct with lifecycle management
//! - **PulseTask**: Membership heartbeat, pruning and rebalancing
//! - **EventProcessingStateMachine**: REBALANCING / RUNNING / SUSPENDED
//! - **resolver**: Pure membership-to-assignment functions
//! - **OutboxConsumer**: Drains the committed shard
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use indexsync_agent::{Agent, FnHandler};
//! use indexsync_metadata::SqliteCoordinationStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteCoordinationStore::new("coordination.db").await?);
//!
//! let agent = Agent::builder()
//!     .name("indexer-1")
//!     .store(store)
//!     .handler(Arc::new(FnHandler::new(|_event, _payload| Ok(()))))
//!     .build()
//!     .await?;
//!
//! // Join the cluster and start draining once stable
//! agent.start().await?;
//!
//! // ... run ...
//!
//! // Graceful shutdown (finishes the batch, deletes the membership row)
//! agent.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod consumer;
pub mod error;
pub mod heartbeat;
pub mod metrics;
#[cfg(feature = "metrics")]
pub mod metrics_server;
pub mod rebalancer;
pub mod resolver;

pub use agent::{Agent, AgentBuilder, AgentConfig};
pub use consumer::{BatchStats, FnHandler, IndexingEventHandler, OutboxConsumer};
pub use error::{AgentError, Result};
pub use heartbeat::{ProcessorStatus, PulseReport, PulseTask};
pub use rebalancer::{EventProcessingStateMachine, Transition, DEFAULT_STABILIZATION_READS};
pub use resolver::{ClusterDescriptor, Resolution, ShardingMode};
