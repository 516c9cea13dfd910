//! IndexSync Metadata Store
//!
//! This crate implements the two shared tables through which IndexSync
//! processes coordinate: the membership directory (`agents`) and the event
//! queue (`outbox_events`).
//!
//! ## Purpose
//!
//! There is no coordinator. Each process:
//! - **Registers** itself as a row of `agents` and renews its lease by polling
//! - **Reads** every row to derive the same cluster descriptor as its peers
//! - **Drains** the events of `outbox_events` whose entity hash it owns
//!
//! Everything is done with ordinary single-statement reads and writes, so any
//! relational database that can hold the two tables works.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌────────────┐
//! │  Agent 1   │   │  Agent 2   │   │  Agent 3   │
//! └─────┬──────┘   └─────┬──────┘   └─────┬──────┘
//!       │ pulse / drain  │                │
//!       └────────────────┼────────────────┘
//!                        ▼
//!              ┌───────────────────┐
//!              │  agents           │ ◄── MembershipDirectory
//!              │  outbox_events    │ ◄── OutboxStore
//!              │ (SQLite/Postgres) │
//!              └───────────────────┘
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use indexsync_metadata::{SqliteCoordinationStore, MembershipDirectory, NewAgent};
//!
//! let store = SqliteCoordinationStore::new("coordination.db").await?;
//!
//! let agent = store.create_agent(NewAgent {
//!     agent_type: AgentType::EventProcessingDynamicSharding,
//!     name: "indexer-1".to_string(),
//!     expiration: now_ms() + 30_000,
//!     state: EventProcessingState::Rebalancing,
//!     total_shard_count: None,
//!     assigned_shard_index: None,
//!     payload: None,
//! }).await?;
//!
//! let members = store.find_all_agents_order_by_id().await?;
//! ```
//!
//! ## Implementation Details
//!
//! - Timestamps are i64 (milliseconds since epoch)
//! - Runtime queries (`sqlx::query`) with bound parameters, no compile-time
//!   DATABASE_URL needed
//! - Each trait method is a single transaction; no row locks are taken
//! - Schema created by `sqlx::migrate!` on startup

pub mod error;
pub mod store;
pub mod types;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use error::{MetadataError, Result};
pub use store::SqliteCoordinationStore;
pub use types::*;

#[cfg(feature = "postgres")]
pub use postgres::PostgresCoordinationStore;

use async_trait::async_trait;
use indexsync_core::HashRange;

/// Directory of live agents, shared by every process of the cluster.
///
/// ## Ownership Rules
///
/// - An agent only ever updates its own row
/// - Other rows are only deleted, and only once expired
/// - Ids are assigned by the store and never reused
///
/// ## Thread Safety
///
/// All implementations must be Send + Sync, allowing safe sharing across async tasks
/// via `Arc<dyn MembershipDirectory>`.
#[async_trait]
pub trait MembershipDirectory: Send + Sync {
    /// Get one agent row, expired or not.
    async fn find_agent(&self, id: AgentId) -> Result<Option<Agent>>;

    /// Get every agent row, expired or not, ordered by id.
    ///
    /// The ordering is what makes cluster descriptors derived by different
    /// processes identical.
    async fn find_all_agents_order_by_id(&self) -> Result<Vec<Agent>>;

    /// Insert a new agent row.
    ///
    /// # Returns
    ///
    /// The stored row, carrying the id assigned by the database.
    ///
    /// # Errors
    ///
    /// - `InvalidAgent`: `assigned_shard_index >= total_shard_count`
    /// - `DatabaseError`: Database operation failed
    async fn create_agent(&self, agent: NewAgent) -> Result<Agent>;

    /// Overwrite the mutable columns (expiration, state, payload) of an
    /// existing row.
    ///
    /// # Returns
    ///
    /// - `Ok(true)` if the row was updated
    /// - `Ok(false)` if the row no longer exists (it was pruned by a peer)
    async fn update_agent(&self, agent: &Agent) -> Result<bool>;

    /// Delete agent rows.
    ///
    /// Missing ids are ignored, so concurrent pruning of the same expired
    /// peer by several observers is harmless.
    ///
    /// # Returns
    ///
    /// Number of rows actually deleted.
    async fn delete_agents(&self, ids: &[AgentId]) -> Result<u64>;
}

/// Queue of pending indexing events.
///
/// Delivery is at-least-once: an event is only deleted by
/// [`OutboxStore::acknowledge`] after it was applied, so a consumer crash
/// between fetch and acknowledgement makes the next owner of the range
/// apply it again.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append events produced by the dirtiness/routing computation.
    ///
    /// # Returns
    ///
    /// The ids assigned to the new events, in input order.
    async fn append_events(&self, events: Vec<NewOutboxEvent>) -> Result<Vec<i64>>;

    /// Fetch pending events whose entity hash is in `range` and whose
    /// `process_after <= now_ms`, oldest first.
    async fn fetch_events(&self, range: HashRange, now_ms: i64, limit: usize)
        -> Result<Vec<OutboxEvent>>;

    /// Write back the outcome of a batch in one transaction: delete processed
    /// events, reschedule retried ones and mark abandoned ones.
    async fn acknowledge(&self, outcome: &BatchOutcome) -> Result<()>;

    /// Number of pending events (all ranges, scheduled or not).
    async fn count_pending_events(&self) -> Result<u64>;

    /// Abandoned events, oldest first, for manual inspection.
    async fn find_abandoned_events(&self, limit: usize) -> Result<Vec<OutboxEvent>>;

    /// Put abandoned events back in the queue with their attempts reset.
    ///
    /// # Returns
    ///
    /// Number of events requeued.
    async fn retry_abandoned_events(&self, ids: &[i64]) -> Result<u64>;
}

/// Both coordination tables behind one handle.
pub trait CoordinationStore: MembershipDirectory + OutboxStore {}

impl<T: MembershipDirectory + OutboxStore> CoordinationStore for T {}
