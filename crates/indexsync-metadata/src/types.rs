//! Metadata Type Definitions
//!
//! This module defines the rows stored in the two shared coordination tables.
//!
//! ## Types Overview
//!
//! ### Agent
//! One row per live process in the `agents` table. An agent is dead once
//! `now > expiration`; its `state` tells peers whether it counts toward
//! shard assignment.
//!
//! ### OutboxEvent
//! One row per pending indexing event in the `outbox_events` table. Events
//! are fetched by hash range (the shard key) in insertion order.
//!
//! ## Design Decisions
//!
//! - Timestamps are i64 (milliseconds since epoch), like the rest of the stack
//! - Enums are stored as upper-case text so rows stay readable in `psql`
//! - Agent ids are assigned by the database and never reused

use crate::error::{MetadataError, Result};
use indexsync_core::codec;
use indexsync_core::{entity_id_hash, IndexingQueueEventPayload, ShardAssignment};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Database-assigned agent identifier. Ordering by id is what makes cluster
/// descriptors identical across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgentId(pub i64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coordination role of an agent; peers of different types never share
/// shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentType {
    /// Shard count follows the number of live agents
    EventProcessingDynamicSharding,
    /// Shard count and index fixed by configuration
    EventProcessingStaticSharding,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::EventProcessingDynamicSharding => "EVENT_PROCESSING_DYNAMIC_SHARDING",
            AgentType::EventProcessingStaticSharding => "EVENT_PROCESSING_STATIC_SHARDING",
        }
    }
}

impl FromStr for AgentType {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "EVENT_PROCESSING_DYNAMIC_SHARDING" => Ok(AgentType::EventProcessingDynamicSharding),
            "EVENT_PROCESSING_STATIC_SHARDING" => Ok(AgentType::EventProcessingStaticSharding),
            other => Err(MetadataError::InvalidRow(format!("agent_type = {}", other))),
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event processing state published by each agent on its own row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventProcessingState {
    /// Draining the committed shard
    Running,
    /// Just joined, or reacting to a membership change; not draining
    Rebalancing,
    /// Administratively paused; keeps its lease, excluded from assignment
    Suspended,
}

impl EventProcessingState {
    /// States in which an agent counts as live for shard assignment
    pub const REBALANCING_OR_RUNNING: [EventProcessingState; 2] = [
        EventProcessingState::Rebalancing,
        EventProcessingState::Running,
    ];

    pub fn is_rebalancing_or_running(&self) -> bool {
        Self::REBALANCING_OR_RUNNING.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventProcessingState::Running => "RUNNING",
            EventProcessingState::Rebalancing => "REBALANCING",
            EventProcessingState::Suspended => "SUSPENDED",
        }
    }
}

impl FromStr for EventProcessingState {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RUNNING" => Ok(EventProcessingState::Running),
            "REBALANCING" => Ok(EventProcessingState::Rebalancing),
            "SUSPENDED" => Ok(EventProcessingState::Suspended),
            other => Err(MetadataError::InvalidRow(format!("state = {}", other))),
        }
    }
}

impl fmt::Display for EventProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the `agents` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub agent_type: AgentType,

    /// Human-readable, not unique
    pub name: String,

    /// Lease expiration (milliseconds since Unix epoch)
    pub expiration: i64,

    pub state: EventProcessingState,

    /// Static sharding only
    pub total_shard_count: Option<u32>,

    /// Static sharding only; `< total_shard_count`
    pub assigned_shard_index: Option<u32>,

    /// Role-specific opaque bytes (the assignment being drained)
    pub payload: Option<Vec<u8>>,
}

impl Agent {
    /// Dead once `now > expiration`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.expiration
    }

    /// Configured assignment of a statically-sharded agent.
    pub fn static_assignment(&self) -> Option<ShardAssignment> {
        match (self.assigned_shard_index, self.total_shard_count) {
            (Some(index), Some(total)) => ShardAssignment::new(index, total),
            _ => None,
        }
    }

    /// Check the row-level invariants before writing.
    pub fn validate(&self) -> Result<()> {
        validate_shards(self.total_shard_count, self.assigned_shard_index)
    }
}

/// Agent row to insert; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAgent {
    pub agent_type: AgentType,
    pub name: String,
    pub expiration: i64,
    pub state: EventProcessingState,
    pub total_shard_count: Option<u32>,
    pub assigned_shard_index: Option<u32>,
    pub payload: Option<Vec<u8>>,
}

impl NewAgent {
    pub fn validate(&self) -> Result<()> {
        validate_shards(self.total_shard_count, self.assigned_shard_index)
    }

    pub(crate) fn into_agent(self, id: AgentId) -> Agent {
        Agent {
            id,
            agent_type: self.agent_type,
            name: self.name,
            expiration: self.expiration,
            state: self.state,
            total_shard_count: self.total_shard_count,
            assigned_shard_index: self.assigned_shard_index,
            payload: self.payload,
        }
    }
}

fn validate_shards(total: Option<u32>, index: Option<u32>) -> Result<()> {
    if let (Some(total), Some(index)) = (total, index) {
        if index >= total {
            return Err(MetadataError::InvalidAgent(format!(
                "assigned_shard_index {} must be < total_shard_count {}",
                index, total
            )));
        }
    }
    Ok(())
}

/// Processing status of a queued event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutboxEventStatus {
    /// Waiting to be applied
    Pending,
    /// Poison: undecodable or out of attempts; kept for manual inspection
    Abandoned,
}

impl OutboxEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxEventStatus::Pending => "PENDING",
            OutboxEventStatus::Abandoned => "ABANDONED",
        }
    }
}

impl FromStr for OutboxEventStatus {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(OutboxEventStatus::Pending),
            "ABANDONED" => Ok(OutboxEventStatus::Abandoned),
            other => Err(MetadataError::InvalidRow(format!("status = {}", other))),
        }
    }
}

/// A row of the `outbox_events` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Insertion order
    pub id: i64,
    pub entity_name: String,
    pub entity_id: String,
    /// Shard key, see [`indexsync_core::entity_id_hash`]
    pub entity_id_hash: u32,
    /// Encoded [`IndexingQueueEventPayload`]
    pub payload: Vec<u8>,
    pub status: OutboxEventStatus,
    /// Failed apply attempts so far
    pub attempts: u32,
    /// Not fetched before this instant (milliseconds since Unix epoch)
    pub process_after: i64,
    pub created_at: i64,
}

/// Event appended by the dirtiness/routing producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOutboxEvent {
    pub entity_name: String,
    pub entity_id: String,
    pub entity_id_hash: u32,
    pub payload: Vec<u8>,
    pub process_after: i64,
}

impl NewOutboxEvent {
    /// Hash the entity id and encode the payload.
    pub fn new(
        entity_name: impl Into<String>,
        entity_id: impl Into<String>,
        payload: &IndexingQueueEventPayload,
    ) -> Self {
        let entity_id = entity_id.into();
        Self {
            entity_name: entity_name.into(),
            entity_id_hash: entity_id_hash(&entity_id),
            entity_id,
            payload: codec::encode(payload).to_vec(),
            process_after: 0,
        }
    }

    /// Event with raw payload bytes (already encoded, or deliberately not)
    pub fn with_raw_payload(
        entity_name: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        let entity_id = entity_id.into();
        Self {
            entity_name: entity_name.into(),
            entity_id_hash: entity_id_hash(&entity_id),
            entity_id,
            payload,
            process_after: 0,
        }
    }
}

/// Event to reschedule after a failed apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryEvent {
    pub id: i64,
    pub process_after: i64,
}

/// Result of one consumer batch, written back in a single transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Applied successfully; deleted
    pub processed: Vec<i64>,
    /// Failed to apply; attempts incremented and rescheduled
    pub retried: Vec<RetryEvent>,
    /// Poison; marked abandoned, never fetched again
    pub abandoned: Vec<i64>,
}

impl BatchOutcome {
    pub fn is_empty(&self) -> bool {
        self.processed.is_empty() && self.retried.is_empty() && self.abandoned.is_empty()
    }
}
