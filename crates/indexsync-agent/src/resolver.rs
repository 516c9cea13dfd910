//! Cluster Descriptor Resolver
//!
//! Turns the membership rows read at a pulse into this agent's shard
//! assignment. Every function here is pure: agents that read the same rows
//! derive the same descriptor, which is what lets them split the event
//! queue without talking to each other.
//!
//! ## Dynamic Sharding
//!
//! Members are the live agents of the same type whose state is `REBALANCING`
//! or `RUNNING`, ordered by id. The shard count is the member count and this
//! agent's shard index is its position:
//!
//! ```text
//! rows:        [#3 RUNNING] [#5 SUSPENDED] [#7 REBALANCING] [#9 expired]
//! descriptor:  [#3, #7]
//! #7 drains:   shard 1/2 = hashes [2^31, 2^32)
//! ```
//!
//! ## Static Sharding
//!
//! The assignment comes from configuration. Live static peers are only used
//! to check that the configuration is consistent: same total everywhere and
//! no index claimed twice. When two agents claim the same index, the one
//! with the lower id keeps it.

use crate::error::{AgentError, Result};
use indexsync_core::ShardAssignment;
use indexsync_metadata::{Agent, AgentId, AgentType};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Ordered list of the agents sharing the event stream; position is shard
/// index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    members: Vec<AgentId>,
}

impl ClusterDescriptor {
    /// Members are sorted and deduplicated.
    pub fn new(mut members: Vec<AgentId>) -> Self {
        members.sort_unstable();
        members.dedup();
        Self { members }
    }

    pub fn members(&self) -> &[AgentId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn position(&self, id: AgentId) -> Option<usize> {
        self.members.binary_search(&id).ok()
    }

    /// Assignment of `id`, if it is a member.
    pub fn assignment_of(&self, id: AgentId) -> Option<ShardAssignment> {
        let index = u32::try_from(self.position(id)?).ok()?;
        let total = u32::try_from(self.len()).ok()?;
        ShardAssignment::new(index, total)
    }
}

/// Outcome of one resolution: what this agent should drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// `None` for statically-sharded agents
    pub descriptor: Option<ClusterDescriptor>,
    pub assignment: ShardAssignment,
}

/// How an agent obtains its shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardingMode {
    Dynamic,
    Static(ShardAssignment),
}

impl ShardingMode {
    pub fn agent_type(&self) -> AgentType {
        match self {
            ShardingMode::Dynamic => AgentType::EventProcessingDynamicSharding,
            ShardingMode::Static(_) => AgentType::EventProcessingStaticSharding,
        }
    }
}

/// Resolve the assignment of `me` against the rows read at this pulse.
///
/// `me` carries this agent's id, type and *local* state; its row in `agents`
/// (if any) is ignored in favor of it.
///
/// # Returns
///
/// - `Ok(None)` if the agent has no shard (e.g. suspended)
/// - `Err(DescriptorMismatch)` if a static configuration conflicts with peers
pub fn resolve(
    mode: ShardingMode,
    agents: &[Agent],
    me: &Agent,
    now_ms: i64,
) -> Result<Option<Resolution>> {
    match mode {
        ShardingMode::Dynamic => Ok(resolve_dynamic(agents, me, now_ms)),
        ShardingMode::Static(assignment) => {
            validate_static(agents, Some(me.id), assignment, now_ms)?;
            if !me.state.is_rebalancing_or_running() {
                return Ok(None);
            }
            Ok(Some(Resolution {
                descriptor: None,
                assignment,
            }))
        }
    }
}

/// Descriptor of the live dynamic members, `me` included according to its
/// local state.
pub fn dynamic_descriptor(agents: &[Agent], me: &Agent, now_ms: i64) -> ClusterDescriptor {
    let mut members: Vec<AgentId> = agents
        .iter()
        .filter(|agent| agent.id != me.id)
        .filter(|agent| agent.agent_type == me.agent_type)
        .filter(|agent| !agent.is_expired(now_ms))
        .filter(|agent| agent.state.is_rebalancing_or_running())
        .map(|agent| agent.id)
        .collect();

    if me.state.is_rebalancing_or_running() {
        members.push(me.id);
    }

    ClusterDescriptor::new(members)
}

/// Dynamic resolution: position of `me` in the descriptor.
pub fn resolve_dynamic(agents: &[Agent], me: &Agent, now_ms: i64) -> Option<Resolution> {
    let descriptor = dynamic_descriptor(agents, me, now_ms);
    let assignment = descriptor.assignment_of(me.id)?;

    debug!(
        agent_id = %me.id,
        members = ?descriptor.members(),
        assignment = %assignment,
        "Resolved dynamic descriptor"
    );

    Some(Resolution {
        descriptor: Some(descriptor),
        assignment,
    })
}

/// Check a static assignment against the live static peers.
///
/// `me` is `None` before the agent has a row; any peer already claiming the
/// index then wins.
pub fn validate_static(
    agents: &[Agent],
    me: Option<AgentId>,
    assignment: ShardAssignment,
    now_ms: i64,
) -> Result<()> {
    let peers = agents
        .iter()
        .filter(|agent| Some(agent.id) != me)
        .filter(|agent| agent.agent_type == AgentType::EventProcessingStaticSharding)
        .filter(|agent| !agent.is_expired(now_ms));

    for peer in peers {
        let theirs = peer.static_assignment().ok_or_else(|| {
            AgentError::DescriptorMismatch(format!(
                "static agent {} ({}) has no valid shard assignment",
                peer.id, peer.name
            ))
        })?;

        if theirs.total_shard_count != assignment.total_shard_count {
            return Err(AgentError::DescriptorMismatch(format!(
                "total_shard_count {} disagrees with agent {} ({}) which uses {}",
                assignment.total_shard_count, peer.id, peer.name, theirs.total_shard_count
            )));
        }

        let peer_wins = match me {
            Some(me) => peer.id < me,
            None => true,
        };
        if theirs.shard_index == assignment.shard_index && peer_wins {
            return Err(AgentError::DescriptorMismatch(format!(
                "shard {} is already claimed by agent {} ({})",
                assignment, peer.id, peer.name
            )));
        }
    }

    Ok(())
}
