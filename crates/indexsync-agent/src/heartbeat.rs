//! Pulse Task - Membership Heartbeat and Rebalancing
//!
//! The pulse task runs in the background and, every `pulse_interval`:
//!
//! 1. Reads every membership row, ordered by id
//! 2. Deletes expired peers (any observer may; deletion is idempotent)
//! 3. Checks that its own row still exists (identity loss otherwise)
//! 4. Resolves its shard assignment from the rows
//! 5. Feeds the resolution to the rebalancing state machine
//! 6. Writes its own row: new expiration, state and assignment payload
//! 7. Publishes the resulting [`ProcessorStatus`] to the local consumer
//!
//! ## Failure Detection
//!
//! - An agent whose `expiration` is in the past is dead and gets pruned by
//!   the next peer that pulses
//! - If pulses keep failing until our own lease lapses, draining stops: a
//!   peer may already have pruned us and taken over our range
//! - If our row is gone, the agent stops draining, joins again with a new
//!   id and starts over from REBALANCING
//!
//! ## Example
//!
//! ```rust,no_run
//! use indexsync_agent::{AgentConfig, PulseTask};
//! use indexsync_metadata::SqliteCoordinationStore;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteCoordinationStore::new("coordination.db").await?);
//! let config = AgentConfig {
//!     name: "indexer-1".to_string(),
//!     ..AgentConfig::default()
//! };
//!
//! let pulse = Arc::new(PulseTask::new(Arc::new(config), store)?);
//! pulse.join().await?;
//!
//! let shutdown = CancellationToken::new();
//! let handle = tokio::spawn(Arc::clone(&pulse).run(shutdown.clone()));
//!
//! // Later: stop pulsing and leave the cluster
//! shutdown.cancel();
//! handle.await?;
//! pulse.leave().await;
//! # Ok(())
//! # }
//! ```

use crate::agent::AgentConfig;
use crate::error::{AgentError, Result};
use crate::metrics;
use crate::rebalancer::{EventProcessingStateMachine, Transition};
use crate::resolver::{self, ShardingMode};
use indexsync_core::shard::encode_assignment_payload;
use indexsync_core::ShardAssignment;
use indexsync_metadata::{Agent, AgentId, EventProcessingState, MembershipDirectory, NewAgent};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What the local consumer may do, published after every pulse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorStatus {
    /// Current membership id; `None` while not registered
    pub agent_id: Option<AgentId>,
    pub state: EventProcessingState,
    /// Committed assignment; `Some` only while RUNNING
    pub assignment: Option<ShardAssignment>,
}

impl ProcessorStatus {
    /// Shard that may be drained right now.
    pub fn draining(&self) -> Option<ShardAssignment> {
        match self.state {
            EventProcessingState::Running => self.assignment,
            _ => None,
        }
    }
}

impl Default for ProcessorStatus {
    fn default() -> Self {
        Self {
            agent_id: None,
            state: EventProcessingState::Rebalancing,
            assignment: None,
        }
    }
}

/// Summary of one successful pulse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulseReport {
    pub agent_id: AgentId,
    /// Live rows seen after pruning, self included
    pub members: usize,
    pub pruned: u64,
    pub transition: Transition,
    pub assignment: Option<ShardAssignment>,
}

struct PulseState {
    identity: Option<Agent>,
    machine: EventProcessingStateMachine,
}

/// Background task that keeps an agent's membership alive and decides
/// which shard it drains.
pub struct PulseTask {
    config: Arc<AgentConfig>,
    mode: ShardingMode,
    directory: Arc<dyn MembershipDirectory>,
    status_tx: watch::Sender<ProcessorStatus>,
    inner: Mutex<PulseState>,
    identity_changes: AtomicU64,
}

impl PulseTask {
    /// Create a pulse task; nothing is written until [`PulseTask::join`].
    pub fn new(config: Arc<AgentConfig>, directory: Arc<dyn MembershipDirectory>) -> Result<Self> {
        config.validate()?;
        let mode = config.sharding_mode()?;
        let (status_tx, _) = watch::channel(ProcessorStatus::default());

        Ok(Self {
            mode,
            directory,
            status_tx,
            inner: Mutex::new(PulseState {
                identity: None,
                machine: EventProcessingStateMachine::new(config.stabilization_reads),
            }),
            identity_changes: AtomicU64::new(0),
            config,
        })
    }

    /// Receiver of the status published after every pulse.
    pub fn subscribe(&self) -> watch::Receiver<ProcessorStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> ProcessorStatus {
        self.status_tx.borrow().clone()
    }

    pub fn agent_id(&self) -> Option<AgentId> {
        self.status_tx.borrow().agent_id
    }

    /// Number of times the agent lost its row and joined again.
    pub fn identity_changes(&self) -> u64 {
        self.identity_changes.load(Ordering::Relaxed)
    }

    /// Register this agent (state REBALANCING).
    ///
    /// # Errors
    ///
    /// - `AlreadyStarted`: the agent already has a row
    /// - `DescriptorMismatch`: static configuration conflicts with live peers;
    ///   no row is left behind
    pub async fn join(&self) -> Result<Agent> {
        let mut state = self.inner.lock().await;
        if state.identity.is_some() {
            return Err(AgentError::AlreadyStarted);
        }
        self.register(&mut state).await
    }

    /// Delete our own row (best effort, bounded by `leave_timeout`).
    ///
    /// Failures are logged; the row then expires on its own.
    pub async fn leave(&self) {
        let mut state = self.inner.lock().await;
        let Some(identity) = state.identity.take() else {
            return;
        };

        let ids = [identity.id];
        let delete = self.directory.delete_agents(&ids);
        match tokio::time::timeout(self.config.leave_timeout, delete).await {
            Ok(Ok(_)) => info!(
                agent_id = %identity.id,
                name = %self.config.name,
                "Left the cluster"
            ),
            Ok(Err(e)) => warn!(
                agent_id = %identity.id,
                error = %e,
                "Failed to delete own row on leave, it will expire"
            ),
            Err(_) => warn!(
                agent_id = %identity.id,
                timeout_ms = self.config.leave_timeout.as_millis() as u64,
                "Timed out deleting own row on leave, it will expire"
            ),
        }

        let transition = if state.machine.state() == EventProcessingState::Suspended {
            state.machine.suspend()
        } else {
            state.machine.reset()
        };
        self.publish(&state, transition);
    }

    /// Stop draining and keep the lease; excluded from assignment.
    pub async fn suspend(&self) -> Result<()> {
        let mut state = self.inner.lock().await;
        let transition = state.machine.suspend();
        self.publish(&state, transition);
        self.write_own_row(&mut state).await?;
        Ok(())
    }

    /// Leave SUSPENDED for REBALANCING.
    pub async fn resume(&self) -> Result<()> {
        let mut state = self.inner.lock().await;
        let transition = state.machine.resume();
        self.publish(&state, transition);
        self.write_own_row(&mut state).await?;
        Ok(())
    }

    /// Run one pulse.
    ///
    /// # Errors
    ///
    /// - `IdentityLost`: our row was gone; draining stopped and a new row was
    ///   created (or will be at the next pulse if that failed)
    /// - `DescriptorMismatch`: static configuration conflicts with peers; the
    ///   row was still renewed
    /// - `Metadata`: storage failure; nothing changed
    pub async fn pulse_once(&self) -> Result<PulseReport> {
        let mut state = self.inner.lock().await;

        if state.identity.is_none() {
            self.register(&mut state).await?;
        }
        let mut me = match state.identity.clone() {
            Some(identity) => identity,
            None => return Err(AgentError::NotStarted),
        };

        let now = current_timestamp_ms();
        let mut agents = self.directory.find_all_agents_order_by_id().await?;

        // Prune expired peers
        let expired: Vec<AgentId> = agents
            .iter()
            .filter(|agent| agent.id != me.id && agent.is_expired(now))
            .map(|agent| agent.id)
            .collect();
        let mut pruned = 0;
        if !expired.is_empty() {
            pruned = self.directory.delete_agents(&expired).await?;
            agents.retain(|agent| !expired.contains(&agent.id));
            metrics::PEERS_PRUNED_TOTAL
                .with_label_values(&[self.config.name.as_str()])
                .inc_by(pruned);
            info!(
                agent_id = %me.id,
                expired = ?expired,
                pruned,
                "Pruned expired peers"
            );
        }

        if !agents.iter().any(|agent| agent.id == me.id) {
            return Err(self.lose_identity(&mut state, me.id).await);
        }

        // Resolve with our local state, not the one last written
        me.state = state.machine.state();
        let (resolution, mismatch) = match resolver::resolve(self.mode, &agents, &me, now) {
            Ok(resolution) => (resolution, None),
            Err(e) => (None, Some(e)),
        };
        let transition = state.machine.observe(resolution);

        // Closing the gate never waits for the row write; opening it does
        let opens_gate = state.machine.assignment().is_some()
            && self.status_tx.borrow().draining() != state.machine.assignment();
        if !opens_gate {
            self.publish(&state, transition);
        }
        if !self.write_own_row(&mut state).await? {
            return Err(self.lose_identity(&mut state, me.id).await);
        }
        if opens_gate {
            self.publish(&state, transition);
        }
        metrics::PULSES_TOTAL
            .with_label_values(&[self.config.name.as_str()])
            .inc();

        if let Some(e) = mismatch {
            return Err(e);
        }

        Ok(PulseReport {
            agent_id: me.id,
            members: agents.len(),
            pruned,
            transition,
            assignment: state.machine.assignment(),
        })
    }

    /// Run the pulse loop until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            name = %self.config.name,
            agent_id = ?self.agent_id(),
            interval_ms = self.config.pulse_interval.as_millis() as u64,
            "Pulse task started"
        );

        let mut interval = tokio::time::interval(self.config.pulse_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut pulse_count: u64 = 0;
        let mut failure_count: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.pulse_once().await {
                Ok(report) => {
                    pulse_count += 1;
                    debug!(
                        agent_id = %report.agent_id,
                        members = report.members,
                        state = %report.transition.to,
                        assignment = ?report.assignment,
                        "Pulse completed"
                    );
                }
                Err(AgentError::IdentityLost(old_id)) => {
                    warn!(
                        old_agent_id = %old_id,
                        agent_id = ?self.agent_id(),
                        "Pulse detected identity loss"
                    );
                }
                Err(e) => {
                    failure_count += 1;
                    metrics::PULSE_FAILURES_TOTAL
                        .with_label_values(&[self.config.name.as_str()])
                        .inc();
                    if e.is_transient() {
                        warn!(name = %self.config.name, error = %e, failure_count, "Pulse failed");
                    } else {
                        error!(name = %self.config.name, error = %e, failure_count, "Pulse failed");
                    }
                    self.stop_if_lease_lapsed().await;
                }
            }
        }

        info!(
            name = %self.config.name,
            total_pulses = pulse_count,
            total_failures = failure_count,
            "Pulse task stopped"
        );
    }

    async fn register(&self, state: &mut PulseState) -> Result<Agent> {
        let now = current_timestamp_ms();
        let assignment = match self.mode {
            ShardingMode::Static(assignment) => Some(assignment),
            ShardingMode::Dynamic => None,
        };

        if let Some(assignment) = assignment {
            let agents = self.directory.find_all_agents_order_by_id().await?;
            resolver::validate_static(&agents, None, assignment, now)?;
        }

        let row = self
            .directory
            .create_agent(NewAgent {
                agent_type: self.mode.agent_type(),
                name: self.config.name.clone(),
                expiration: now + self.config.lease_duration.as_millis() as i64,
                state: state.machine.state(),
                total_shard_count: assignment.map(|a| a.total_shard_count),
                assigned_shard_index: assignment.map(|a| a.shard_index),
                payload: Some(encode_assignment_payload(None).to_vec()),
            })
            .await?;

        // Another static agent may have claimed the same index concurrently
        if let Some(assignment) = assignment {
            let agents = self.directory.find_all_agents_order_by_id().await?;
            if let Err(e) = resolver::validate_static(&agents, Some(row.id), assignment, now) {
                if let Err(delete_error) = self.directory.delete_agents(&[row.id]).await {
                    warn!(
                        agent_id = %row.id,
                        error = %delete_error,
                        "Failed to delete conflicting row, it will expire"
                    );
                }
                return Err(e);
            }
        }

        info!(
            agent_id = %row.id,
            name = %row.name,
            agent_type = %row.agent_type,
            expiration = row.expiration,
            "Joined the cluster"
        );

        state.identity = Some(row.clone());
        let current = state.machine.state();
        self.publish(
            state,
            Transition {
                from: current,
                to: current,
            },
        );
        Ok(row)
    }

    /// Renew our lease and persist state and assignment.
    ///
    /// Returns `false` if the row no longer exists.
    async fn write_own_row(&self, state: &mut PulseState) -> Result<bool> {
        let Some(mut row) = state.identity.clone() else {
            return Ok(true);
        };

        row.expiration = current_timestamp_ms() + self.config.lease_duration.as_millis() as i64;
        row.state = state.machine.state();
        row.payload = Some(encode_assignment_payload(state.machine.assignment()).to_vec());

        let updated = self.directory.update_agent(&row).await?;
        if updated {
            state.identity = Some(row);
        }
        Ok(updated)
    }

    async fn lose_identity(&self, state: &mut PulseState, old_id: AgentId) -> AgentError {
        error!(
            agent_id = %old_id,
            name = %self.config.name,
            "Own membership row is gone, stopping event processing and rejoining"
        );
        metrics::IDENTITY_LOSSES_TOTAL
            .with_label_values(&[self.config.name.as_str()])
            .inc();
        self.identity_changes.fetch_add(1, Ordering::Relaxed);

        state.identity = None;
        let transition = if state.machine.state() == EventProcessingState::Suspended {
            state.machine.suspend()
        } else {
            state.machine.reset()
        };
        self.publish(state, transition);

        if let Err(e) = self.register(state).await {
            warn!(
                old_agent_id = %old_id,
                error = %e,
                "Rejoin failed, retrying at next pulse"
            );
        }

        AgentError::IdentityLost(old_id)
    }

    async fn stop_if_lease_lapsed(&self) {
        let mut state = self.inner.lock().await;
        let lapsed = state
            .identity
            .as_ref()
            .is_some_and(|identity| identity.is_expired(current_timestamp_ms()));

        let draining = self.status_tx.borrow().draining().is_some()
            || state.machine.state() == EventProcessingState::Running;
        if lapsed && draining {
            warn!(
                name = %self.config.name,
                "Lease lapsed without a successful pulse, stopping event processing"
            );
            let transition = state.machine.reset();
            self.publish(&state, transition);
        }
    }

    fn publish(&self, state: &PulseState, transition: Transition) {
        let status = ProcessorStatus {
            agent_id: state.identity.as_ref().map(|identity| identity.id),
            state: state.machine.state(),
            assignment: state.machine.assignment(),
        };

        if transition.is_change() {
            info!(
                name = %self.config.name,
                agent_id = ?status.agent_id,
                from = %transition.from,
                to = %transition.to,
                assignment = ?status.assignment,
                "Event processing state changed"
            );
            metrics::STATE_TRANSITIONS_TOTAL
                .with_label_values(&[
                    self.config.name.as_str(),
                    transition.from.as_str(),
                    transition.to.as_str(),
                ])
                .inc();
        }
        metrics::record_status(&self.config.name, status.state, status.assignment);

        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

/// Get current timestamp in milliseconds since epoch
pub(crate) fn current_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use indexsync_metadata::{AgentType, MetadataError, SqliteCoordinationStore};
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn config(name: &str) -> AgentConfig {
        AgentConfig {
            name: name.to_string(),
            lease_duration: Duration::from_millis(500),
            pulse_interval: Duration::from_millis(50),
            stabilization_reads: 2,
            ..AgentConfig::default()
        }
    }

    async fn store() -> Arc<SqliteCoordinationStore> {
        Arc::new(SqliteCoordinationStore::new_in_memory().await.unwrap())
    }

    /// SQLite directory whose row renewals can be made to fail.
    struct FailingRenewals {
        inner: Arc<SqliteCoordinationStore>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl MembershipDirectory for FailingRenewals {
        async fn find_agent(&self, id: AgentId) -> indexsync_metadata::Result<Option<Agent>> {
            self.inner.find_agent(id).await
        }

        async fn find_all_agents_order_by_id(&self) -> indexsync_metadata::Result<Vec<Agent>> {
            self.inner.find_all_agents_order_by_id().await
        }

        async fn create_agent(&self, agent: NewAgent) -> indexsync_metadata::Result<Agent> {
            self.inner.create_agent(agent).await
        }

        async fn update_agent(&self, agent: &Agent) -> indexsync_metadata::Result<bool> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(MetadataError::InvalidRow("database is locked".to_string()));
            }
            self.inner.update_agent(agent).await
        }

        async fn delete_agents(&self, ids: &[AgentId]) -> indexsync_metadata::Result<u64> {
            self.inner.delete_agents(ids).await
        }
    }

    async fn running_on_failing_renewals() -> (PulseTask, Arc<FailingRenewals>) {
        let directory = Arc::new(FailingRenewals {
            inner: store().await,
            failing: AtomicBool::new(false),
        });
        let pulse = PulseTask::new(Arc::new(config("a")), directory.clone()).unwrap();
        pulse.join().await.unwrap();
        pulse.pulse_once().await.unwrap();
        pulse.pulse_once().await.unwrap();
        assert_eq!(pulse.status().draining(), ShardAssignment::new(0, 1));
        (pulse, directory)
    }

    #[tokio::test]
    async fn test_join_registers_rebalancing_row() {
        let store = store().await;
        let pulse = PulseTask::new(Arc::new(config("a")), store.clone()).unwrap();

        let row = pulse.join().await.unwrap();
        assert_eq!(row.state, EventProcessingState::Rebalancing);
        assert_eq!(pulse.agent_id(), Some(row.id));
        assert_eq!(store.find_agent(row.id).await.unwrap(), Some(row));

        assert!(matches!(pulse.join().await, Err(AgentError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_single_agent_runs_after_window() {
        let store = store().await;
        let pulse = PulseTask::new(Arc::new(config("a")), store.clone()).unwrap();
        let id = pulse.join().await.unwrap().id;

        let first = pulse.pulse_once().await.unwrap();
        assert_eq!(first.transition.to, EventProcessingState::Rebalancing);
        assert!(pulse.status().draining().is_none());

        let second = pulse.pulse_once().await.unwrap();
        assert_eq!(second.transition.to, EventProcessingState::Running);
        assert_eq!(pulse.status().draining(), ShardAssignment::new(0, 1));

        // Own row reflects state and assignment
        let row = store.find_agent(id).await.unwrap().unwrap();
        assert_eq!(row.state, EventProcessingState::Running);
        assert_eq!(
            indexsync_core::shard::decode_assignment_payload(&row.payload.unwrap()).unwrap(),
            ShardAssignment::new(0, 1)
        );
    }

    #[tokio::test]
    async fn test_identity_loss_rejoins_with_new_id() {
        let store = store().await;
        let pulse = PulseTask::new(Arc::new(config("a")), store.clone()).unwrap();
        let old_id = pulse.join().await.unwrap().id;
        pulse.pulse_once().await.unwrap();
        pulse.pulse_once().await.unwrap();
        assert_eq!(pulse.status().state, EventProcessingState::Running);

        // A peer pruned us
        store.delete_agents(&[old_id]).await.unwrap();

        let err = pulse.pulse_once().await.unwrap_err();
        assert!(matches!(err, AgentError::IdentityLost(id) if id == old_id));
        assert_eq!(pulse.identity_changes(), 1);

        let status = pulse.status();
        assert_eq!(status.state, EventProcessingState::Rebalancing);
        assert!(status.draining().is_none());
        let new_id = status.agent_id.unwrap();
        assert!(new_id > old_id);
        assert!(store.find_agent(new_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_membership_change_closes_gate_even_if_renewal_fails() {
        let (pulse, directory) = running_on_failing_renewals().await;

        directory
            .inner
            .create_agent(NewAgent {
                agent_type: AgentType::EventProcessingDynamicSharding,
                name: "b".to_string(),
                expiration: current_timestamp_ms() + 60_000,
                state: EventProcessingState::Rebalancing,
                total_shard_count: None,
                assigned_shard_index: None,
                payload: None,
            })
            .await
            .unwrap();
        directory.failing.store(true, Ordering::SeqCst);

        assert!(pulse.pulse_once().await.is_err());
        assert_eq!(pulse.status().state, EventProcessingState::Rebalancing);
        assert!(pulse.status().draining().is_none());
    }

    #[tokio::test]
    async fn test_lease_lapse_closes_gate_when_renewals_fail() {
        let (pulse, directory) = running_on_failing_renewals().await;
        directory.failing.store(true, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(pulse.pulse_once().await.is_err());
        pulse.stop_if_lease_lapsed().await;

        assert!(pulse.status().draining().is_none());
    }

    #[tokio::test]
    async fn test_identical_pulses_do_not_notify() {
        let store = store().await;
        let pulse = PulseTask::new(Arc::new(config("a")), store).unwrap();
        pulse.join().await.unwrap();
        pulse.pulse_once().await.unwrap();
        pulse.pulse_once().await.unwrap();

        let mut status = pulse.subscribe();
        status.borrow_and_update();
        for _ in 0..3 {
            pulse.pulse_once().await.unwrap();
        }
        assert!(!status.has_changed().unwrap());

        pulse.suspend().await.unwrap();
        assert!(status.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_suspend_persists_state() {
        let store = store().await;
        let pulse = PulseTask::new(Arc::new(config("a")), store.clone()).unwrap();
        let id = pulse.join().await.unwrap().id;
        pulse.pulse_once().await.unwrap();
        pulse.pulse_once().await.unwrap();

        pulse.suspend().await.unwrap();
        assert_eq!(pulse.status().state, EventProcessingState::Suspended);
        let row = store.find_agent(id).await.unwrap().unwrap();
        assert_eq!(row.state, EventProcessingState::Suspended);

        // Pulses keep the lease but do not drain
        let report = pulse.pulse_once().await.unwrap();
        assert!(report.assignment.is_none());

        pulse.resume().await.unwrap();
        pulse.pulse_once().await.unwrap();
        pulse.pulse_once().await.unwrap();
        assert_eq!(pulse.status().draining(), ShardAssignment::new(0, 1));
    }

    #[tokio::test]
    async fn test_leave_deletes_row() {
        let store = store().await;
        let pulse = PulseTask::new(Arc::new(config("a")), store.clone()).unwrap();
        pulse.join().await.unwrap();

        pulse.leave().await;
        assert!(store.find_all_agents_order_by_id().await.unwrap().is_empty());
        assert_eq!(pulse.status(), ProcessorStatus::default());

        // Leaving twice is harmless
        pulse.leave().await;
    }

    #[tokio::test]
    async fn test_run_loop_reaches_running() {
        let store = store().await;
        let pulse = Arc::new(PulseTask::new(Arc::new(config("a")), store).unwrap());
        pulse.join().await.unwrap();
        let mut status = pulse.subscribe();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&pulse).run(shutdown.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while status.borrow_and_update().draining().is_none() {
                status.changed().await.unwrap();
            }
        })
        .await
        .expect("agent should start draining");

        shutdown.cancel();
        handle.await.unwrap();
    }
}
