//! Agent - Core Lifecycle and Configuration
//!
//! The Agent ties an indexing node into the cluster. It manages:
//! - Membership (join, pulse, leave) through the [`PulseTask`]
//! - Rebalancing between REBALANCING, RUNNING and SUSPENDED
//! - Draining its shard of the outbox through the [`OutboxConsumer`]
//!
//! ## Lifecycle
//!
//! 1. **Build**: Configure agent (name, sharding mode, timings, store, handler)
//! 2. **Start**: Join the membership table, start the pulse and consumer tasks
//! 3. **Run**: Pulse, rebalance, drain the committed shard
//! 4. **Stop**: Finish the current batch, stop pulsing, delete own row
//!
//! ## Example
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
//!     .handler(Arc::new(FnHandler::new(|event, _payload| {
//!         println!("reindex {} {}", event.entity_name, event.entity_id);
//!         Ok(())
//!     })))
//!     .build()
//!     .await?;
//!
//! agent.start().await?;
//! // ... drain events ...
//! agent.stop().await?;
//! # Ok(())
//! # }
//! ```

use crate::consumer::{IndexingEventHandler, OutboxConsumer};
use crate::error::{AgentError, Result};
use crate::heartbeat::{ProcessorStatus, PulseTask};
use crate::metrics;
use crate::rebalancer::DEFAULT_STABILIZATION_READS;
use crate::resolver::ShardingMode;
use indexsync_core::ShardAssignment;
use indexsync_metadata::{AgentId, AgentType, CoordinationStore, MembershipDirectory, OutboxStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Agent configuration.
///
/// Use `AgentBuilder` for ergonomic construction with defaults.
///
/// # Timing
///
/// `pulse_interval` must be well below `lease_duration`: an agent that misses
/// pulses for a whole lease is considered dead and pruned by its peers.
///
/// # Examples
///
/// ```
/// use indexsync_agent::AgentConfig;
/// use indexsync_metadata::AgentType;
/// use std::time::Duration;
///
/// let config = AgentConfig {
///     name: "indexer-2".to_string(),
///     agent_type: AgentType::EventProcessingStaticSharding,
///     total_shard_count: Some(4),
///     assigned_shard_index: Some(2),
///     lease_duration: Duration::from_secs(10),
///     pulse_interval: Duration::from_secs(1),
///     ..AgentConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Human-readable name stored in the membership row (e.g., "indexer-1")
    pub name: String,

    /// Dynamic or static sharding
    pub agent_type: AgentType,

    /// How long a row stays alive without a pulse (default: 30s)
    pub lease_duration: Duration,

    /// Time between pulses (default: 2s)
    pub pulse_interval: Duration,

    /// Identical consecutive reads before draining (default: 2)
    pub stabilization_reads: u32,

    /// Events fetched per batch (default: 50)
    pub batch_size: usize,

    /// Delay before polling again after an empty batch (default: 1s)
    pub polling_interval: Duration,

    /// Upper bound of the idle backoff (default: 10s)
    pub max_polling_interval: Duration,

    /// Delay before a failed event becomes visible again (default: 5s)
    pub retry_delay: Duration,

    /// Attempts before an event is abandoned (default: 3)
    pub max_attempts: u32,

    /// Bound on the own-row deletion at shutdown (default: 5s)
    pub leave_timeout: Duration,

    /// Static sharding only
    pub total_shard_count: Option<u32>,

    /// Static sharding only
    pub assigned_shard_index: Option<u32>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "indexsync-agent".to_string(),
            agent_type: AgentType::EventProcessingDynamicSharding,
            lease_duration: Duration::from_secs(30),
            pulse_interval: Duration::from_secs(2),
            stabilization_reads: DEFAULT_STABILIZATION_READS,
            batch_size: 50,
            polling_interval: Duration::from_secs(1),
            max_polling_interval: Duration::from_secs(10),
            retry_delay: Duration::from_secs(5),
            max_attempts: 3,
            leave_timeout: Duration::from_secs(5),
            total_shard_count: None,
            assigned_shard_index: None,
        }
    }
}

impl AgentConfig {
    /// Check the configuration before anything is written.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AgentError::Config("name must not be empty".to_string()));
        }
        if self.pulse_interval.is_zero() {
            return Err(AgentError::Config("pulse_interval must be positive".to_string()));
        }
        if self.pulse_interval >= self.lease_duration {
            return Err(AgentError::Config(format!(
                "pulse_interval ({:?}) must be shorter than lease_duration ({:?})",
                self.pulse_interval, self.lease_duration
            )));
        }
        if self.stabilization_reads == 0 {
            return Err(AgentError::Config(
                "stabilization_reads must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(AgentError::Config("batch_size must be at least 1".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(AgentError::Config("max_attempts must be at least 1".to_string()));
        }
        if self.polling_interval > self.max_polling_interval {
            return Err(AgentError::Config(format!(
                "polling_interval ({:?}) exceeds max_polling_interval ({:?})",
                self.polling_interval, self.max_polling_interval
            )));
        }
        self.sharding_mode()?;
        Ok(())
    }

    /// Sharding mode derived from `agent_type` and the static fields.
    pub fn sharding_mode(&self) -> Result<ShardingMode> {
        match self.agent_type {
            AgentType::EventProcessingDynamicSharding => {
                if self.total_shard_count.is_some() || self.assigned_shard_index.is_some() {
                    return Err(AgentError::Config(
                        "dynamic sharding does not take total_shard_count or assigned_shard_index"
                            .to_string(),
                    ));
                }
                Ok(ShardingMode::Dynamic)
            }
            AgentType::EventProcessingStaticSharding => {
                let (Some(total), Some(index)) =
                    (self.total_shard_count, self.assigned_shard_index)
                else {
                    return Err(AgentError::Config(
                        "static sharding requires total_shard_count and assigned_shard_index"
                            .to_string(),
                    ));
                };
                ShardAssignment::new(index, total)
                    .map(ShardingMode::Static)
                    .ok_or_else(|| {
                        AgentError::Config(format!(
                            "assigned_shard_index {} is out of range for total_shard_count {}",
                            index, total
                        ))
                    })
            }
        }
    }
}

/// Main agent struct - manages lifecycle and coordination.
///
/// # Thread Safety
///
/// Agent is Send + Sync and can be shared via `Arc<Agent>`.
pub struct Agent {
    config: Arc<AgentConfig>,

    outbox: Arc<dyn OutboxStore>,

    handler: Arc<dyn IndexingEventHandler>,

    /// Membership and rebalancing, shared with its background task
    pulse: Arc<PulseTask>,

    /// Agent state (Created, Started, or Stopped)
    state: RwLock<AgentState>,

    /// Background tasks, present while started
    tasks: RwLock<Option<BackgroundTasks>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentState {
    Created,
    Started,
    Stopped,
}

struct BackgroundTasks {
    shutdown: CancellationToken,
    pulse: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

impl Agent {
    /// Create a new agent builder.
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    /// Start the agent (join, begin pulsing, begin draining).
    ///
    /// # Errors
    ///
    /// - `AlreadyStarted`: Agent is already running
    /// - `DescriptorMismatch`: static assignment conflicts with live peers
    /// - `Metadata`: Failed to register in the membership table
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;

        if *state == AgentState::Started {
            return Err(AgentError::AlreadyStarted);
        }

        info!(
            name = %self.config.name,
            agent_type = %self.config.agent_type,
            lease_ms = self.config.lease_duration.as_millis() as u64,
            pulse_ms = self.config.pulse_interval.as_millis() as u64,
            "Starting IndexSync agent"
        );

        let row = self.pulse.join().await?;

        let shutdown = CancellationToken::new();
        let pulse = tokio::spawn(Arc::clone(&self.pulse).run(shutdown.child_token()));

        let consumer = OutboxConsumer::new(
            Arc::clone(&self.config),
            Arc::clone(&self.outbox),
            Arc::clone(&self.handler),
            self.pulse.subscribe(),
        );
        let consumer = tokio::spawn(consumer.run(shutdown.child_token()));

        *self.tasks.write().await = Some(BackgroundTasks {
            shutdown,
            pulse,
            consumer,
        });
        *state = AgentState::Started;

        info!(
            agent_id = %row.id,
            name = %self.config.name,
            "Agent started successfully"
        );

        Ok(())
    }

    /// Stop the agent: finish the current batch, stop pulsing, delete own row.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;

        if *state != AgentState::Started {
            warn!(name = %self.config.name, "Agent not started, skipping stop");
            return Ok(());
        }

        info!(
            name = %self.config.name,
            agent_id = ?self.agent_id(),
            "Stopping agent gracefully"
        );

        let tasks = self.tasks.write().await.take();
        if let Some(tasks) = tasks {
            tasks.shutdown.cancel();

            // Consumer first: no event may be applied after the row is gone
            if let Err(e) = tasks.consumer.await {
                warn!(name = %self.config.name, error = %e, "Consumer task ended abnormally");
            }
            if let Err(e) = tasks.pulse.await {
                warn!(name = %self.config.name, error = %e, "Pulse task ended abnormally");
            }
        }

        self.pulse.leave().await;
        *state = AgentState::Stopped;

        info!(name = %self.config.name, "Agent stopped successfully");

        Ok(())
    }

    /// Stop draining but keep the membership lease.
    pub async fn suspend(&self) -> Result<()> {
        self.ensure_started().await?;
        self.pulse.suspend().await
    }

    /// Leave SUSPENDED; draining starts again after stabilization.
    pub async fn resume(&self) -> Result<()> {
        self.ensure_started().await?;
        self.pulse.resume().await
    }

    /// Wait until the agent drains a shard, or `timeout` elapses.
    pub async fn wait_until_running(&self, timeout: Duration) -> Option<ShardAssignment> {
        let mut status = self.pulse.subscribe();
        tokio::time::timeout(timeout, async move {
            loop {
                if let Some(assignment) = status.borrow_and_update().draining() {
                    return Some(assignment);
                }
                if status.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Agent name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Current membership id, `None` while not registered
    pub fn agent_id(&self) -> Option<AgentId> {
        self.pulse.agent_id()
    }

    pub fn status(&self) -> ProcessorStatus {
        self.pulse.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessorStatus> {
        self.pulse.subscribe()
    }

    /// Number of times the agent lost its row and joined again
    pub fn identity_changes(&self) -> u64 {
        self.pulse.identity_changes()
    }

    /// Check if agent is started
    pub async fn is_started(&self) -> bool {
        *self.state.read().await == AgentState::Started
    }

    async fn ensure_started(&self) -> Result<()> {
        if self.is_started().await {
            Ok(())
        } else {
            Err(AgentError::NotStarted)
        }
    }
}

/// Builder for Agent
pub struct AgentBuilder {
    config: AgentConfig,
    directory: Option<Arc<dyn MembershipDirectory>>,
    outbox: Option<Arc<dyn OutboxStore>>,
    handler: Option<Arc<dyn IndexingEventHandler>>,
}

impl AgentBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            config: AgentConfig::default(),
            directory: None,
            outbox: None,
            handler: None,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Set agent name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Use a fixed shard instead of dynamic sharding
    pub fn static_sharding(mut self, assigned_shard_index: u32, total_shard_count: u32) -> Self {
        self.config.agent_type = AgentType::EventProcessingStaticSharding;
        self.config.assigned_shard_index = Some(assigned_shard_index);
        self.config.total_shard_count = Some(total_shard_count);
        self
    }

    /// Set lease duration
    pub fn lease_duration(mut self, duration: Duration) -> Self {
        self.config.lease_duration = duration;
        self
    }

    /// Set pulse interval
    pub fn pulse_interval(mut self, interval: Duration) -> Self {
        self.config.pulse_interval = interval;
        self
    }

    pub fn stabilization_reads(mut self, reads: u32) -> Self {
        self.config.stabilization_reads = reads;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Set idle polling interval and its backoff cap
    pub fn polling_interval(mut self, interval: Duration, max: Duration) -> Self {
        self.config.polling_interval = interval;
        self.config.max_polling_interval = max;
        self
    }

    /// Set retry policy for failed events
    pub fn retry_policy(mut self, retry_delay: Duration, max_attempts: u32) -> Self {
        self.config.retry_delay = retry_delay;
        self.config.max_attempts = max_attempts;
        self
    }

    pub fn leave_timeout(mut self, timeout: Duration) -> Self {
        self.config.leave_timeout = timeout;
        self
    }

    /// Use one store for membership and outbox
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: CoordinationStore + 'static,
    {
        self.directory = Some(store.clone());
        self.outbox = Some(store);
        self
    }

    /// Set membership directory
    pub fn directory(mut self, directory: Arc<dyn MembershipDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Set outbox store
    pub fn outbox(mut self, outbox: Arc<dyn OutboxStore>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Set the callback applying events
    pub fn handler(mut self, handler: Arc<dyn IndexingEventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Build the agent
    pub async fn build(self) -> Result<Agent> {
        self.config.validate()?;

        let directory = self
            .directory
            .ok_or_else(|| AgentError::Config("membership directory is required".to_string()))?;
        let outbox = self
            .outbox
            .ok_or_else(|| AgentError::Config("outbox store is required".to_string()))?;
        let handler = self
            .handler
            .ok_or_else(|| AgentError::Config("event handler is required".to_string()))?;

        metrics::init();

        let config = Arc::new(self.config);
        let pulse = Arc::new(PulseTask::new(Arc::clone(&config), directory)?);

        Ok(Agent {
            config,
            outbox,
            handler,
            pulse,
            state: RwLock::new(AgentState::Created),
            tasks: RwLock::new(None),
        })
    }
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::FnHandler;
    use indexsync_metadata::{EventProcessingState, SqliteCoordinationStore};

    fn noop_handler() -> Arc<dyn IndexingEventHandler> {
        Arc::new(FnHandler::new(|_, _| Ok(())))
    }

    async fn file_store(dir: &tempfile::TempDir, name: &str) -> Arc<SqliteCoordinationStore> {
        let path = dir.path().join(name);
        Arc::new(
            SqliteCoordinationStore::new(path.to_str().unwrap())
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_agent_lifecycle() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = file_store(&temp_dir, "test_agent.db").await;

        let agent = Agent::builder()
            .name("test-agent-1")
            .lease_duration(Duration::from_millis(500))
            .pulse_interval(Duration::from_millis(50))
            .store(Arc::clone(&store))
            .handler(noop_handler())
            .build()
            .await
            .unwrap();

        // Agent should not be started initially
        assert!(!agent.is_started().await);
        assert!(agent.agent_id().is_none());

        agent.start().await.unwrap();
        assert!(agent.is_started().await);

        // Registered in the membership table
        let agents = store.find_all_agents_order_by_id().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].name, "test-agent-1");
        assert_eq!(Some(agents[0].id), agent.agent_id());

        let assignment = agent.wait_until_running(Duration::from_secs(5)).await;
        assert_eq!(assignment, ShardAssignment::new(0, 1));

        agent.stop().await.unwrap();
        assert!(!agent.is_started().await);

        // Row deleted on leave
        assert!(store.find_all_agents_order_by_id().await.unwrap().is_empty());
        assert!(agent.status().draining().is_none());
    }

    #[test]
    fn test_agent_config_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.agent_type, AgentType::EventProcessingDynamicSharding);
        assert_eq!(config.lease_duration, Duration::from_secs(30));
        assert_eq!(config.pulse_interval, Duration::from_secs(2));
        assert_eq!(config.stabilization_reads, 2);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_attempts, 3);
        assert!(config.total_shard_count.is_none());
        assert!(config.validate().is_ok());
        assert_eq!(config.sharding_mode().unwrap(), ShardingMode::Dynamic);
    }

    #[test]
    fn test_config_validation() {
        let invalid = [
            AgentConfig {
                name: " ".to_string(),
                ..AgentConfig::default()
            },
            AgentConfig {
                pulse_interval: Duration::from_secs(30),
                ..AgentConfig::default()
            },
            AgentConfig {
                pulse_interval: Duration::ZERO,
                ..AgentConfig::default()
            },
            AgentConfig {
                batch_size: 0,
                ..AgentConfig::default()
            },
            AgentConfig {
                stabilization_reads: 0,
                ..AgentConfig::default()
            },
            AgentConfig {
                polling_interval: Duration::from_secs(20),
                ..AgentConfig::default()
            },
            AgentConfig {
                total_shard_count: Some(2),
                ..AgentConfig::default()
            },
            AgentConfig {
                agent_type: AgentType::EventProcessingStaticSharding,
                total_shard_count: Some(2),
                ..AgentConfig::default()
            },
            AgentConfig {
                agent_type: AgentType::EventProcessingStaticSharding,
                total_shard_count: Some(2),
                assigned_shard_index: Some(2),
                ..AgentConfig::default()
            },
        ];

        for config in invalid {
            assert!(
                matches!(config.validate(), Err(AgentError::Config(_))),
                "expected invalid: {:?}",
                config
            );
        }
    }

    #[test]
    fn test_static_sharding_mode() {
        let config = AgentConfig {
            agent_type: AgentType::EventProcessingStaticSharding,
            total_shard_count: Some(4),
            assigned_shard_index: Some(3),
            ..AgentConfig::default()
        };
        assert_eq!(
            config.sharding_mode().unwrap(),
            ShardingMode::Static(ShardAssignment::new(3, 4).unwrap())
        );
    }

    #[test]
    fn test_config_serializes() {
        let config = AgentConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: AgentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[tokio::test]
    async fn test_builder_requires_store_and_handler() {
        let result = Agent::builder().handler(noop_handler()).build().await;
        assert!(matches!(result, Err(AgentError::Config(_))));

        let store = Arc::new(SqliteCoordinationStore::new_in_memory().await.unwrap());
        let result = Agent::builder().store(store).build().await;
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn test_builder_rejects_invalid_static_sharding() {
        let store = Arc::new(SqliteCoordinationStore::new_in_memory().await.unwrap());
        let result = Agent::builder()
            .static_sharding(5, 3)
            .store(store)
            .handler(noop_handler())
            .build()
            .await;
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn test_agent_cannot_start_twice() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = file_store(&temp_dir, "test_agent_double_start.db").await;

        let agent = Agent::builder()
            .name("test-agent-2")
            .store(store)
            .handler(noop_handler())
            .build()
            .await
            .unwrap();

        agent.start().await.unwrap();

        let result = agent.start().await;
        assert!(matches!(result, Err(AgentError::AlreadyStarted)));

        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_not_started_is_ok() {
        let store = Arc::new(SqliteCoordinationStore::new_in_memory().await.unwrap());
        let agent = Agent::builder()
            .store(store)
            .handler(noop_handler())
            .build()
            .await
            .unwrap();

        agent.stop().await.unwrap();
        assert!(matches!(agent.suspend().await, Err(AgentError::NotStarted)));
    }

    #[tokio::test]
    async fn test_suspend_and_resume() {
        let store = Arc::new(SqliteCoordinationStore::new_in_memory().await.unwrap());
        let agent = Agent::builder()
            .name("test-agent-3")
            .lease_duration(Duration::from_millis(500))
            .pulse_interval(Duration::from_millis(50))
            .store(Arc::clone(&store))
            .handler(noop_handler())
            .build()
            .await
            .unwrap();

        agent.start().await.unwrap();
        assert!(agent.wait_until_running(Duration::from_secs(5)).await.is_some());

        agent.suspend().await.unwrap();
        assert_eq!(agent.status().state, EventProcessingState::Suspended);
        let id = agent.agent_id().unwrap();
        let row = store.find_agent(id).await.unwrap().unwrap();
        assert_eq!(row.state, EventProcessingState::Suspended);

        agent.resume().await.unwrap();
        assert!(agent.wait_until_running(Duration::from_secs(5)).await.is_some());

        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_after_stop_gets_new_id() {
        let store = Arc::new(SqliteCoordinationStore::new_in_memory().await.unwrap());
        let agent = Agent::builder()
            .store(Arc::clone(&store))
            .handler(noop_handler())
            .build()
            .await
            .unwrap();

        agent.start().await.unwrap();
        let first = agent.agent_id().unwrap();
        agent.stop().await.unwrap();

        agent.start().await.unwrap();
        let second = agent.agent_id().unwrap();
        assert!(second > first);
        agent.stop().await.unwrap();
    }
}
