//! SQLite Coordination Store Implementation
//!
//! This module implements [`MembershipDirectory`] and [`OutboxStore`] using
//! SQLite as the backend.
//!
//! ## Usage
//!
//! ### File-Based (Production)
//! ```ignore
//! use indexsync_metadata::{SqliteCoordinationStore, MembershipDirectory};
//!
//! // Creates coordination.db (or opens it if it exists)
//! let store = SqliteCoordinationStore::new("coordination.db").await?;
//! let members = store.find_all_agents_order_by_id().await?;
//! ```
//!
//! Several processes on the same host may open the same file: the database
//! runs in WAL mode with a busy timeout, so concurrent pulses wait for each
//! other instead of failing.
//!
//! ### In-Memory (Testing)
//! ```ignore
//! // Fast, isolated tests
//! let store = SqliteCoordinationStore::new_in_memory().await?;
//! ```
//!
//! ## Implementation Details
//!
//! ### Connection Pool
//! - File databases use a pool of 10 connections
//! - In-memory databases use exactly one long-lived connection; every
//!   SQLite connection to `:memory:` is a separate database
//!
//! ### Migrations
//! - Run automatically on startup via `sqlx::migrate!("./migrations")`
//!
//! ### Integers
//! - SQLite only has signed 64-bit integers; `u32` columns are written as
//!   `i64` and checked on the way back

use crate::{
    error::{MetadataError, Result},
    types::*,
    MembershipDirectory, OutboxStore,
};
use async_trait::async_trait;
use indexsync_core::HashRange;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const AGENT_COLUMNS: &str = "id, agent_type, name, expiration, state, \
     total_shard_count, assigned_shard_index, payload";

const EVENT_COLUMNS: &str = "id, entity_name, entity_id, entity_id_hash, payload, \
     status, attempts, process_after, created_at";

/// SQLite-based coordination store
#[derive(Debug, Clone)]
pub struct SqliteCoordinationStore {
    pool: SqlitePool,
}

impl SqliteCoordinationStore {
    /// Open (or create) a SQLite database file.
    ///
    /// `":memory:"` is accepted and behaves like [`Self::new_in_memory`].
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref() == Path::new(":memory:") {
            return Self::new_in_memory().await;
        }

        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Create in-memory database (for testing)
    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Wrap an existing pool and bring its schema up to date.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

fn agent_from_row(row: &SqliteRow) -> Result<Agent> {
    let agent_type: String = row.try_get("agent_type")?;
    let state: String = row.try_get("state")?;

    Ok(Agent {
        id: AgentId(row.try_get("id")?),
        agent_type: agent_type.parse()?,
        name: row.try_get("name")?,
        expiration: row.try_get("expiration")?,
        state: state.parse()?,
        total_shard_count: optional_u32(row.try_get("total_shard_count")?, "total_shard_count")?,
        assigned_shard_index: optional_u32(
            row.try_get("assigned_shard_index")?,
            "assigned_shard_index",
        )?,
        payload: row.try_get("payload")?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<OutboxEvent> {
    let status: String = row.try_get("status")?;

    Ok(OutboxEvent {
        id: row.try_get("id")?,
        entity_name: row.try_get("entity_name")?,
        entity_id: row.try_get("entity_id")?,
        entity_id_hash: to_u32(row.try_get("entity_id_hash")?, "entity_id_hash")?,
        payload: row.try_get("payload")?,
        status: status.parse()?,
        attempts: to_u32(row.try_get("attempts")?, "attempts")?,
        process_after: row.try_get("process_after")?,
        created_at: row.try_get("created_at")?,
    })
}

pub(crate) fn to_u32(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| MetadataError::InvalidRow(format!("{} = {} is out of range", column, value)))
}

pub(crate) fn optional_u32(value: Option<i64>, column: &str) -> Result<Option<u32>> {
    value.map(|v| to_u32(v, column)).transpose()
}

#[async_trait]
impl MembershipDirectory for SqliteCoordinationStore {
    async fn find_agent(&self, id: AgentId) -> Result<Option<Agent>> {
        let row = sqlx::query(&format!("SELECT {} FROM agents WHERE id = ?", AGENT_COLUMNS))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(agent_from_row).transpose()
    }

    async fn find_all_agents_order_by_id(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query(&format!("SELECT {} FROM agents ORDER BY id", AGENT_COLUMNS))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(agent_from_row).collect()
    }

    async fn create_agent(&self, agent: NewAgent) -> Result<Agent> {
        agent.validate()?;

        let id = sqlx::query(
            r#"
            INSERT INTO agents (agent_type, name, expiration, state,
                                total_shard_count, assigned_shard_index, payload)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(agent.agent_type.as_str())
        .bind(&agent.name)
        .bind(agent.expiration)
        .bind(agent.state.as_str())
        .bind(agent.total_shard_count.map(i64::from))
        .bind(agent.assigned_shard_index.map(i64::from))
        .bind(agent.payload.as_deref())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(agent.into_agent(AgentId(id)))
    }

    async fn update_agent(&self, agent: &Agent) -> Result<bool> {
        agent.validate()?;

        let rows_affected = sqlx::query(
            "UPDATE agents SET expiration = ?, state = ?, payload = ? WHERE id = ?",
        )
        .bind(agent.expiration)
        .bind(agent.state.as_str())
        .bind(agent.payload.as_deref())
        .bind(agent.id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    async fn delete_agents(&self, ids: &[AgentId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;
        for id in ids {
            deleted += sqlx::query("DELETE FROM agents WHERE id = ?")
                .bind(id.0)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        Ok(deleted)
    }
}

#[async_trait]
impl OutboxStore for SqliteCoordinationStore {
    async fn append_events(&self, events: Vec<NewOutboxEvent>) -> Result<Vec<i64>> {
        let now = Self::now_ms();
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(events.len());

        for event in events {
            let id = sqlx::query(
                r#"
                INSERT INTO outbox_events (entity_name, entity_id, entity_id_hash, payload,
                                           status, attempts, process_after, created_at)
                VALUES (?, ?, ?, ?, 'PENDING', 0, ?, ?)
                "#,
            )
            .bind(&event.entity_name)
            .bind(&event.entity_id)
            .bind(i64::from(event.entity_id_hash))
            .bind(&event.payload)
            .bind(event.process_after)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();
            ids.push(id);
        }

        tx.commit().await?;
        Ok(ids)
    }

    async fn fetch_events(
        &self,
        range: HashRange,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM outbox_events
            WHERE status = 'PENDING'
              AND entity_id_hash >= ? AND entity_id_hash < ?
              AND process_after <= ?
            ORDER BY id
            LIMIT ?
            "#,
            EVENT_COLUMNS
        ))
        .bind(range.start as i64)
        .bind(range.end as i64)
        .bind(now_ms)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn acknowledge(&self, outcome: &BatchOutcome) -> Result<()> {
        if outcome.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for id in &outcome.processed {
            sqlx::query("DELETE FROM outbox_events WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        for retry in &outcome.retried {
            sqlx::query(
                "UPDATE outbox_events SET attempts = attempts + 1, process_after = ?
                 WHERE id = ? AND status = 'PENDING'",
            )
            .bind(retry.process_after)
            .bind(retry.id)
            .execute(&mut *tx)
            .await?;
        }

        for id in &outcome.abandoned {
            sqlx::query(
                "UPDATE outbox_events SET status = 'ABANDONED', attempts = attempts + 1
                 WHERE id = ?",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn count_pending_events(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM outbox_events WHERE status = 'PENDING'")
                .fetch_one(&self.pool)
                .await?;

        Ok(count as u64)
    }

    async fn find_abandoned_events(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM outbox_events WHERE status = 'ABANDONED' ORDER BY id LIMIT ?",
            EVENT_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn retry_abandoned_events(&self, ids: &[i64]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut requeued = 0;
        for id in ids {
            requeued += sqlx::query(
                "UPDATE outbox_events SET status = 'PENDING', attempts = 0, process_after = 0
                 WHERE id = ? AND status = 'ABANDONED'",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;

        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexsync_core::{IndexingQueueEventPayload, ShardAssignment};

    fn new_agent(name: &str, expiration: i64) -> NewAgent {
        NewAgent {
            agent_type: AgentType::EventProcessingDynamicSharding,
            name: name.to_string(),
            expiration,
            state: EventProcessingState::Rebalancing,
            total_shard_count: None,
            assigned_shard_index: None,
            payload: None,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_increasing_ids() {
        let store = SqliteCoordinationStore::new_in_memory().await.unwrap();

        let a = store.create_agent(new_agent("a", 1_000)).await.unwrap();
        let b = store.create_agent(new_agent("b", 1_000)).await.unwrap();
        assert!(a.id < b.id);

        let all = store.find_all_agents_order_by_id().await.unwrap();
        assert_eq!(all, vec![a.clone(), b]);
        assert_eq!(store.find_agent(a.id).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn test_update_missing_agent_returns_false() {
        let store = SqliteCoordinationStore::new_in_memory().await.unwrap();

        let mut agent = store.create_agent(new_agent("a", 1_000)).await.unwrap();
        agent.expiration = 2_000;
        agent.state = EventProcessingState::Running;
        assert!(store.update_agent(&agent).await.unwrap());
        assert_eq!(store.find_agent(agent.id).await.unwrap().unwrap().expiration, 2_000);

        assert_eq!(store.delete_agents(&[agent.id]).await.unwrap(), 1);
        assert!(!store.update_agent(&agent).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = SqliteCoordinationStore::new_in_memory().await.unwrap();

        let agent = store.create_agent(new_agent("a", 1_000)).await.unwrap();
        assert_eq!(store.delete_agents(&[agent.id, AgentId(999)]).await.unwrap(), 1);
        assert_eq!(store.delete_agents(&[agent.id]).await.unwrap(), 0);
        assert_eq!(store.delete_agents(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_static_agent() {
        let store = SqliteCoordinationStore::new_in_memory().await.unwrap();

        let mut agent = new_agent("static", 1_000);
        agent.agent_type = AgentType::EventProcessingStaticSharding;
        agent.total_shard_count = Some(2);
        agent.assigned_shard_index = Some(2);

        let err = store.create_agent(agent).await.unwrap_err();
        assert!(matches!(err, MetadataError::InvalidAgent(_)));
        assert!(store.find_all_agents_order_by_id().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_respects_range_and_schedule() {
        let store = SqliteCoordinationStore::new_in_memory().await.unwrap();
        let payload = IndexingQueueEventPayload::default();

        let events: Vec<NewOutboxEvent> = (0..20)
            .map(|i| NewOutboxEvent::new("Book", format!("book-{}", i), &payload))
            .collect();
        store.append_events(events.clone()).await.unwrap();

        let half = ShardAssignment::new(0, 2).unwrap().hash_range();
        let fetched = store.fetch_events(half, SqliteCoordinationStore::now_ms(), 100).await.unwrap();
        let expected = events
            .iter()
            .filter(|e| half.contains(e.entity_id_hash))
            .count();
        assert_eq!(fetched.len(), expected);
        assert!(fetched.windows(2).all(|w| w[0].id < w[1].id));

        let limited = store.fetch_events(HashRange::full(), SqliteCoordinationStore::now_ms(), 5).await.unwrap();
        assert_eq!(limited.len(), 5);
    }

    #[tokio::test]
    async fn test_acknowledge_outcome() {
        let store = SqliteCoordinationStore::new_in_memory().await.unwrap();
        let payload = IndexingQueueEventPayload::default();

        let ids = store
            .append_events(vec![
                NewOutboxEvent::new("Book", "1", &payload),
                NewOutboxEvent::new("Book", "2", &payload),
                NewOutboxEvent::new("Book", "3", &payload),
            ])
            .await
            .unwrap();

        let later = SqliteCoordinationStore::now_ms() + 60_000;
        store
            .acknowledge(&BatchOutcome {
                processed: vec![ids[0]],
                retried: vec![RetryEvent {
                    id: ids[1],
                    process_after: later,
                }],
                abandoned: vec![ids[2]],
            })
            .await
            .unwrap();

        // Retried event is scheduled in the future, abandoned one is gone for good
        assert!(store
            .fetch_events(HashRange::full(), SqliteCoordinationStore::now_ms(), 10)
            .await
            .unwrap()
            .is_empty());
        let retried = store.fetch_events(HashRange::full(), later, 10).await.unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].attempts, 1);
        assert_eq!(store.count_pending_events().await.unwrap(), 1);

        let abandoned = store.find_abandoned_events(10).await.unwrap();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].status, OutboxEventStatus::Abandoned);

        assert_eq!(store.retry_abandoned_events(&[ids[2]]).await.unwrap(), 1);
        assert_eq!(store.count_pending_events().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_file_store_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordination.db");

        let first = SqliteCoordinationStore::new(&path).await.unwrap();
        let second = SqliteCoordinationStore::new(&path).await.unwrap();

        let agent = first.create_agent(new_agent("a", 1_000)).await.unwrap();
        assert_eq!(second.find_agent(agent.id).await.unwrap(), Some(agent));
    }
}
