//! Outbox Consumer - Draining the Event Queue
//!
//! The consumer drains the pending events of the shard this agent owns and
//! hands each one to an [`IndexingEventHandler`].
//!
//! ## Loop
//!
//! 1. Wait until the pulse task publishes RUNNING with an assignment
//! 2. Fetch up to `batch_size` pending events in the assignment's hash range
//! 3. Before each event, re-check the status; stop the batch as soon as the
//!    agent leaves RUNNING or its assignment changes
//! 4. Decode the payload; undecodable events are abandoned (poison path)
//! 5. Apply; failures are rescheduled `retry_delay` later, and abandoned once
//!    `max_attempts` is reached
//! 6. Acknowledge the whole batch in one transaction
//! 7. On an empty batch, back off from `polling_interval` up to
//!    `max_polling_interval`
//!
//! ## Delivery Guarantee
//!
//! At-least-once. An event is only deleted after it was applied; if the
//! process dies in between, the next owner of the range applies it again.
//! Handlers must therefore be idempotent.

use crate::agent::AgentConfig;
use crate::error::{AgentError, Result};
use crate::heartbeat::{current_timestamp_ms, ProcessorStatus};
use crate::metrics;
use async_trait::async_trait;
use indexsync_core::{codec, IndexingQueueEventPayload, ShardAssignment};
use indexsync_metadata::{BatchOutcome, OutboxEvent, OutboxStore, RetryEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Applies one indexing event to the search index.
///
/// Called at least once per event; must be idempotent. Returning an error
/// reschedules the event.
#[async_trait]
pub trait IndexingEventHandler: Send + Sync {
    async fn apply(&self, event: &OutboxEvent, payload: &IndexingQueueEventPayload) -> Result<()>;
}

/// Counts of one drained batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub fetched: usize,
    pub processed: usize,
    pub retried: usize,
    pub abandoned: usize,
    /// Events left untouched because the status changed mid-batch
    pub skipped: usize,
}

pub struct OutboxConsumer {
    name: String,
    config: Arc<AgentConfig>,
    store: Arc<dyn OutboxStore>,
    handler: Arc<dyn IndexingEventHandler>,
    status: watch::Receiver<ProcessorStatus>,
}

impl OutboxConsumer {
    pub fn new(
        config: Arc<AgentConfig>,
        store: Arc<dyn OutboxStore>,
        handler: Arc<dyn IndexingEventHandler>,
        status: watch::Receiver<ProcessorStatus>,
    ) -> Self {
        Self {
            name: config.name.clone(),
            config,
            store,
            handler,
            status,
        }
    }

    /// Run the drain loop until `shutdown` is cancelled or the status
    /// publisher goes away.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            name = %self.name,
            batch_size = self.config.batch_size,
            "Outbox consumer started"
        );

        let mut backoff = self.config.polling_interval;
        let mut total = BatchStats::default();

        loop {
            let assignment = tokio::select! {
                _ = shutdown.cancelled() => break,
                assignment = self.wait_until_draining() => match assignment {
                    Some(assignment) => assignment,
                    None => break,
                },
            };

            match self.process_batch(assignment).await {
                Ok(stats) => {
                    total.processed += stats.processed;
                    total.abandoned += stats.abandoned;
                    if stats.fetched > 0 {
                        backoff = self.config.polling_interval;
                        continue;
                    }
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!(name = %self.name, error = %e, "Batch failed, backing off");
                    } else {
                        error!(name = %self.name, error = %e, "Batch failed, backing off");
                    }
                }
            }

            // Idle or failing: wait, but wake up early on status changes
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
                changed = self.status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            backoff = next_backoff(backoff, self.config.max_polling_interval);
        }

        info!(
            name = %self.name,
            total_processed = total.processed,
            total_abandoned = total.abandoned,
            "Outbox consumer stopped"
        );
    }

    /// Drain one batch of `assignment`'s range.
    pub async fn process_batch(&self, assignment: ShardAssignment) -> Result<BatchStats> {
        let started = Instant::now();
        let now = current_timestamp_ms();

        let events = self
            .store
            .fetch_events(assignment.hash_range(), now, self.config.batch_size)
            .await
            .inspect_err(|_| self.count_error("fetch"))?;

        let mut stats = BatchStats {
            fetched: events.len(),
            ..BatchStats::default()
        };
        if events.is_empty() {
            return Ok(stats);
        }

        let mut outcome = BatchOutcome::default();
        for (position, event) in events.iter().enumerate() {
            if self.current_assignment() != Some(assignment) {
                stats.skipped = events.len() - position;
                info!(
                    name = %self.name,
                    assignment = %assignment,
                    skipped = stats.skipped,
                    "Assignment no longer committed, stopping batch"
                );
                break;
            }
            self.process_event(event, &mut outcome).await;
        }

        stats.processed = outcome.processed.len();
        stats.retried = outcome.retried.len();
        stats.abandoned = outcome.abandoned.len();

        self.store
            .acknowledge(&outcome)
            .await
            .inspect_err(|_| self.count_error("acknowledge"))?;

        metrics::EVENTS_PROCESSED_TOTAL
            .with_label_values(&[self.name.as_str()])
            .inc_by(stats.processed as u64);
        metrics::BATCH_LATENCY
            .with_label_values(&[self.name.as_str()])
            .observe(started.elapsed().as_secs_f64());

        debug!(
            name = %self.name,
            assignment = %assignment,
            fetched = stats.fetched,
            processed = stats.processed,
            retried = stats.retried,
            abandoned = stats.abandoned,
            "Batch acknowledged"
        );

        Ok(stats)
    }

    async fn process_event(&self, event: &OutboxEvent, outcome: &mut BatchOutcome) {
        let payload = match codec::decode(&event.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    name = %self.name,
                    event_id = event.id,
                    entity = %event.entity_name,
                    entity_id = %event.entity_id,
                    error = %e,
                    "Undecodable event, abandoning"
                );
                metrics::EVENTS_POISONED_TOTAL
                    .with_label_values(&[self.name.as_str()])
                    .inc();
                outcome.abandoned.push(event.id);
                return;
            }
        };

        match self.handler.apply(event, &payload).await {
            Ok(()) => outcome.processed.push(event.id),
            Err(e) => {
                metrics::EVENTS_FAILED_TOTAL
                    .with_label_values(&[self.name.as_str()])
                    .inc();

                let attempts = event.attempts + 1;
                if attempts >= self.config.max_attempts {
                    error!(
                        name = %self.name,
                        event_id = event.id,
                        entity_id = %event.entity_id,
                        attempts,
                        error = %e,
                        "Event failed too many times, abandoning"
                    );
                    outcome.abandoned.push(event.id);
                } else {
                    warn!(
                        name = %self.name,
                        event_id = event.id,
                        entity_id = %event.entity_id,
                        attempts,
                        error = %e,
                        "Event failed, will retry"
                    );
                    outcome.retried.push(RetryEvent {
                        id: event.id,
                        process_after: current_timestamp_ms()
                            + self.config.retry_delay.as_millis() as i64,
                    });
                }
            }
        }
    }

    /// Wait for RUNNING; `None` if the status publisher is gone.
    async fn wait_until_draining(&mut self) -> Option<ShardAssignment> {
        loop {
            if let Some(assignment) = self.status.borrow_and_update().draining() {
                return Some(assignment);
            }
            if self.status.changed().await.is_err() {
                return None;
            }
        }
    }

    fn current_assignment(&self) -> Option<ShardAssignment> {
        self.status.borrow().draining()
    }

    fn count_error(&self, stage: &str) {
        metrics::CONSUMER_ERRORS_TOTAL
            .with_label_values(&[self.name.as_str(), stage])
            .inc();
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Adapter turning a closure into a handler; handy for tests and demos.
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
where
    F: Fn(&OutboxEvent, &IndexingQueueEventPayload) -> std::result::Result<(), String>
        + Send
        + Sync,
{
    pub fn new(apply: F) -> Self {
        Self(apply)
    }
}

#[async_trait]
impl<F> IndexingEventHandler for FnHandler<F>
where
    F: Fn(&OutboxEvent, &IndexingQueueEventPayload) -> std::result::Result<(), String>
        + Send
        + Sync,
{
    async fn apply(&self, event: &OutboxEvent, payload: &IndexingQueueEventPayload) -> Result<()> {
        (self.0)(event, payload).map_err(AgentError::Handler)
    }
}
