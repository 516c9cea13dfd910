//! Prometheus metrics for IndexSync agents.
//!
//! All metrics live in a process-wide [`REGISTRY`] and are labelled with the
//! agent name, so several agents in one process (tests, demos) stay
//! distinguishable.

use indexsync_core::ShardAssignment;
use indexsync_metadata::EventProcessingState;
use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Membership Metrics
    // ============================================================================

    /// Pulses completed (membership read + own row written)
    pub static ref PULSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("indexsync_pulses_total", "Total pulses completed"),
        &["agent"]
    ).expect("metric can be created");

    /// Pulses that failed before writing the own row
    pub static ref PULSE_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("indexsync_pulse_failures_total", "Total failed pulses"),
        &["agent"]
    ).expect("metric can be created");

    /// Expired peers deleted by this agent
    pub static ref PEERS_PRUNED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("indexsync_peers_pruned_total", "Total expired peer rows deleted"),
        &["agent"]
    ).expect("metric can be created");

    /// Own row found missing
    pub static ref IDENTITY_LOSSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("indexsync_identity_losses_total", "Total identity losses"),
        &["agent"]
    ).expect("metric can be created");

    /// State machine transitions
    pub static ref STATE_TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("indexsync_state_transitions_total", "Total event processing state transitions"),
        &["agent", "from", "to"]
    ).expect("metric can be created");

    /// Current state: 0 = RUNNING, 1 = REBALANCING, 2 = SUSPENDED
    pub static ref PROCESSING_STATE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("indexsync_processing_state", "Current event processing state"),
        &["agent"]
    ).expect("metric can be created");

    /// Shard being drained, -1 when none
    pub static ref SHARD_INDEX: IntGaugeVec = IntGaugeVec::new(
        Opts::new("indexsync_shard_index", "Shard index being drained"),
        &["agent"]
    ).expect("metric can be created");

    /// Total shard count of the drained assignment, 0 when none
    pub static ref SHARD_COUNT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("indexsync_shard_count", "Total shard count of the drained assignment"),
        &["agent"]
    ).expect("metric can be created");

    // ============================================================================
    // Consumer Metrics
    // ============================================================================

    /// Events applied and acknowledged
    pub static ref EVENTS_PROCESSED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("indexsync_events_processed_total", "Total events applied"),
        &["agent"]
    ).expect("metric can be created");

    /// Apply failures (retried or abandoned)
    pub static ref EVENTS_FAILED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("indexsync_events_failed_total", "Total event apply failures"),
        &["agent"]
    ).expect("metric can be created");

    /// Undecodable events moved to the poison path
    pub static ref EVENTS_POISONED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("indexsync_events_poisoned_total", "Total undecodable events abandoned"),
        &["agent"]
    ).expect("metric can be created");

    /// Consumer errors by stage (fetch, acknowledge)
    pub static ref CONSUMER_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("indexsync_consumer_errors_total", "Total consumer storage errors"),
        &["agent", "stage"]
    ).expect("metric can be created");

    /// Batch latency (fetch to acknowledgement)
    pub static ref BATCH_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("indexsync_batch_latency_seconds", "Batch latency in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["agent"]
    ).expect("metric can be created");
}

/// Register all metrics with [`REGISTRY`]. Idempotent.
pub fn init() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(PULSES_TOTAL.clone()),
            Box::new(PULSE_FAILURES_TOTAL.clone()),
            Box::new(PEERS_PRUNED_TOTAL.clone()),
            Box::new(IDENTITY_LOSSES_TOTAL.clone()),
            Box::new(STATE_TRANSITIONS_TOTAL.clone()),
            Box::new(PROCESSING_STATE.clone()),
            Box::new(SHARD_INDEX.clone()),
            Box::new(SHARD_COUNT.clone()),
            Box::new(EVENTS_PROCESSED_TOTAL.clone()),
            Box::new(EVENTS_FAILED_TOTAL.clone()),
            Box::new(EVENTS_POISONED_TOTAL.clone()),
            Box::new(CONSUMER_ERRORS_TOTAL.clone()),
            Box::new(BATCH_LATENCY.clone()),
        ];

        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::warn!(error = %e, "Failed to register metric");
            }
        }
    });
}

/// Encode every registered metric in the Prometheus text format.
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Publish the gauges describing an agent's current status.
pub fn record_status(
    agent: &str,
    state: EventProcessingState,
    assignment: Option<ShardAssignment>,
) {
    let state_value = match state {
        EventProcessingState::Running => 0,
        EventProcessingState::Rebalancing => 1,
        EventProcessingState::Suspended => 2,
    };
    PROCESSING_STATE.with_label_values(&[agent]).set(state_value);

    let (index, count) = assignment
        .map(|a| (i64::from(a.shard_index), i64::from(a.total_shard_count)))
        .unwrap_or((-1, 0));
    SHARD_INDEX.with_label_values(&[agent]).set(index);
    SHARD_COUNT.with_label_values(&[agent]).set(count);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_agent_metrics() {
        init();
        init();

        PULSES_TOTAL.with_label_values(&["metrics-test"]).inc();
        record_status(
            "metrics-test",
            EventProcessingState::Running,
            ShardAssignment::new(1, 3),
        );

        let text = gather_text().unwrap();
        assert!(text.contains("indexsync_pulses_total"));
        assert!(text.contains("indexsync_shard_count{agent=\"metrics-test\"} 3"));
    }
}
