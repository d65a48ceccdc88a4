//! Central metrics registry and metric definitions
//!
//! Prometheus metrics for the orchestrator, registered lazily on first
//! access using once_cell::Lazy.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, HistogramVec, IntCounterVec, IntGauge, TextEncoder,
};

// ===== Dispatch Metrics =====

/// Segment dispatches by outcome (completed, retry, exhausted, skipped, interrupted)
pub static SEGMENT_DISPATCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "harvest_segment_dispatches_total",
        "Total number of segment dispatches by outcome",
        &["outcome"]
    )
    .expect("Failed to register segment dispatch counter")
});

/// Segment status transitions written to the store
pub static SEGMENT_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "harvest_segment_transitions_total",
        "Total number of committed segment transitions",
        &["status"]
    )
    .expect("Failed to register segment transition counter")
});

/// Submissions sent to the execution API by result (accepted, rejected,
/// unrecorded when an accepted id could not be persisted)
pub static EXECUTION_SUBMISSIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "harvest_execution_submissions_total",
        "Total number of execution submissions",
        &["result"]
    )
    .expect("Failed to register execution submission counter")
});

/// Time from submission to a terminal execution status
pub static EXECUTION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "harvest_execution_duration_seconds",
        "Time spent awaiting a terminal execution status",
        &["state"],
        // Buckets: 10s, 30s, 1m, 2m, 5m, 10m, 30m, 1h, 2h
        vec![10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0]
    )
    .expect("Failed to register execution duration histogram")
});

/// Segments currently being dispatched by this process
pub static ACTIVE_DISPATCHES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "harvest_active_dispatches",
        "Number of segment dispatches in flight"
    )
    .expect("Failed to register active dispatch gauge")
});

// ===== Rate Limiter Metrics =====

/// Time spent waiting for an execution API permit
pub static RATE_LIMIT_WAIT: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "harvest_rate_limit_wait_seconds",
        "Time spent waiting for a rate limiter permit",
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0]
    )
    .expect("Failed to register rate limit wait histogram")
});

// ===== Scheduler Metrics =====

/// Scheduler tick duration
pub static SCHEDULER_TICK_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "harvest_scheduler_tick_duration_seconds",
        "Scheduler tick duration in seconds",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .expect("Failed to register scheduler tick histogram")
});

/// Collection status transitions
pub static COLLECTION_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "harvest_collection_transitions_total",
        "Total number of collection status transitions",
        &["status"]
    )
    .expect("Failed to register collection transition counter")
});

/// Renders every registered metric in the Prometheus text format.
pub fn export_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|err| prometheus::Error::Msg(err.to_string()))
}
