//! Metrics and observability utilities
//!
//! Provides Prometheus metrics with latency histograms
//! and standardized naming conventions.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

/// Metrics prefix for all Fista metrics
pub const METRICS_PREFIX: &str = "fista";

/// Histogram buckets for backend and task latency (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.005, // 5ms
    0.010, // 10ms
    0.025, // 25ms
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.500, // 2.5s
    5.000, // 5s
    10.00, // 10s
    30.00, // 30s - default task timeout
];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_queries_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of submitted queries by outcome"
    );

    describe_histogram!(
        format!("{}_task_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Query task latency from dispatch to terminal state"
    );

    describe_gauge!(
        format!("{}_active_tasks", METRICS_PREFIX),
        Unit::Count,
        "Query tasks currently in flight"
    );

    describe_counter!(
        format!("{}_deltas_emitted_total", METRICS_PREFIX),
        Unit::Count,
        "Incremental result deltas streamed to clients"
    );

    describe_counter!(
        format!("{}_backend_attempts_total", METRICS_PREFIX),
        Unit::Count,
        "Backend query attempts, including retries"
    );

    describe_histogram!(
        format!("{}_backend_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Backend query latency in seconds"
    );

    describe_counter!(
        format!("{}_backend_unavailable_total", METRICS_PREFIX),
        Unit::Count,
        "Backends that exhausted their retry budget"
    );

    describe_counter!(
        format!("{}_conversations_evicted_total", METRICS_PREFIX),
        Unit::Count,
        "Conversations removed by the eviction sweep"
    );

    describe_gauge!(
        format!("{}_conversations", METRICS_PREFIX),
        Unit::Count,
        "Conversations held in memory"
    );

    describe_counter!(
        format!("{}_feedback_events_total", METRICS_PREFIX),
        Unit::Count,
        "Feedback actions on agent messages"
    );

    tracing::info!("Metrics registered");
}

/// Record a query reaching a terminal state
pub fn record_query(outcome: &str, duration_secs: f64) {
    counter!(
        format!("{}_queries_total", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_task_duration_seconds", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .record(duration_secs);
}

/// Record a query rejected before any task was created
pub fn record_rejected(reason: &str) {
    counter!(
        format!("{}_queries_total", METRICS_PREFIX),
        "outcome" => "rejected",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Track tasks entering and leaving flight
pub fn record_active_tasks(delta: f64) {
    gauge!(format!("{}_active_tasks", METRICS_PREFIX)).increment(delta);
}

pub fn record_delta(backends: usize) {
    counter!(
        format!("{}_deltas_emitted_total", METRICS_PREFIX),
        "backends" => backends.to_string()
    )
    .increment(1);
}

/// Record a single backend attempt
pub fn record_backend_attempt(backend: &str, duration_secs: f64, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_backend_attempts_total", METRICS_PREFIX),
        "backend" => backend.to_string(),
        "status" => status
    )
    .increment(1);

    histogram!(
        format!("{}_backend_duration_seconds", METRICS_PREFIX),
        "backend" => backend.to_string()
    )
    .record(duration_secs);
}

pub fn record_backend_unavailable(backend: &str) {
    counter!(
        format!("{}_backend_unavailable_total", METRICS_PREFIX),
        "backend" => backend.to_string()
    )
    .increment(1);
}

/// Record an eviction sweep
pub fn record_eviction(evicted: usize, remaining: usize) {
    counter!(format!("{}_conversations_evicted_total", METRICS_PREFIX)).increment(evicted as u64);
    gauge!(format!("{}_conversations", METRICS_PREFIX)).set(remaining as f64);
}

pub fn record_feedback(kind: &str) {
    counter!(
        format!("{}_feedback_events_total", METRICS_PREFIX),
        "kind" => kind.to_string()
    )
    .increment(1);
}
