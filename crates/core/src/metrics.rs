//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Orchestrator (operations, step transitions, polls, retries, leases)
//! - Notifications
//! - External services (control plane, webhook)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Orchestrator - Operation Metrics
// =============================================================================

/// Operations accepted by the trigger.
pub static OPERATIONS_CREATED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "clusterback_operations_created_total",
        "Total restore operations created",
    )
    .expect("valid metric definition")
});

/// Operations reaching a terminal status.
pub static OPERATIONS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "clusterback_operations_finished_total",
            "Total restore operations finished",
        ),
        &["result"], // "succeeded", "failed", "cancelled"
    )
    .expect("valid metric definition")
});

/// End-to-end operation duration in seconds.
pub static OPERATION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "clusterback_operation_duration_seconds",
            "Duration of restore operations from creation to terminal status",
        )
        .buckets(vec![
            60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 14400.0, 28800.0, 86400.0,
        ]),
        &["result"],
    )
    .expect("valid metric definition")
});

// =============================================================================
// Orchestrator - Step Metrics
// =============================================================================

/// Step outcomes by step and outcome.
pub static STEP_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "clusterback_step_transitions_total",
            "Total step handler outcomes",
        ),
        &["step", "outcome"], // outcome: "success", "warning", "waiting", "failure"
    )
    .expect("valid metric definition")
});

/// Time a step handler call took, in seconds.
pub static STEP_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "clusterback_step_handler_duration_seconds",
            "Duration of a single step handler invocation",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["step"],
    )
    .expect("valid metric definition")
});

/// Deferred re-checks scheduled by polling steps.
pub static POLL_WAITS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("clusterback_poll_waits_total", "Total poll re-checks scheduled"),
        &["step"],
    )
    .expect("valid metric definition")
});

/// Retries scheduled by step and error kind.
pub static RETRY_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("clusterback_retry_attempts_total", "Total step retries scheduled"),
        &["step", "kind"],
    )
    .expect("valid metric definition")
});

/// Drive attempts that found another executor holding the lease.
pub static LEASE_CONFLICTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "clusterback_lease_conflicts_total",
        "Total drive attempts skipped because of a held lease",
    )
    .expect("valid metric definition")
});

/// Writes rejected by the versioned conditional update.
pub static VERSION_CONFLICTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "clusterback_version_conflicts_total",
        "Total state writes rejected because of a stale version",
    )
    .expect("valid metric definition")
});

// =============================================================================
// Notifications
// =============================================================================

/// Notifications published by result.
pub static NOTIFICATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "clusterback_notifications_total",
            "Total notifications published",
        ),
        &["status", "result"], // result: "delivered", "failed"
    )
    .expect("valid metric definition")
});

// =============================================================================
// External Service Metrics
// =============================================================================

/// External service request duration.
pub static EXTERNAL_SERVICE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "clusterback_external_service_duration_seconds",
            "Duration of external service calls",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["service", "operation"],
    )
    .expect("valid metric definition")
});

/// External service requests total.
pub static EXTERNAL_SERVICE_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "clusterback_external_service_requests_total",
            "Total external service requests",
        ),
        &["service", "operation", "status"], // status: "success", "error"
    )
    .expect("valid metric definition")
});

// =============================================================================
// Helper functions
// =============================================================================

/// Record one external call.
pub fn observe_external(service: &str, operation: &str, seconds: f64, ok: bool) {
    EXTERNAL_SERVICE_DURATION
        .with_label_values(&[service, operation])
        .observe(seconds);
    EXTERNAL_SERVICE_REQUESTS
        .with_label_values(&[service, operation, if ok { "success" } else { "error" }])
        .inc();
}

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Operations
        Box::new(OPERATIONS_CREATED.clone()),
        Box::new(OPERATIONS_FINISHED.clone()),
        Box::new(OPERATION_DURATION.clone()),
        // Steps
        Box::new(STEP_TRANSITIONS.clone()),
        Box::new(STEP_DURATION.clone()),
        Box::new(POLL_WAITS.clone()),
        Box::new(RETRY_ATTEMPTS.clone()),
        Box::new(LEASE_CONFLICTS.clone()),
        Box::new(VERSION_CONFLICTS.clone()),
        // Notifications
        Box::new(NOTIFICATIONS.clone()),
        // External services
        Box::new(EXTERNAL_SERVICE_DURATION.clone()),
        Box::new(EXTERNAL_SERVICE_REQUESTS.clone()),
    ]
}
