//! Prometheus metrics for observability.
//!
//! HTTP request metrics live here. Orchestration metrics are defined in
//! `clusterback_core::metrics` and registered into the same registry.
//! Status gauges are refreshed from the operation store on every scrape.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use regex_lite::Regex;

use clusterback_core::{OperationFilter, OperationStatus};

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "clusterback_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("clusterback_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests currently in flight.
pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "clusterback_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

// =============================================================================
// Orchestrator Metrics (collected dynamically)
// =============================================================================

/// Worker loop state (1 = running, 0 = stopped).
pub static ORCHESTRATOR_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "clusterback_orchestrator_running",
        "Whether the orchestrator worker loop is running (1) or stopped (0)",
    )
    .unwrap()
});

/// Operations this executor is driving right now.
pub static OPERATIONS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "clusterback_operations_in_flight",
        "Operations currently driven by this executor",
    )
    .unwrap()
});

/// Operations by current status.
pub static OPERATIONS_BY_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "clusterback_operations_by_status",
            "Current operation count by status",
        ),
        &["status"],
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .unwrap();

    // Orchestrator
    registry
        .register(Box::new(ORCHESTRATOR_RUNNING.clone()))
        .unwrap();
    registry
        .register(Box::new(OPERATIONS_IN_FLIGHT.clone()))
        .unwrap();
    registry
        .register(Box::new(OPERATIONS_BY_STATUS.clone()))
        .unwrap();

    // Core metrics (steps, polls, retries, leases, notifications, external calls)
    for metric in clusterback_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Refresh gauges from the orchestrator and the operation store.
pub async fn collect_dynamic_metrics(state: &crate::state::AppState) {
    let status = state.orchestrator().status().await;
    ORCHESTRATOR_RUNNING.set(if status.running { 1 } else { 0 });
    OPERATIONS_IN_FLIGHT.set(status.in_flight as i64);

    let store = state.operation_store();
    for status in [
        OperationStatus::Pending,
        OperationStatus::InProgress,
        OperationStatus::Waiting,
        OperationStatus::Cancelling,
        OperationStatus::Succeeded,
        OperationStatus::Failed,
        OperationStatus::Cancelled,
    ] {
        let filter = OperationFilter::new().with_status(status);
        if let Ok(count) = store.count(&filter) {
            OPERATIONS_BY_STATUS
                .with_label_values(&[status.as_str()])
                .set(count);
        }
    }
}

static UUID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .unwrap()
});

/// Path segment following `/operations/`, whatever its shape.
static OPERATION_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/operations/[^/]+").unwrap());

/// Normalize a path for metric labels (replace IDs with placeholders).
///
/// Operation ids may be caller-chosen, so the segment after `/operations/`
/// is always collapsed to keep label cardinality bounded.
pub fn normalize_path(path: &str) -> String {
    let result = UUID_PATTERN.replace_all(path, "{id}");
    let result = OPERATION_ID_PATTERN.replace_all(&result, "/operations/{id}");
    result.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_uuid() {
        let path = "/api/v1/operations/550e8400-e29b-41d4-a716-446655440000";
        assert_eq!(normalize_path(path), "/api/v1/operations/{id}");
    }

    #[test]
    fn test_normalize_path_caller_chosen_id() {
        let path = "/api/v1/operations/orders-restore-42/cancel";
        assert_eq!(normalize_path(path), "/api/v1/operations/{id}/cancel");
    }

    #[test]
    fn test_normalize_path_static_routes_unchanged() {
        assert_eq!(normalize_path("/api/v1/operations"), "/api/v1/operations");
        assert_eq!(
            normalize_path("/api/v1/orchestrator/status"),
            "/api/v1/orchestrator/status"
        );
    }

    #[test]
    fn test_encode_includes_core_metrics() {
        clusterback_core::metrics::OPERATIONS_CREATED.inc();
        let text = encode_metrics().unwrap();
        assert!(text.contains("clusterback_operations_created_total"));
    }
}
