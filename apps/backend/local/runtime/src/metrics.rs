//! Prometheus exposition for the counters recorded across the platform.

use std::sync::OnceLock;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global recorder. Later calls return the installed handle.
pub fn init_metrics() -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_counter!("jobplane_tokens_issued_total", "Access tokens issued by the vendor");
    describe_counter!("jobplane_tokens_refused_total", "Credential requests exceeding role policy");
    describe_counter!("jobplane_tokens_rejected_total", "Presented tokens failing verification");
    describe_counter!("jobplane_queue_enqueued_total", "Tasks accepted by the queue");
    describe_counter!("jobplane_queue_claimed_total", "Deliveries handed out by the queue");
    describe_counter!("jobplane_dispatch_halted_total", "Batches halted by worker-pool authorization");
    describe_counter!("jobplane_dispatch_saturated_total", "Batches skipped for lack of worker slots");
    describe_counter!("jobplane_dispatch_assigned_total", "Tasks handed to workers");
    describe_counter!("jobplane_tasks_succeeded_total", "Tasks acknowledged as succeeded");
    describe_counter!("jobplane_tasks_failed_total", "Worker-reported task failures by kind");
    describe_counter!("jobplane_worker_crashes_total", "Worker attempts that died before reporting");
    describe_counter!("jobplane_queue_redelivered_total", "Leases that lapsed and were redelivered");
    describe_counter!("jobplane_queue_dead_lettered_total", "Tasks moved to the dead-letter list");
    describe_counter!("jobplane_alerts_total", "Operator alerts raised");

    tracing::info!("Prometheus metrics recorder initialized");
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

pub async fn serve_metrics() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        ),
    }
}
