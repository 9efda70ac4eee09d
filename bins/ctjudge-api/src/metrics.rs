// Prometheus counters for the API surface.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, Encoder, IntCounterVec, TextEncoder,
};

lazy_static! {
    pub static ref SUBMISSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ctjudge_submissions_total",
        "Accepted submissions by mode and language",
        &["mode", "language"]
    )
    .expect("metric registration");
    pub static ref SUBMISSIONS_REJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ctjudge_submissions_rejected_total",
        "Rejected submissions by reason",
        &["reason"]
    )
    .expect("metric registration");
    pub static ref CANCELLATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ctjudge_cancellations_total",
        "Cancellation requests by outcome",
        &["outcome"]
    )
    .expect("metric registration");
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics_handler() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    match String::from_utf8(buffer) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            tracing::error!(error = %e, "Metrics output was not UTF-8");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}
