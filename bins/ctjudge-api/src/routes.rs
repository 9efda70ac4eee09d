// Route table for the CTJudge API

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::handlers;
use crate::metrics;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/run", post(handlers::run_submission))
        .route("/submit", post(handlers::submit_submission))
        .route(
            "/submissions/:id",
            get(handlers::get_status).delete(handlers::cancel_submission),
        )
        .route("/submissions/:id/result", get(handlers::get_result))
        .route("/languages", get(handlers::list_languages))
        .route("/status", get(handlers::health_check))
        .route("/metrics", get(metrics::metrics_handler))
}
