// HTTP route handlers for the CTJudge API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use ctjudge_common::error::{QueryError, SubmitError};
use ctjudge_common::types::{Language, SubmissionMode, SubmissionStatus};

use crate::metrics;
use crate::AppState;

/// Success envelope shared by every endpoint.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub data: T,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(ApiResponse {
            data,
            success: true,
            timestamp: Utc::now(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub success: bool,
    pub error: ApiErrorBody,
    pub timestamp: DateTime<Utc>,
}

fn api_error(status: StatusCode, code: &'static str, message: String) -> Response {
    (
        status,
        Json(ApiErrorResponse {
            success: false,
            error: ApiErrorBody { code, message },
            timestamp: Utc::now(),
        }),
    )
        .into_response()
}

fn submit_error_response(err: SubmitError) -> Response {
    let (status, code, reason) = match &err {
        SubmitError::InvalidProblem(_) => (StatusCode::NOT_FOUND, "PROBLEM_NOT_FOUND", "problem"),
        SubmitError::InvalidLanguage(_) => (StatusCode::BAD_REQUEST, "INVALID_LANGUAGE", "language"),
        SubmitError::UnsupportedLanguageForProblem { .. } => (
            StatusCode::BAD_REQUEST,
            "UNSUPPORTED_LANGUAGE",
            "unsupported",
        ),
        SubmitError::ShuttingDown => (
            StatusCode::SERVICE_UNAVAILABLE,
            "SHUTTING_DOWN",
            "shutdown",
        ),
    };
    metrics::SUBMISSIONS_REJECTED_TOTAL
        .with_label_values(&[reason])
        .inc();
    api_error(status, code, err.to_string())
}

fn query_error_response(err: QueryError) -> Response {
    match err {
        QueryError::NotFound(_) => {
            api_error(StatusCode::NOT_FOUND, "SUBMISSION_NOT_FOUND", err.to_string())
        }
        QueryError::NotReady(id) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(serde_json::json!({
                "submissionId": id,
                "status": "pending",
                "message": "Submission is queued or still executing"
            })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub problem_id: u32,
    pub language: Language,
    pub code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub submission_id: Uuid,
    pub status: SubmissionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u64>,
}

/// POST /run - judge against sample tests only
pub async fn run_submission(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SubmitRequest>,
) -> Response {
    enqueue(state, payload, SubmissionMode::Run).await
}

/// POST /submit - judge against the full test set
pub async fn submit_submission(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SubmitRequest>,
) -> Response {
    enqueue(state, payload, SubmissionMode::Submit).await
}

async fn enqueue(state: Arc<AppState>, payload: SubmitRequest, mode: SubmissionMode) -> Response {
    match state
        .engine
        .submit_job(payload.problem_id, payload.language, payload.code, mode)
        .await
    {
        Ok(receipt) => {
            let mode_label = match mode {
                SubmissionMode::Run => "run",
                SubmissionMode::Submit => "submit",
            };
            let language_label = payload.language.to_string();
            metrics::SUBMISSIONS_TOTAL
                .with_label_values(&[mode_label, language_label.as_str()])
                .inc();
            info!(
                submission_id = %receipt.submission_id,
                problem_id = payload.problem_id,
                language = %payload.language,
                "Submission accepted"
            );
            (
                StatusCode::CREATED,
                ApiResponse::ok(SubmitResponse {
                    submission_id: receipt.submission_id,
                    status: SubmissionStatus::Queued,
                    queue_position: receipt.queue_position,
                }),
            )
                .into_response()
        }
        Err(e) => {
            info!(problem_id = payload.problem_id, error = %e, "Submission rejected");
            submit_error_response(e)
        }
    }
}

/// GET /submissions/{id} - live status with queue position
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let submission_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.get_status(submission_id) {
        Ok(snapshot) => ApiResponse::ok(SubmitResponse {
            submission_id,
            status: snapshot.status,
            queue_position: snapshot.queue_position,
        })
        .into_response(),
        Err(e) => query_error_response(e),
    }
}

/// GET /submissions/{id}/result - terminal verdict; 202 while judging
pub async fn get_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let submission_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.get_result(submission_id) {
        Ok(record) => {
            info!(submission_id = %submission_id, result = ?record.result, "Result retrieved");
            ApiResponse::ok(record).into_response()
        }
        Err(e) => query_error_response(e),
    }
}

/// DELETE /submissions/{id} - request cancellation
pub async fn cancel_submission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let submission_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.cancel(submission_id) {
        Ok(()) => {
            metrics::CANCELLATIONS_TOTAL
                .with_label_values(&["requested"])
                .inc();
            info!(submission_id = %submission_id, "Cancellation requested");
            ApiResponse::ok(serde_json::json!({
                "submissionId": submission_id,
                "cancellationRequested": true
            }))
            .into_response()
        }
        Err(e) => {
            metrics::CANCELLATIONS_TOTAL
                .with_label_values(&["not_found"])
                .inc();
            query_error_response(e)
        }
    }
}

/// GET /languages - enabled languages
pub async fn list_languages(State(state): State<Arc<AppState>>) -> Response {
    ApiResponse::ok(state.engine.enabled_languages()).into_response()
}

/// GET /status - health check
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

fn parse_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| {
        error!(raw = %raw, "Malformed submission id");
        api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_SUBMISSION_ID",
            "Invalid submission ID format".to_string(),
        )
    })
}
