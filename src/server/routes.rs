use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::errors::PipelineError;
use crate::models::{Job, JobStatus, LogEntry, NewJob, TaskStatistics};

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            PipelineError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            PipelineError::AlreadyCompleted(_) => (StatusCode::CONFLICT, "already_completed"),
            PipelineError::AlreadyRunning(_) => (StatusCode::CONFLICT, "already_running"),
            PipelineError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            PipelineError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            PipelineError::StoreUnavailable(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "store_unavailable")
            }
            PipelineError::ShuttingDown(_) => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        error_response(status, error, &self.to_string())
    }
}

fn parse_job_id(raw: &str) -> Result<Uuid, PipelineError> {
    Uuid::parse_str(raw)
        .map_err(|_| PipelineError::Validation(format!("'{}' is not a valid job id", raw)))
}

// ---------------------------------------------------------------------------
// Query params and bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
pub struct ListJobsParams {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListLogsParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Deserialize, Default)]
pub struct GenerateRequest {
    #[serde(default)]
    pub regenerate: bool,
}

#[derive(Debug, Serialize)]
pub struct JobWithLogs {
    #[serde(flatten)]
    pub job: Job,
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Serialize)]
pub struct LogPage {
    pub logs: Vec<LogEntry>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Serialize)]
pub struct StatisticsResponse {
    pub job_id: Uuid,
    pub statistics: Vec<TaskStatistics>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /api/jobs
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<Vec<Job>>, PipelineError> {
    let filter = params
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()?;

    let jobs = state
        .status
        .job_store()
        .list_jobs()
        .await
        .map_err(PipelineError::from_store)?;

    Ok(Json(match filter {
        Some(status) => jobs.into_iter().filter(|j| j.status == status).collect(),
        None => jobs,
    }))
}

/// POST /api/jobs
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(new_job): Json<NewJob>,
) -> Result<impl IntoResponse, PipelineError> {
    let job = state.status.create_job(new_job).await.inspect_err(|e| {
        tracing::warn!("Job creation failed: {}", e);
    })?;
    tracing::info!(
        "Created job {} ('{}' episode {})",
        job.id,
        job.title,
        job.episode_number
    );
    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /api/jobs/{id}
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobWithLogs>, PipelineError> {
    let id = parse_job_id(&id)?;
    let (job, logs) = state.status.job_with_logs(id).await?;
    Ok(Json(JobWithLogs { job, logs }))
}

/// DELETE /api/jobs/{id}
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, PipelineError> {
    let id = parse_job_id(&id)?;
    state.status.delete_job(id).await?;
    tracing::info!("Deleted job {}", id);
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/jobs/{id}/generate
///
/// The body is optional; an empty body means `{"regenerate": false}`.
pub async fn generate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, PipelineError> {
    let id = parse_job_id(&id)?;
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        GenerateRequest::default()
    } else {
        serde_json::from_slice::<GenerateRequest>(&body)
            .map_err(|e| PipelineError::Validation(format!("Invalid request body: {}", e)))?
    };

    let accepted = state.dispatcher.start(id, request.regenerate).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// GET /api/jobs/{id}/logs
pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<ListLogsParams>,
) -> Result<Json<LogPage>, PipelineError> {
    let id = parse_job_id(&id)?;
    state.status.get_job(id).await?;

    let (logs, total) = state
        .status
        .log_store()
        .list_logs(id, params.limit, params.offset)
        .await
        .map_err(PipelineError::from_store)?;

    Ok(Json(LogPage {
        logs,
        total,
        limit: params.limit,
        offset: params.offset,
    }))
}

/// GET /api/jobs/{id}/logs/statistics
pub async fn log_statistics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StatisticsResponse>, PipelineError> {
    let id = parse_job_id(&id)?;
    state.status.get_job(id).await?;

    let statistics = state
        .status
        .log_store()
        .statistics(id)
        .await
        .map_err(PipelineError::from_store)?;

    Ok(Json(StatisticsResponse {
        job_id: id,
        statistics,
    }))
}
