use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub active_runs: usize,
    pub total_jobs: usize,
    pub version: String,
    pub data_dir: String,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Health check");

    let uptime = state.start_time.elapsed().as_secs();

    let total_jobs = match state.status.job_store().list_jobs().await {
        Ok(jobs) => jobs.len(),
        Err(e) => {
            tracing::warn!("Health check could not list jobs: {}", e);
            0
        }
    };

    let data_dir = state
        .data_dir
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "in-memory".to_string());

    let response = HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: uptime,
        active_runs: state.dispatcher.active_count().await,
        total_jobs,
        version: env!("CARGO_PKG_VERSION").to_string(),
        data_dir,
    };

    (StatusCode::OK, Json(response))
}
