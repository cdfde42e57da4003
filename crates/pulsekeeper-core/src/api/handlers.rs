//! API handlers for the operations endpoints

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use crate::db::Database;
use crate::error::Error;
use crate::scheduler::{self, Job};
use crate::tasks::TaskManager;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub tasks: Arc<TaskManager>,
    pub database: Option<Database>,
    pub prometheus: Option<PrometheusHandle>,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let check = match &state.database {
        Some(db) => db.health_check().await,
        None => Ok(()),
    };

    let (code, status, error) = match check {
        Ok(()) => (StatusCode::OK, "ok", None),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, "degraded", Some(e.to_string())),
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            error,
        }),
    )
}

/// Prometheus text exposition
pub async fn metrics(State(state): State<AppState>) -> Result<String, (StatusCode, String)> {
    state
        .prometheus
        .as_ref()
        .map(PrometheusHandle::render)
        .ok_or((StatusCode::NOT_FOUND, "metrics recorder not installed".to_string()))
}

/// One entry of the job listing
#[derive(Serialize)]
pub struct JobInfo {
    pub name: Job,
    pub schedule: String,
    pub next_run: DateTime<Utc>,
    pub description: &'static str,
}

/// List every job with its schedule
pub async fn list_jobs() -> Json<Vec<JobInfo>> {
    let now = Utc::now();
    Json(
        Job::ALL
            .into_iter()
            .map(|job| {
                let schedule = job.schedule();
                JobInfo {
                    name: job,
                    schedule: schedule.to_string(),
                    next_run: schedule.next_after(now),
                    description: job.description(),
                }
            })
            .collect(),
    )
}

/// Result of a manual run
#[derive(Serialize)]
pub struct RunJobResponse {
    pub job: Job,
    pub affected: usize,
}

/// Run a job right away
pub async fn run_job(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RunJobResponse>, (StatusCode, String)> {
    let job: Job = name
        .parse()
        .map_err(|e: Error| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let affected = scheduler::run_once(&state.tasks, job)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(RunJobResponse { job, affected }))
}
