use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::PoolError;
use crate::store::{Job, JobId, JobStore};
use crate::worker::StatusFeed;

/// Read-only view over a running pool.
#[derive(Clone)]
pub struct DashboardState {
    pub store: Arc<dyn JobStore>,
    pub status: Arc<StatusFeed>,
}

#[derive(Serialize)]
struct WorkerResponse {
    worker_id: usize,
    job_id: Option<JobId>,
    phase: String,
}

#[derive(Serialize)]
struct JobResponse {
    id: JobId,
    target: String,
    status: String,
    result_code: Option<i32>,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            target: job.target,
            status: job.status.to_string(),
            result_code: job.result_code,
            error: job.error,
            created_at: job.created_at.to_rfc3339(),
            started_at: job.started_at.map(|t| t.to_rfc3339()),
            finished_at: job.finished_at.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Serialize)]
struct SummaryResponse {
    pending: usize,
    processing: usize,
    completed: usize,
    failed: usize,
    total: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorResponse { error: message })).into_response()
}

fn store_error(e: PoolError) -> Response {
    tracing::warn!(error = %e, "Dashboard query failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/workers", get(list_workers_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs/:id", get(get_job_handler))
        .route("/api/summary", get(summary_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the dashboard until `cancel` fires.
pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, cancel: CancellationToken) {
    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn list_workers_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let workers: Vec<WorkerResponse> = state
        .status
        .snapshot()
        .await
        .into_values()
        .map(|w| WorkerResponse {
            worker_id: w.worker_id,
            job_id: w.job_id,
            phase: w.phase.to_string(),
        })
        .collect();

    Json(workers)
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> Response {
    match state.store.list_terminal().await {
        Ok(jobs) => {
            let jobs: Vec<JobResponse> = jobs.into_iter().map(JobResponse::from).collect();
            Json(jobs).into_response()
        }
        Err(e) => store_error(e),
    }
}

async fn get_job_handler(State(state): State<DashboardState>, Path(id): Path<JobId>) -> Response {
    match state.store.get(id).await {
        Ok(Some(job)) => Json(JobResponse::from(job)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, PoolError::JobNotFound(id).to_string()),
        Err(e) => store_error(e),
    }
}

async fn summary_handler(State(state): State<DashboardState>) -> Response {
    match state.store.counts().await {
        Ok(counts) => Json(SummaryResponse {
            pending: counts.pending,
            processing: counts.processing,
            completed: counts.completed,
            failed: counts.failed,
            total: counts.total(),
        })
        .into_response(),
        Err(e) => store_error(e),
    }
}

/// Log job counts and worker phases every `interval` until `stop` fires.
pub async fn report_progress(
    state: DashboardState,
    interval: std::time::Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let counts = match state.store.counts().await {
                    Ok(counts) => counts,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read job counts");
                        continue;
                    }
                };
                let workers: Vec<String> = state
                    .status
                    .snapshot()
                    .await
                    .into_values()
                    .map(|w| match w.job_id {
                        Some(job_id) => format!("{}:{}#{}", w.worker_id, w.phase, job_id),
                        None => format!("{}:{}", w.worker_id, w.phase),
                    })
                    .collect();

                tracing::info!(
                    pending = counts.pending,
                    processing = counts.processing,
                    completed = counts.completed,
                    failed = counts.failed,
                    workers = ?workers,
                    "Progress"
                );
            }
        }
    }
}
