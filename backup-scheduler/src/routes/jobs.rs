use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use backup_engine::job::{Job, JobLogEntry, NewJob};
use backup_engine::RunOutcome;
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_jobs).post(create_job))
        .route("/{id}", get(get_job))
        .route("/{id}/abort", post(abort_job))
        .route("/{id}/start-over", post(start_over_job))
        .route("/{id}/run", post(run_job))
        .route("/{id}/logs", get(get_job_logs))
}

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<Job>>, AppError> {
    let limit = query.limit.unwrap_or(50);
    let jobs = state.with_queue(move |queue| queue.list(limit)).await?;
    Ok(Json(jobs))
}

async fn get_job(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Result<Json<Job>, AppError> {
    let job = state.with_queue(move |queue| queue.get(id)).await?;
    Ok(Json(job))
}

async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewJob>,
) -> Result<(StatusCode, Json<Job>), AppError> {
    if body.target_id.trim().is_empty() {
        return Err(AppError::BadRequest("target_id is required".into()));
    }
    if !body.item_data.is_object() {
        return Err(AppError::BadRequest("item_data must be a JSON object".into()));
    }

    let job = state.with_queue(move |queue| queue.enqueue(body)).await?;
    tracing::info!(job_id = job.id, job_type = %job.job_type, target = %job.target_id, "Job queued");
    Ok((StatusCode::CREATED, Json(job)))
}

async fn abort_job(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Result<Json<Job>, AppError> {
    let job = state.with_queue(move |queue| queue.abort(id)).await?;
    Ok(Json(job))
}

async fn start_over_job(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Result<Json<Job>, AppError> {
    let job = state.with_queue(move |queue| queue.start_over(id)).await?;
    Ok(Json(job))
}

/// Run one invocation of this job now, outside the tick schedule.
async fn run_job(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Result<Json<RunOutcome>, AppError> {
    match state.run_exclusive(move |worker| worker.run_job(id)).await? {
        Some(outcome) => Ok(Json(outcome)),
        None => Err(AppError::Conflict("worker is busy, try again shortly".into())),
    }
}

async fn get_job_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<JobLogEntry>>, AppError> {
    let limit = query.limit.unwrap_or(200);
    let logs = state
        .with_queue(move |queue| {
            queue.get(id)?;
            queue.logs(id, limit)
        })
        .await?;
    Ok(Json(logs))
}
