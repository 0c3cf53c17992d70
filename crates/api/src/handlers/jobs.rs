//! Handlers for the `/jobs` resource.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use podflow_core::types::JobId;
use podflow_engine::JobFilter;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /api/jobs
///
/// Newest first. Supports optional `status`, `priority`, `limit` (default
/// 50, max 500) and `offset` query parameters.
pub async fn list_jobs(
    State(state): State<AppState>,
    params: Result<Query<JobFilter>, QueryRejection>,
) -> AppResult<impl IntoResponse> {
    let Query(filter) = params?;
    Ok(Json(DataResponse {
        data: state.engine.list(&filter),
    }))
}

/// GET /api/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let job = state.engine.get(job_id)?;
    Ok(Json(DataResponse { data: job }))
}

/// POST /api/jobs/{id}/cancel
///
/// A pending job comes back `cancelled`; a running job comes back `running`
/// and stops at its next stage boundary. 409 if already terminal.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let job = state.engine.cancel(job_id)?;
    Ok(Json(DataResponse { data: job }))
}

/// POST /api/jobs/{id}/retry
///
/// Re-enqueue a failed job. 409 for any other status.
pub async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let job = state.engine.retry(job_id)?;
    Ok(Json(DataResponse { data: job }))
}
