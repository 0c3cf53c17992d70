//! Handlers for job submission.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use podflow_core::job::Priority;
use podflow_core::request::PipelineRequest;
use podflow_core::types::JobId;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// One pipeline request plus its dispatch priority (default `normal`).
#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(flatten)]
    pub request: PipelineRequest,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub items: Vec<GenerateRequest>,
}

#[derive(Debug, Serialize)]
pub struct Submitted {
    pub job_id: JobId,
}

#[derive(Debug, Serialize)]
pub struct BatchSubmitted {
    pub job_ids: Vec<JobId>,
}

/// POST /api/generate
///
/// Validate and enqueue one job. Returns 201 with its id; the job starts
/// `pending` and is picked up by the worker pool.
pub async fn submit_job(
    State(state): State<AppState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(input) = payload?;
    let job_id = state.engine.submit(input.request, input.priority)?;
    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: Submitted { job_id },
        }),
    ))
}

/// POST /api/generate/batch
///
/// Validate every item, then enqueue all of them or none. Returns 201 with
/// the ids in request order.
pub async fn submit_batch(
    State(state): State<AppState>,
    payload: Result<Json<BatchRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(input) = payload?;
    let requests = input
        .items
        .into_iter()
        .map(|item| (item.request, item.priority))
        .collect();
    let job_ids = state.engine.submit_batch(requests)?;
    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: BatchSubmitted { job_ids },
        }),
    ))
}
