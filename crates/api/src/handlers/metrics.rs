use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /api/metrics
///
/// Job counters, queue depth, per-platform publish outcomes, stage timings,
/// breaker and cache snapshots.
pub async fn get_metrics(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let snapshot = state.engine.metrics().await;
    Ok(Json(DataResponse { data: snapshot }))
}
