//! Route definitions for job submission.

use axum::routing::post;
use axum::Router;

use crate::handlers::generate;
use crate::state::AppState;

/// Routes mounted at `/generate`.
///
/// ```text
/// POST   /                -> submit_job
/// POST   /batch           -> submit_batch
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(generate::submit_job))
        .route("/batch", post(generate::submit_batch))
}
