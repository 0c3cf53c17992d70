pub mod generate;
pub mod health;
pub mod jobs;
pub mod metrics;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Build the `/api` route tree.
///
/// ```text
/// /ws                      WebSocket event stream
/// /metrics                 stats snapshot (GET)
/// /generate                submit one job (POST)
/// /generate/batch          submit many jobs (POST)
/// /jobs                    list (GET)
/// /jobs/{id}               get (GET)
/// /jobs/{id}/cancel        cancel (POST)
/// /jobs/{id}/retry         retry (POST)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .nest("/metrics", metrics::router())
        .nest("/generate", generate::router())
        .nest("/jobs", jobs::router())
}
