use axum::routing::get;
use axum::Router;

use crate::handlers::metrics;
use crate::state::AppState;

/// Routes mounted at `/metrics`.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(metrics::get_metrics))
}
