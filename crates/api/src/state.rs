use std::sync::Arc;

use podflow_engine::Engine;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable: everything inside is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Job orchestration engine.
    pub engine: Arc<Engine>,
    pub config: Arc<ServerConfig>,
    /// Fires when the server starts shutting down; open WebSockets close.
    pub shutdown: CancellationToken,
}
