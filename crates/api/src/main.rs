use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use podflow_api::config::{CollaboratorConfig, ServerConfig};
use podflow_api::router::build_app_router;
use podflow_api::state::AppState;
use podflow_api::wiring::build_collaborators;
use podflow_engine::{Engine, EngineConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "podflow_api=debug,podflow_engine=debug,podflow_pipeline=info,tower_http=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    let engine_config = EngineConfig::from_env();
    let collaborator_config = CollaboratorConfig::from_env();
    tracing::info!(
        host = %config.host,
        port = config.port,
        max_concurrent_jobs = engine_config.max_concurrent_jobs,
        "Loaded configuration",
    );
    if collaborator_config.is_empty() {
        tracing::warn!("No collaborator URLs configured; running fully in-memory");
    }

    // --- Engine ---
    let collaborators = build_collaborators(&collaborator_config, engine_config.call_timeout);
    let engine = Arc::new(Engine::new(engine_config, collaborators));
    engine.start();
    tracing::info!(platforms = ?engine.platforms(), "Engine started");

    // --- App state ---
    let shutdown = CancellationToken::new();
    let state = AppState {
        engine: Arc::clone(&engine),
        config: Arc::new(config.clone()),
        shutdown: shutdown.clone(),
    };
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    engine
        .shutdown(Duration::from_secs(config.shutdown_timeout_secs))
        .await;

    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM, then cancel `shutdown`
/// so open WebSockets close and the server can drain.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
    shutdown.cancel();
}
