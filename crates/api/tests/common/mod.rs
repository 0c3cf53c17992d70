#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use podflow_api::config::ServerConfig;
use podflow_api::router::build_app_router;
use podflow_api::state::AppState;
use podflow_engine::{Engine, EngineConfig};
use podflow_pipeline::collaborators::Collaborators;
use podflow_pipeline::memory::{
    MemoryAssetStore, MemoryImageGenerator, MemoryPromptGenerator, MemoryPublisher,
};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
    }
}

/// The app plus handles on its in-memory collaborators.
pub struct TestApp {
    pub router: Router,
    pub engine: Arc<Engine>,
    pub images: Arc<MemoryImageGenerator>,
    pub shop_a: Arc<MemoryPublisher>,
}

/// Build the full application router over an engine with in-memory
/// collaborators and one publisher, `shop_a`. The worker pool is not
/// started, so submitted jobs stay `pending` unless a test calls
/// `engine.start()`.
pub fn build_test_app() -> TestApp {
    let images = Arc::new(MemoryImageGenerator::new());
    let shop_a = Arc::new(MemoryPublisher::new("shop_a"));
    let collaborators = Collaborators::new(
        Arc::new(MemoryPromptGenerator::new()),
        images.clone(),
        Arc::new(MemoryAssetStore::new()),
    )
    .with_publisher(shop_a.clone());

    let engine_config = EngineConfig {
        retry_initial_delay: Duration::from_millis(10),
        retry_jitter: false,
        ..EngineConfig::default()
    };
    let engine = Arc::new(Engine::new(engine_config, collaborators));

    let config = test_config();
    let state = AppState {
        engine: Arc::clone(&engine),
        config: Arc::new(config.clone()),
        shutdown: CancellationToken::new(),
    };

    TestApp {
        router: build_app_router(state, &config),
        engine,
        images,
        shop_a,
    }
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn post_json(app: &Router, uri: &str, body: serde_json::Value) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn post_empty(app: &Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
