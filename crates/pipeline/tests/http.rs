//! HTTP connectors against a local stub service.
//!
//! The stub answers `POST /{case}/prompts` according to `case`, so each test
//! points an [`HttpService`] at a different base URL on the same server.

use std::net::SocketAddr;
use std::time::Duration;

use assert_matches::assert_matches;
use axum::extract::Path;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use podflow_core::error::{ErrorKind, ServiceError, TimeoutScope};
use podflow_pipeline::collaborators::PromptGenerator;
use podflow_pipeline::http::{HttpPromptGenerator, HttpService};

async fn prompts(Path(case): Path<String>) -> Response {
    match case.as_str() {
        "ok" => Json(serde_json::json!({
            "prompts": [{ "text": "a neon tiger", "title": "Neon Tiger" }]
        }))
        .into_response(),
        "rate-limited" => (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, "3")],
            "slow down",
        )
            .into_response(),
        "unavailable" => (StatusCode::SERVICE_UNAVAILABLE, "maintenance").into_response(),
        "request-timeout" => StatusCode::REQUEST_TIMEOUT.into_response(),
        "forbidden" => (StatusCode::FORBIDDEN, "bad api key").into_response(),
        "unprocessable" => (StatusCode::UNPROCESSABLE_ENTITY, "theme rejected").into_response(),
        "malformed" => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            "{\"prompts\": [",
        )
            .into_response(),
        "slow" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            StatusCode::OK.into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn spawn_stub() -> SocketAddr {
    let app = Router::new().route("/{case}/prompts", post(prompts));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn call(addr: SocketAddr, case: &str) -> Result<Vec<String>, ServiceError> {
    let svc = HttpService::new(format!("http://{addr}/{case}"), Duration::from_secs(2));
    let prompts = HttpPromptGenerator(svc).generate("abstract").await?;
    Ok(prompts.into_iter().map(|p| p.text).collect())
}

#[tokio::test]
async fn success_body_is_decoded() {
    let addr = spawn_stub().await;
    assert_eq!(call(addr, "ok").await.unwrap(), vec!["a neon tiger"]);
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let addr = spawn_stub().await;
    let err = call(addr, "rate-limited").await.unwrap_err();

    assert_matches!(err, ServiceError::RateLimited { .. });
    assert!(err.is_transient());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
}

#[tokio::test]
async fn server_errors_and_request_timeouts_are_transient() {
    let addr = spawn_stub().await;

    let err = call(addr, "unavailable").await.unwrap_err();
    assert_matches!(
        err,
        ServiceError::ExternalService { status: Some(503), transient: true, .. }
    );
    assert!(err.to_string().contains("maintenance"));

    let err = call(addr, "request-timeout").await.unwrap_err();
    assert_matches!(
        err,
        ServiceError::ExternalService { status: Some(408), transient: true, .. }
    );
    assert_eq!(err.retry_after(), None);
}

#[tokio::test]
async fn client_errors_are_permanent() {
    let addr = spawn_stub().await;

    for (case, code) in [("forbidden", 403), ("unprocessable", 422), ("missing", 404)] {
        let err = call(addr, case).await.unwrap_err();
        assert_matches!(
            err,
            ServiceError::ExternalService { status: Some(s), transient: false, .. } if s == code
        );
        assert!(!err.is_transient());
    }
}

#[tokio::test]
async fn undecodable_body_is_permanent() {
    let addr = spawn_stub().await;
    let err = call(addr, "malformed").await.unwrap_err();

    assert_matches!(err, ServiceError::ExternalService { status: None, transient: false, .. });
    assert_eq!(err.kind(), ErrorKind::ExternalServiceError);
    assert!(!err.is_transient());
}

#[tokio::test]
async fn slow_response_hits_the_transport_timeout() {
    let addr = spawn_stub().await;
    let svc = HttpService::new(format!("http://{addr}/slow"), Duration::from_millis(200));
    let err = HttpPromptGenerator(svc).generate("abstract").await.unwrap_err();

    assert_matches!(err, ServiceError::Timeout { scope: TimeoutScope::Call, .. });
    assert!(err.is_transient());
}
