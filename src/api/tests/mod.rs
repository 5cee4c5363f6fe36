use super::*;
use crate::downloader::test_helpers::{MemoryBlobStore, StaticSasProvider};
use axum::body::Body;
use axum::extract::Request;
use axum::http::StatusCode;
use std::time::Duration;
use tower::ServiceExt;

mod system;

/// Helper to create a test ZipDownloader wrapped in Arc, plus its router
async fn create_test_app() -> (
    Router,
    Arc<ZipDownloader>,
    tempfile::TempDir,
    Arc<MemoryBlobStore>,
    Arc<StaticSasProvider>,
) {
    let (downloader, temp_dir, store, sas) =
        crate::downloader::test_helpers::create_test_downloader().await;
    let downloader = Arc::new(downloader);
    let app = create_router(downloader.clone(), downloader.get_config());
    (app, downloader, temp_dir, store, sas)
}

/// Read a response body as JSON
async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_api_server_spawns() {
    let (_app, downloader, _temp_dir, _store, _sas) = create_test_app().await;

    // Port 0 = OS assigns a free port
    let mut config = (*downloader.get_config()).clone();
    config.api.bind_address = "127.0.0.1:0".parse().unwrap();
    let config = Arc::new(config);

    let api_handle = tokio::spawn({
        let downloader = downloader.clone();
        let config = config.clone();
        async move { start_api_server(downloader, config).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!api_handle.is_finished(), "server exited early");
    api_handle.abort();
}

#[tokio::test]
async fn test_cors_enabled() {
    let (app, _downloader, _temp_dir, _store, _sas) = create_test_app().await;

    let request = Request::builder()
        .uri("/health")
        .header("Origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
}

#[tokio::test]
async fn test_cors_specific_origins() {
    let (_app, downloader, _temp_dir, _store, _sas) = create_test_app().await;

    let mut config = (*downloader.get_config()).clone();
    config.api.cors_origins = vec!["https://portal.example.com".to_string()];
    let app = create_router(downloader, Arc::new(config));

    let allowed = Request::builder()
        .uri("/health")
        .header("Origin", "https://portal.example.com")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(allowed).await.unwrap();
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("https://portal.example.com")
    );

    let other = Request::builder()
        .uri("/health")
        .header("Origin", "https://evil.example.com")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(other).await.unwrap();
    assert!(response.headers().get("access-control-allow-origin").is_none());
}

#[tokio::test]
async fn test_cors_disabled() {
    let (_app, downloader, _temp_dir, _store, _sas) = create_test_app().await;

    let mut config = (*downloader.get_config()).clone();
    config.api.cors_enabled = false;
    let app = create_router(downloader, Arc::new(config));

    let request = Request::builder()
        .uri("/health")
        .header("Origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert!(response.headers().get("access-control-allow-origin").is_none());
}
