use super::*;
use crate::types::Event;
use futures::StreamExt;

#[tokio::test]
async fn test_health_check() {
    let (app, _downloader, _temp_dir, _store, _sas) = create_test_app().await;

    let response = app.oneshot(empty_request("GET", "/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_sse_event_stream() {
    let (app, downloader, _temp_dir, _store, _sas) = create_test_app().await;

    let request = Request::builder()
        .uri("/api/download-zip/events")
        .header("Accept", "text/event-stream")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    assert!(
        content_type.contains("text/event-stream"),
        "Content-Type should be text/event-stream, got: {}",
        content_type
    );

    let mut body = response.into_body().into_data_stream();
    downloader.emit_event(Event::Shutdown);

    let frame = tokio::time::timeout(Duration::from_secs(2), body.next())
        .await
        .expect("no SSE frame received")
        .unwrap()
        .unwrap();
    let text = String::from_utf8(frame.to_vec()).unwrap();
    assert!(text.contains("event: shutdown"), "frame: {text}");
    assert!(text.contains(r#""type":"shutdown""#), "frame: {text}");
}
