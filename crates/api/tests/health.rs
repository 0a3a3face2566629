//! Integration tests for the health check endpoint and general HTTP behaviour.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use common::{body_json, get, TestApp};

// ---------------------------------------------------------------------------
// Test: GET /healthz returns 200 with expected JSON fields
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_check_returns_ok_with_json() {
    let app = TestApp::new(&["--nb-workers", "3"]);
    let response = get(app.router(), "/healthz").await;

    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert_eq!(json["workers"], 3);
    assert_eq!(json["running"], 0);
}

#[tokio::test]
async fn health_reports_stopping_after_shutdown() {
    let app = TestApp::new(&[]);
    app.hooks.shutdown(Duration::from_secs(1)).await;

    let json = body_json(get(app.router(), "/healthz").await).await;
    assert_eq!(json["status"], "stopping");
}

// ---------------------------------------------------------------------------
// Test: x-request-id header is present in response
// ---------------------------------------------------------------------------

#[tokio::test]
async fn response_contains_x_request_id_header() {
    let app = TestApp::new(&[]);
    let response = get(app.router(), "/healthz").await;

    let request_id = response.headers().get("x-request-id");
    assert!(
        request_id.is_some(),
        "Response must contain an x-request-id header"
    );

    // The value should be a valid UUID (36 chars with hyphens).
    let id_str = request_id.unwrap().to_str().unwrap();
    assert_eq!(id_str.len(), 36, "x-request-id should be a UUID string");
}
