//! HTTP API tests

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use pressbuild::server::serve::router;
use pressbuild::server::state::ServerState;

use crate::support::{Harness, HOST, WEBSITE_ID};

fn app(harness: &Harness) -> Router {
    router(Arc::new(ServerState::new(harness.orchestrator.clone())))
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_health_reports_active_runs() {
    let harness = Harness::new().await;
    let (status, body) = call(&app(&harness), Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["active_runs"], 0);
}

#[tokio::test]
async fn test_register_and_provision() {
    let harness = Harness::new().await;
    let app = app(&harness);

    let (status, body) = call(
        &app,
        Method::POST,
        "/websites",
        Some(json!({
            "owner_id": "owner-2",
            "domain": "blog.example.net",
            "connection": {"host": HOST, "port": 22, "username": "root", "credential_ref": "cred-1"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "pending");
    let id = body["id"].as_str().unwrap().to_string();

    let (status, body) = call(&app, Method::POST, &format!("/websites/{}/provision", id), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "building");
    assert!(body["run_id"].is_string());

    let mut last = Value::Null;
    for _ in 0..200 {
        let (status, body) = call(&app, Method::GET, &format!("/websites/{}/status", id), None).await;
        assert_eq!(status, StatusCode::OK);
        last = body;
        if last["status"] == "active" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(last["status"], "active");
    assert_eq!(last["build_progress"]["percent"], 100);
    assert!(!last.to_string().contains(HOST));
}

#[tokio::test]
async fn test_register_rejects_duplicates_and_bad_fields() {
    let harness = Harness::new().await;
    let app = app(&harness);
    let connection = json!({"host": HOST, "port": 22, "username": "root", "credential_ref": "cred-1"});

    let (status, _) = call(
        &app,
        Method::POST,
        "/websites",
        Some(json!({"id": WEBSITE_ID, "owner_id": "o", "domain": "example.com", "connection": connection})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(
        &app,
        Method::POST,
        "/websites",
        Some(json!({"owner_id": "o", "domain": "bad domain;rm", "connection": connection})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, body) = call(
        &app,
        Method::POST,
        "/websites",
        Some(json!({"id": "../x", "owner_id": "o", "domain": "example.org", "connection": connection})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{}", body);
}

#[tokio::test]
async fn test_provision_errors() {
    let harness = Harness::new().await;
    let app = app(&harness);

    let (status, _) = call(&app, Method::POST, "/websites/nope/provision", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/websites/{}/provision", WEBSITE_ID),
        Some(json!({"connection": {"host": "", "port": 22, "username": "root", "credential_ref": "c"}})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (entered, release) = harness.remote.gate_step("build_1");
    let (status, _) = call(&app, Method::POST, &format!("/websites/{}/provision", WEBSITE_ID), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    entered.notified().await;

    let (status, body) = call(&app, Method::POST, &format!("/websites/{}/provision", WEBSITE_ID), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].is_string());

    let (status, body) = call(&app, Method::POST, &format!("/websites/{}/cancel", WEBSITE_ID), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["cancelled"], true);
    release.notify_one();
}

#[tokio::test]
async fn test_cancel_and_status_unknown() {
    let harness = Harness::new().await;
    let app = app(&harness);

    let (status, body) = call(&app, Method::POST, "/websites/nope/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["cancelled"], false);

    let (status, _) = call(&app, Method::GET, "/websites/nope/status", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
