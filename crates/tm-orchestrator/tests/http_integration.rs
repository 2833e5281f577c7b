//! HTTP API integration tests
//!
//! Requests go straight through the router with `oneshot`; no socket is
//! bound.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tm_orchestrator::http;

use common::{orchestrator, test_config};

fn app(config: tm_core::config::OrchestratorConfig) -> Router {
    http::router(Arc::new(orchestrator(config)))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let dir = tempfile::tempdir().unwrap();
    let (status, body) = send(app(test_config(dir.path())), get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["processes"], 0);
}

#[tokio::test]
async fn test_invalid_tunnel_request_is_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let request = post_json(
        "/tunnels",
        json!({
            "campaignName": "sale",
            "target": {"type": "url", "target_url": "http://localhost:3000"},
            "tunnelCount": 0,
            "mode": {"type": "free"}
        }),
    );
    let (status, body) = send(app(test_config(dir.path())), request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("Tunnel count"));
}

#[tokio::test]
async fn test_unknown_deployment_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(test_config(dir.path()));

    let (status, body) = send(app.clone(), get("/deployments/dep_missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    let (status, _) = send(app, get("/deployments/dep_missing/file?path=index.php")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_missing_tunnel_reports_not_removed() {
    let dir = tempfile::tempdir().unwrap();
    let request = Request::builder()
        .method("DELETE")
        .uri("/tunnels/tnl_missing")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app(test_config(dir.path())), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], false);
}

#[tokio::test]
async fn test_rejected_token_returns_account() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user/tokens/verify"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "success": false, "errors": [{"code": 9109, "message": "Unauthorized"}], "result": null
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.api_base_url = server.uri();
    let app = app(config);

    let request = post_json(
        "/accounts",
        json!({
            "type": "token",
            "label": "main",
            "account_id": "cf-acct",
            "api_token": "tok-123"
        }),
    );
    let (status, body) = send(app.clone(), request).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["account"]["status"], "error");
    assert!(!body.to_string().contains("tok-123"));

    let (status, accounts) = send(app, get("/accounts")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(accounts.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_login_for_unknown_account_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/accounts/acct_missing/login")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(app(test_config(dir.path())), request).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}
