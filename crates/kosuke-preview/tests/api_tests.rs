//! API integration tests.

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use std::sync::atomic::Ordering;
use tower::ServiceExt;

mod common;
use common::{WarmingProbe, test_app, test_env, test_env_with_probe};

const PREVIEW: &str = "/api/projects/proj-1/chat-sessions/sess-1/preview";

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().uri(uri).method(method);
    let body = match body {
        Some(json) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_string(&json).unwrap())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app();

    let (status, json) = send(&app, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_start_preview_provisions_session() {
    let env = test_env();

    let (status, json) = send(&env.app, Method::POST, PREVIEW, Some(json!({}))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        json["previewUrl"],
        "http://kosuke_preview_proj_1_sess_1_app:3000"
    );
    assert_eq!(json["running"], true);
    assert_eq!(json["is_responding"], false);
    assert_eq!(json["status"], "loading");

    assert_eq!(
        env.daemon.names(),
        vec![
            "kosuke_preview_proj_1_sess_1_app".to_string(),
            "kosuke_preview_proj_1_sess_1_redis".to_string(),
        ]
    );
    assert_eq!(
        env.postgres.databases(),
        vec!["kosuke_preview_proj_1_sess_1".to_string()]
    );

    let labels = env.daemon.labels("kosuke_preview_proj_1_sess_1_app").unwrap();
    assert_eq!(labels["project_id"], "proj-1");
    assert_eq!(labels["session_id"], "sess-1");
}

#[tokio::test]
async fn test_start_preview_without_body_uses_defaults() {
    let env = test_env();

    let (status, _) = send(&env.app, Method::POST, PREVIEW, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(env.daemon.names().len(), 2);
}

#[tokio::test]
async fn test_start_preview_rejects_malformed_body() {
    let app = test_app();

    let response = app
        .oneshot(
            Request::builder()
                .uri(PREVIEW)
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_start_preview_is_idempotent() {
    let env = test_env();

    let (_, first) = send(&env.app, Method::POST, PREVIEW, Some(json!({}))).await;
    let (status, second) = send(&env.app, Method::POST, PREVIEW, Some(json!({}))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["previewUrl"], second["previewUrl"]);
    assert_eq!(env.daemon.names().len(), 2);
    assert_eq!(env.postgres.databases().len(), 1);
}

#[tokio::test]
async fn test_request_storages_override_defaults() {
    let env = test_env();

    let (status, _) = send(
        &env.app,
        Method::POST,
        PREVIEW,
        Some(json!({ "storages": { "main": { "type": "postgres" } } })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        env.daemon.names(),
        vec!["kosuke_preview_proj_1_sess_1_app".to_string()]
    );
    assert_eq!(env.postgres.databases().len(), 1);
}

#[tokio::test]
async fn test_get_preview_reports_ready_once_responding() {
    let env = test_env();
    send(&env.app, Method::POST, PREVIEW, Some(json!({}))).await;

    let (status, json) = send(&env.app, Method::GET, PREVIEW, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["url"], "http://kosuke_preview_proj_1_sess_1_app:3000");
    assert_eq!(json["running"], true);
    assert_eq!(json["is_responding"], true);
    assert_eq!(json["status"], "ready");
}

#[tokio::test]
async fn test_get_unknown_preview_is_not_found() {
    let app = test_app();

    let (status, json) = send(&app, Method::GET, PREVIEW, None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_preview_health_reflects_probe() {
    let env = test_env_with_probe(WarmingProbe::default());
    send(&env.app, Method::POST, PREVIEW, Some(json!({}))).await;
    let health = format!("{PREVIEW}/health");

    let (status, json) = send(&env.app, Method::GET, &health, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], false);
    assert_eq!(json["running"], true);

    env.probe.responding_after.store(1, Ordering::SeqCst);
    let (_, json) = send(&env.app, Method::GET, &health, None).await;
    assert_eq!(json["ok"], true);
    assert_eq!(json["is_responding"], true);
}

#[tokio::test]
async fn test_preview_health_of_unknown_session_is_not_found() {
    let app = test_app();

    let (status, _) = send(&app, Method::GET, &format!("{PREVIEW}/health"), None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_preview_releases_everything() {
    let env = test_env();
    send(&env.app, Method::POST, PREVIEW, Some(json!({}))).await;

    let (status, _) = send(&env.app, Method::DELETE, PREVIEW, None).await;

    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(env.daemon.names().is_empty());
    assert!(env.postgres.databases().is_empty());

    let (status, _) = send(&env.app, Method::GET, PREVIEW, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_reports_partial_teardown() {
    let env = test_env();
    send(&env.app, Method::POST, PREVIEW, Some(json!({}))).await;
    env.daemon.fail_removes.store(true, Ordering::SeqCst);

    let (status, json) = send(&env.app, Method::DELETE, PREVIEW, None).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(json["code"], "BAD_GATEWAY");
    assert!(json["error"].as_str().unwrap().contains("cache"));
    // The failing cache did not stop the rest of the teardown
    assert!(env.postgres.databases().is_empty());
    assert_eq!(
        env.daemon.names(),
        vec!["kosuke_preview_proj_1_sess_1_redis".to_string()]
    );
}

#[tokio::test]
async fn test_list_previews() {
    let env = test_env();
    send(&env.app, Method::POST, PREVIEW, Some(json!({}))).await;
    send(
        &env.app,
        Method::POST,
        "/api/projects/proj-1/chat-sessions/sess-2/preview",
        Some(json!({})),
    )
    .await;

    let (status, json) = send(&env.app, Method::GET, "/api/previews", None).await;

    assert_eq!(status, StatusCode::OK);
    let sessions = json.as_array().unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0]["session_id"], "sess-1");
    assert_eq!(sessions[1]["session_id"], "sess-2");
    assert!(sessions[0]["last_activity_at"].is_string());
    assert_eq!(sessions[0]["status"], "loading");
}
