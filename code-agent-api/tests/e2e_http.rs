//! Route-level tests: request translation, status mapping, and the
//! conversation endpoints.

mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use code_agent_api::create_app;

async fn app_with_stub(script_body: &str) -> (Router, tempfile::TempDir) {
    let tmp = tempfile::TempDir::new().unwrap();
    let cli_path = common::write_stub_cli(tmp.path(), "agent-cli", script_body);
    let repos_root = tmp.path().join("repos");
    std::fs::create_dir_all(repos_root.join("repo")).unwrap();
    let settings = common::base_settings(&cli_path, &repos_root);
    let app = create_app(settings).await.unwrap();
    (app, tmp)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => {
            builder = builder.header("content-type", "application/json");
            builder.body(Body::from(body.to_string())).unwrap()
        },
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    };
    (status, value)
}

#[tokio::test]
async fn health_answers_ok() {
    let (app, _tmp) = app_with_stub("printf hi").await;
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("OK".into()));
}

#[tokio::test]
async fn sync_execute_returns_200_with_the_result() {
    let (app, _tmp) = app_with_stub("printf hi").await;
    let (status, body) = send(
        &app,
        "POST",
        "/v1/execute",
        Some(json!({"repository": "repo", "prompt": "hello", "queueType": "default"})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["stdout"], "hi");
    assert_eq!(body["exitCode"], 0);
    assert_eq!(body["repository"], "repo");
}

#[tokio::test]
async fn cli_failure_maps_to_422_with_captured_output() {
    let (app, _tmp) = app_with_stub("printf 'broken build' >&2; exit 4").await;
    let (status, body) = send(
        &app,
        "POST",
        "/v1/execute",
        Some(json!({"prompt": "hello"})),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["success"], false);
    assert_eq!(body["exitCode"], 4);
    assert_eq!(body["stderr"], "broken build");
}

#[tokio::test]
async fn empty_prompt_maps_to_400() {
    let (app, _tmp) = app_with_stub("printf hi").await;
    let (status, body) = send(&app, "POST", "/v1/execute", Some(json!({"prompt": " "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn unknown_repository_maps_to_404() {
    let (app, _tmp) = app_with_stub("printf hi").await;
    let (status, _) = send(
        &app,
        "POST",
        "/v1/execute",
        Some(json!({"prompt": "hello", "repository": "ghost"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn async_without_any_callback_maps_to_400() {
    let (app, _tmp) = app_with_stub("printf hi").await;
    let (status, body) = send(
        &app,
        "POST",
        "/v1/execute/async",
        Some(json!({"prompt": "hello"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("callback required")
    );
}

#[tokio::test]
async fn async_with_callback_returns_acceptance() {
    let (app, _tmp) = app_with_stub("printf hi").await;
    let (status, body) = send(
        &app,
        "POST",
        "/v1/execute/async",
        Some(json!({
            "requestId": "api-1712000000000-7777",
            "prompt": "hello",
            "callback": "http://127.0.0.1:9/cb"
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], true);
    assert_eq!(body["requestId"], "api-1712000000000-7777");
}

#[tokio::test]
async fn iterate_reports_iteration_counts() {
    let (app, _tmp) = app_with_stub("printf 'step [DONE]'").await;
    let (status, body) = send(
        &app,
        "POST",
        "/v1/iterate",
        Some(json!({"prompt": "hello", "maxIterations": 4})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["iterations"], 1);
    assert_eq!(body["maxIterations"], 4);
}

#[tokio::test]
async fn conversation_roundtrip_via_routes() {
    let (app, _tmp) = app_with_stub("printf reply").await;

    let (status, created) = send(
        &app,
        "POST",
        "/v1/conversations/new",
        Some(json!({"queueType": "default"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let conversation_id = created["conversationId"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app,
        "POST",
        "/v1/execute",
        Some(json!({"prompt": "hello", "conversationId": conversation_id})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, conversation) = send(
        &app,
        "GET",
        &format!("/v1/conversations/{conversation_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let messages = conversation["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[0]["content"], "hello");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"], "reply");
}

#[tokio::test]
async fn missing_conversation_maps_to_404() {
    let (app, _tmp) = app_with_stub("printf hi").await;
    let (status, _) = send(&app, "GET", "/v1/conversations/no-such-id", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn new_conversations_are_always_distinct() {
    let (app, _tmp) = app_with_stub("printf hi").await;
    let (_, first) = send(&app, "POST", "/v1/conversations/new", Some(json!({}))).await;
    let (_, second) = send(&app, "POST", "/v1/conversations/new", Some(json!({}))).await;
    assert_ne!(first["conversationId"], second["conversationId"]);
}

#[tokio::test]
async fn agent_namespace_has_its_own_conversations() {
    let (app, _tmp) = app_with_stub("printf hi").await;
    let (status, created) = send(
        &app,
        "POST",
        "/v1/agent-conversations/new",
        Some(json!({"queueType": "api"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["queueType"], "api");

    // The id lives in the agent namespace only.
    let id = created["conversationId"].as_str().unwrap();
    let (status, _) = send(&app, "GET", &format!("/v1/conversations/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn queue_status_reports_capacity() {
    let (app, _tmp) = app_with_stub("printf hi").await;
    let (status, body) = send(&app, "GET", "/v1/queue/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["available"], 2);
    assert_eq!(body["maxConcurrent"], 2);
    assert_eq!(body["waiting"], 0);
    assert!(body.get("warning").is_none());
}

#[tokio::test]
async fn request_id_header_is_echoed() {
    let (app, _tmp) = app_with_stub("printf hi").await;
    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .header("x-request-id", "trace-me")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(
        response.headers().get("x-request-id").unwrap(),
        "trace-me"
    );
}
