mod common;

use std::time::Duration;

use agentd::backend::{MockBackend, MockTurn};
use agentd::router::AuthConfig;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use common::*;
use serde_json::{json, Value};
use tower::util::ServiceExt;

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn health_lists_backends() {
    let test_app = TestApp::new(MockBackend::new());
    let (status, payload) = send_json(&test_app.app, Method::GET, "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload, json!({ "status": "ok", "backends": ["mock"] }));
}

#[tokio::test]
async fn openapi_document_covers_session_routes() {
    let test_app = TestApp::new(MockBackend::new());
    let (status, doc) = send_json(&test_app.app, Method::GET, "/v1/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    let paths = doc["paths"].as_object().expect("paths");
    for path in [
        "/v1/health",
        "/v1/tools",
        "/v1/sessions",
        "/v1/sessions/{session_id}",
        "/v1/sessions/{session_id}/messages",
        "/v1/sessions/{session_id}/events/sse",
        "/v1/sessions/{session_id}/cancel",
        "/v1/sessions/{session_id}/terminate",
        "/v1/sessions/{session_id}/approvals/{tool_use_id}",
    ] {
        assert!(paths.contains_key(path), "missing {path}");
    }
}

#[tokio::test]
async fn create_session_validates_input() {
    let test_app = TestApp::new(MockBackend::new());

    let (status, problem) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/sessions",
        Some(json!({ "backend": "anthropic" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["type"], "urn:agentd:error:backend_unavailable");
    assert_eq!(problem["backend"], "anthropic");

    let (status, _) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/sessions",
        Some(json!({ "backend": "nope" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, problem) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/sessions",
        Some(json!({ "backend": "mock", "options": { "workspace": "/definitely/not/here" } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["type"], "urn:agentd:error:invalid_request");
}

#[tokio::test]
async fn session_snapshot_and_listing() {
    let test_app = TestApp::new(MockBackend::new());
    let (status, payload) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/sessions",
        Some(json!({
            "conversationId": "conv-1",
            "backend": "mock",
            "options": { "model": "mock-large", "effort": "high", "maxTurns": 3 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let session_id = payload["sessionId"].as_str().expect("session id").to_string();

    let (status, info) = send_json(&test_app.app, Method::GET, &format!("/v1/sessions/{session_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["conversationId"], "conv-1");
    assert_eq!(info["backend"], "mock");
    assert_eq!(info["status"], "idle");
    assert_eq!(info["streamComplete"], true);
    assert_eq!(info["eventCount"], 0);
    assert_eq!(info["options"], json!({ "model": "mock-large", "effort": "high", "maxTurns": 3 }));

    let (_, list) = send_json(&test_app.app, Method::GET, "/v1/sessions", None).await;
    let ids: Vec<&str> = list["sessions"]
        .as_array()
        .expect("sessions")
        .iter()
        .filter_map(|session| session["sessionId"].as_str())
        .collect();
    assert_eq!(ids, vec![session_id.as_str()]);
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let test_app = TestApp::new(MockBackend::new());
    let (status, problem) = send_json(&test_app.app, Method::GET, "/v1/sessions/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(problem["sessionId"], "missing");

    let status = send_status(
        &test_app.app,
        Method::POST,
        "/v1/sessions/missing/messages",
        Some(json!({ "message": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = SseReader::open(&test_app.app, Method::GET, "/v1/sessions/missing/events/sse", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unscripted_turn_echoes_and_replays() {
    let test_app = TestApp::new(MockBackend::new());
    let session_id = create_session(&test_app.app, None).await;

    let (status, reader) = SseReader::open(
        &test_app.app,
        Method::GET,
        &format!("/v1/sessions/{session_id}/events/sse"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND, "nothing to replay before the first turn");
    assert!(reader.is_none());

    let (_, reader) = SseReader::open(
        &test_app.app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/messages"),
        Some(json!({ "message": "ping" })),
    )
    .await;
    let events = reader.expect("turn stream").collect(TIMEOUT).await;
    insta::assert_snapshot!(event_types(&events), @r"
    message_start
    content_block_start
    content_block_delta
    content_block_stop
    message_delta
    message_stop
    ");
    assert_eq!(events[2]["delta"]["text"], "echo: ping");
    assert!(events.iter().all(|event| event["session_id"] == session_id.as_str()));

    let (status, reader) = SseReader::open(
        &test_app.app,
        Method::GET,
        &format!("/v1/sessions/{session_id}/events/sse"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let replay = reader.expect("replay").collect(TIMEOUT).await;
    assert_eq!(replay, events);
}

#[tokio::test]
async fn empty_message_is_rejected() {
    let test_app = TestApp::new(MockBackend::new());
    let session_id = create_session(&test_app.app, None).await;
    let (status, problem) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/messages"),
        Some(json!({ "message": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["type"], "urn:agentd:error:invalid_request");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn busy_cancel_and_terminate() {
    let test_app = TestApp::new(MockBackend::with_turns([MockTurn::Stall(vec![json!({
        "type": "message_start",
        "message": {"id": "msg_1", "model": "mock"}
    })])]));
    let session_id = create_session(&test_app.app, None).await;

    let (_, reader) = SseReader::open(
        &test_app.app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/messages"),
        Some(json!({ "message": "think forever" })),
    )
    .await;
    let mut reader = reader.expect("turn stream");
    let first = reader.next_event(TIMEOUT).await.expect("message_start");
    assert_eq!(first["type"], "message_start");

    let (status, problem) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/messages"),
        Some(json!({ "message": "again" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(problem["type"], "urn:agentd:error:session_busy");

    // a live session reconnects even mid-turn
    let (status, replay) = SseReader::open(
        &test_app.app,
        Method::GET,
        &format!("/v1/sessions/{session_id}/events/sse"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let mut replay = replay.expect("replay");
    assert_eq!(replay.next_event(TIMEOUT).await.expect("replayed")["type"], "message_start");

    let status = send_status(&test_app.app, Method::POST, &format!("/v1/sessions/{session_id}/cancel"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let rest = reader.collect(TIMEOUT).await;
    assert_eq!(event_types(&rest), "message_delta\nmessage_stop");
    assert_eq!(rest[0]["delta"]["stop_reason"], "cancelled");
    let followed = replay.collect(TIMEOUT).await;
    assert_eq!(followed, rest);

    for _ in 0..2 {
        let status = send_status(&test_app.app, Method::POST, &format!("/v1/sessions/{session_id}/terminate"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
    let (status, problem) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/messages"),
        Some(json!({ "message": "hello?" })),
    )
    .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(problem["type"], "urn:agentd:error:session_terminated");
}

#[tokio::test]
async fn unknown_approval_is_not_found() {
    let test_app = TestApp::new(MockBackend::new());
    let session_id = create_session(&test_app.app, None).await;
    let (status, problem) = send_json(
        &test_app.app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/approvals/toolu_missing"),
        Some(json!({ "decision": "approve" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(problem["toolUseId"], "toolu_missing");
}

#[tokio::test]
async fn tool_surface_lists_builtins() {
    let test_app = TestApp::new(MockBackend::new());
    let (status, payload) = send_json(&test_app.app, Method::GET, "/v1/tools", None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = payload["tools"]
        .as_array()
        .expect("tools")
        .iter()
        .filter_map(|tool| tool["name"].as_str())
        .collect();
    for name in ["Read", "Write", "Edit", "Bash", "Glob", "Grep", "WebFetch", "WebSearch", "NotebookEdit"] {
        assert!(names.contains(&name), "missing {name}");
    }
    let bash = payload["tools"]
        .as_array()
        .and_then(|tools| tools.iter().find(|tool| tool["name"] == "Bash"))
        .expect("bash schema");
    assert_eq!(bash["input_schema"]["type"], "object");

    let status = send_status(&test_app.app, Method::GET, "/v1/tools?workspace=relative", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn token_guards_everything_but_health() {
    let test_app = TestApp::new_with_auth(MockBackend::new(), AuthConfig::with_token("secret".to_string()));

    let status = send_status(&test_app.app, Method::GET, "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, problem) = send_json(&test_app.app, Method::GET, "/v1/sessions", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(problem["type"], "urn:agentd:error:unauthorized");

    let request = Request::builder()
        .method(Method::GET)
        .uri("/v1/sessions")
        .header(header::AUTHORIZATION, "Bearer secret")
        .body(Body::empty())
        .expect("request");
    let response = test_app.app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_routes_fall_through() {
    let test_app = TestApp::new(MockBackend::new());
    let (status, payload) = send_json(&test_app.app, Method::GET, "/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(payload, Value::Null);
}
