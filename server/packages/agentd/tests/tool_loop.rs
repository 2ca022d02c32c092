mod common;

use std::time::Duration;

use agentd::backend::MockBackend;
use agentd::store::{MessageContent, MessageRole};
use axum::http::{Method, StatusCode};
use common::*;
use serde_json::json;

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn approved_bash_runs_and_result_is_fed_back() {
    let test_app = TestApp::new(MockBackend::with_turns([
        MockBackend::tool_use_turn("toolu_1", "Bash", json!({"command": "echo hello"})),
        MockBackend::text_turn("the command printed hello"),
    ]));
    let session_id = create_session(&test_app.app, Some(test_app.workspace_path())).await;

    let (status, reader) = SseReader::open(
        &test_app.app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/messages"),
        Some(json!({ "message": "say hello with bash" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let mut reader = reader.expect("turn stream");

    let mut events = Vec::new();
    loop {
        let event = reader.next_event(TIMEOUT).await.expect("tool_use_start before timeout");
        events.push(event.clone());
        if event["type"] == "tool_use_start" {
            assert_eq!(event["name"], "Bash");
            assert_eq!(event["id"], "toolu_1");
            assert_eq!(event["requires_approval"], true);
            break;
        }
    }

    let (status, info) = send_json(&test_app.app, Method::GET, &format!("/v1/sessions/{session_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["status"], "running");
    assert_eq!(info["pendingApprovals"], json!(["toolu_1"]));

    let status = send_status(
        &test_app.app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/approvals/toolu_1"),
        Some(json!({ "decision": "approve" })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    events.extend(reader.collect(TIMEOUT).await);
    insta::assert_snapshot!(event_types(&events), @r"
    message_start
    content_block_start
    content_block_delta
    content_block_stop
    message_delta
    message_stop
    tool_use_start
    tool_result
    message_start
    content_block_start
    content_block_delta
    content_block_stop
    message_delta
    message_stop
    ");

    let result = events
        .iter()
        .find(|event| event["type"] == "tool_result")
        .expect("tool result");
    assert_eq!(result["tool_use_id"], "toolu_1");
    assert_eq!(result["content"], "hello");
    assert_eq!(result["is_error"], false);

    let sequences: Vec<u64> = events
        .iter()
        .map(|event| event["sequence"].as_u64().expect("sequence"))
        .collect();
    assert_eq!(sequences, (1..=events.len() as u64).collect::<Vec<_>>());

    // the second model turn saw the tool result as a user message
    let requests = test_app.backend.requests();
    assert_eq!(requests.len(), 2);
    let last = requests[1].messages.last().expect("transcript");
    assert_eq!(last.role, MessageRole::User);
    assert!(matches!(
        &last.content[..],
        [MessageContent::ToolResult { tool_use_id, is_error: false, .. }] if tool_use_id == "toolu_1"
    ));

    let (_, info) = send_json(&test_app.app, Method::GET, &format!("/v1/sessions/{session_id}"), None).await;
    assert_eq!(info["status"], "idle");
    assert_eq!(info["streamComplete"], true);
    assert_eq!(info["pendingApprovals"], json!([]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn denied_bash_never_runs() {
    let test_app = TestApp::new(MockBackend::with_turns([
        MockBackend::tool_use_turn("toolu_1", "Bash", json!({"command": "touch marker"})),
        MockBackend::text_turn("ok, skipped"),
    ]));
    let session_id = create_session(&test_app.app, Some(test_app.workspace_path())).await;

    let (_, reader) = SseReader::open(
        &test_app.app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/messages"),
        Some(json!({ "message": "make a marker" })),
    )
    .await;
    let mut reader = reader.expect("turn stream");
    let mut events = Vec::new();
    while let Some(event) = reader.next_event(TIMEOUT).await {
        let is_start = event["type"] == "tool_use_start";
        events.push(event);
        if is_start {
            break;
        }
    }

    let status = send_status(
        &test_app.app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/approvals/toolu_1"),
        Some(json!({ "decision": "deny" })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    events.extend(reader.collect(TIMEOUT).await);
    let result = events
        .iter()
        .find(|event| event["type"] == "tool_result")
        .expect("tool result");
    assert_eq!(result["content"], "denied by user");
    assert_eq!(result["is_error"], true);
    assert!(!test_app.workspace_path().join("marker").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_only_tools_skip_approval() {
    let test_app = TestApp::new(MockBackend::with_turns([
        MockBackend::tool_use_turn("toolu_1", "Read", json!({"file_path": "notes.txt"})),
        MockBackend::text_turn("read it"),
    ]));
    std::fs::write(test_app.workspace_path().join("notes.txt"), "first\nsecond\n").expect("write notes");
    let session_id = create_session(&test_app.app, Some(test_app.workspace_path())).await;

    let (_, reader) = SseReader::open(
        &test_app.app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/messages"),
        Some(json!({ "message": "read my notes" })),
    )
    .await;
    let events = reader.expect("turn stream").collect(TIMEOUT).await;

    let start = events
        .iter()
        .find(|event| event["type"] == "tool_use_start")
        .expect("tool start");
    assert_eq!(start["requires_approval"], false);
    let result = events
        .iter()
        .find(|event| event["type"] == "tool_result")
        .expect("tool result");
    assert_eq!(result["is_error"], false);
    assert!(result["content"].as_str().unwrap_or_default().contains("second"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paths_outside_the_workspace_are_refused() {
    let test_app = TestApp::new(MockBackend::with_turns([
        MockBackend::tool_use_turn("toolu_1", "Read", json!({"file_path": "/etc/hostname"})),
        MockBackend::text_turn("could not read"),
    ]));
    let session_id = create_session(&test_app.app, Some(test_app.workspace_path())).await;

    let (_, reader) = SseReader::open(
        &test_app.app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/messages"),
        Some(json!({ "message": "read the hostname" })),
    )
    .await;
    let events = reader.expect("turn stream").collect(TIMEOUT).await;
    let result = events
        .iter()
        .find(|event| event["type"] == "tool_result")
        .expect("tool result");
    assert_eq!(result["is_error"], true);
}
