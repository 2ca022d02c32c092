#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agentd::approval::LoggingApprovalChannel;
use agentd::backend::{Backend, MockBackend};
use agentd::config::FileSettingsStore;
use agentd::mcp::ExternalToolRegistry;
use agentd::orchestrator::{Orchestrator, DEFAULT_MAX_ITERATIONS};
use agentd::router::{build_router, AppState, AuthConfig};
use agentd::sandbox::SandboxGuard;
use agentd::session::{SessionManager, DEFAULT_EVENT_BUFFER};
use agentd::store::{ConversationStore, InMemoryConversationStore};
use agentd::tools::{DangerPolicy, ToolDispatcher};
use axum::body::{Body, Bytes};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use futures::stream::BoxStream;
use futures::StreamExt;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

pub struct TestApp {
    pub app: Router,
    pub backend: Arc<MockBackend>,
    pub workspace: TempDir,
    _config_dir: TempDir,
}

impl TestApp {
    pub fn new(backend: MockBackend) -> Self {
        Self::new_with_auth(backend, AuthConfig::disabled())
    }

    pub fn new_with_auth(backend: MockBackend, auth: AuthConfig) -> Self {
        let config_dir = tempfile::tempdir().expect("create temp config dir");
        let workspace = tempfile::tempdir().expect("create temp workspace");
        let backend = Arc::new(backend);

        let guard = SandboxGuard::new(config_dir.path().to_path_buf(), Arc::new(FileSettingsStore));
        let registry = ExternalToolRegistry::new(
            Duration::from_secs(2),
            Duration::from_secs(2),
            Duration::from_secs(60),
            DangerPolicy::default(),
        );
        let dispatcher = ToolDispatcher::new(guard, Arc::new(registry), Duration::from_secs(10), None);
        let store: Arc<dyn ConversationStore> = Arc::new(InMemoryConversationStore::new());
        let orchestrator = Orchestrator::new(
            Arc::new(dispatcher),
            Arc::new(LoggingApprovalChannel),
            Arc::clone(&store),
            DangerPolicy::default(),
            DEFAULT_MAX_ITERATIONS,
        );
        let backends: [Arc<dyn Backend>; 1] = [backend.clone()];
        let manager = SessionManager::new(Arc::new(orchestrator), store, backends, DEFAULT_EVENT_BUFFER);
        let app = build_router(AppState::new(auth, manager));
        Self {
            app,
            backend,
            workspace,
            _config_dir: config_dir,
        }
    }

    pub fn workspace_path(&self) -> &Path {
        self.workspace.path()
    }
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.map(|value| value.to_string()).unwrap_or_default()))
        .expect("request");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let payload = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, payload)
}

pub async fn send_status(app: &Router, method: Method, path: &str, body: Option<Value>) -> StatusCode {
    send_json(app, method, path, body).await.0
}

pub async fn create_session(app: &Router, workspace: Option<&Path>) -> String {
    let mut body = json!({ "backend": "mock" });
    if let Some(workspace) = workspace {
        body["options"] = json!({ "workspace": workspace });
    }
    let (status, payload) = send_json(app, Method::POST, "/v1/sessions", Some(body)).await;
    assert_eq!(status, StatusCode::OK, "create session: {payload}");
    payload["sessionId"]
        .as_str()
        .expect("session id")
        .to_string()
}

/// Incremental reader over an SSE response body.
pub struct SseReader {
    chunks: BoxStream<'static, Result<Bytes, axum::Error>>,
    buffer: String,
    pending: Vec<Value>,
    pub ended: bool,
}

impl SseReader {
    pub async fn open(app: &Router, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Option<Self>) {
        let mut request = Request::builder().method(method).uri(path);
        if body.is_some() {
            request = request.header("content-type", "application/json");
        }
        let request = request
            .body(Body::from(body.map(|value| value.to_string()).unwrap_or_default()))
            .expect("sse request");
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("sse response");
        let status = response.status();
        if status != StatusCode::OK {
            return (status, None);
        }
        let reader = Self {
            chunks: StreamExt::boxed(response.into_body().into_data_stream()),
            buffer: String::new(),
            pending: Vec::new(),
            ended: false,
        };
        (status, Some(reader))
    }

    pub async fn next_event(&mut self, timeout: Duration) -> Option<Value> {
        let start = Instant::now();
        loop {
            if !self.pending.is_empty() {
                return Some(self.pending.remove(0));
            }
            if self.ended {
                return None;
            }
            let remaining = timeout.checked_sub(start.elapsed())?;
            match tokio::time::timeout(remaining, self.chunks.next()).await {
                Ok(Some(Ok(chunk))) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&chunk));
                    while let Some(idx) = self.buffer.find("\n\n") {
                        let block = self.buffer[..idx].to_string();
                        self.buffer = self.buffer[idx + 2..].to_string();
                        if let Some(event) = parse_sse_block(&block) {
                            self.pending.push(event);
                        }
                    }
                }
                Ok(Some(Err(_))) | Ok(None) => self.ended = true,
                Err(_) => return None,
            }
        }
    }

    /// Reads until the server closes the stream.
    pub async fn collect(mut self, timeout: Duration) -> Vec<Value> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event(timeout).await {
            events.push(event);
        }
        assert!(self.ended, "stream did not close before timeout");
        events
    }
}

fn parse_sse_block(block: &str) -> Option<Value> {
    let mut data_lines = Vec::new();
    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    let data = data_lines.join("\n");
    serde_json::from_str(&data).ok()
}

pub fn event_types(events: &[Value]) -> String {
    events
        .iter()
        .map(|event| event["type"].as_str().unwrap_or("?"))
        .collect::<Vec<_>>()
        .join("\n")
}
