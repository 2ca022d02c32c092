use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agentd_canonical_events::{
    BlockDelta, CanonicalEvent, ContentBlock, ErrorBody, ErrorKind, MessageDeltaBody, MessageInfo,
    SequencedEvent, StopReason, Usage,
};
use agentd_error::{EngineError, ErrorType, ProblemDetails};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use futures::{Stream, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::approval::ApprovalDecision;
use crate::backend::BackendKind;
use crate::session::{Effort, SessionInfo, SessionManager, SessionOptions, SessionStatus};
use crate::tools::ToolSchema;

const SERVER_INFO: &str = "agentd: see /v1/openapi.json for the HTTP API";

#[derive(Debug)]
pub struct AppState {
    auth: AuthConfig,
    session_manager: Arc<SessionManager>,
}

impl AppState {
    pub fn new(auth: AuthConfig, session_manager: SessionManager) -> Self {
        Self {
            auth,
            session_manager: Arc::new(session_manager),
        }
    }

    pub fn session_manager(&self) -> Arc<SessionManager> {
        self.session_manager.clone()
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }
}

pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);
    let mut v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/tools", get(list_tools))
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/:session_id", get(get_session))
        .route("/sessions/:session_id/messages", post(post_message))
        .route("/sessions/:session_id/events/sse", get(get_events_sse))
        .route("/sessions/:session_id/cancel", post(cancel_session))
        .route("/sessions/:session_id/terminate", post(terminate_session))
        .route(
            "/sessions/:session_id/approvals/:tool_use_id",
            post(resolve_approval),
        )
        .with_state(shared.clone());

    if shared.auth.token.is_some() {
        v1_router = v1_router.layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ));
    }

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %req.method(),
                uri = %req.uri()
            )
        })
        .on_request(|_req: &Request<_>, span: &Span| {
            tracing::info!(parent: span, "request");
        })
        .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
            tracing::info!(
                parent: span,
                status = %res.status(),
                latency_ms = latency.as_millis()
            );
        });

    Router::new()
        .nest("/v1", v1_router)
        .fallback(not_found)
        .layer(trace_layer)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        list_tools,
        list_sessions,
        create_session,
        get_session,
        post_message,
        get_events_sse,
        cancel_session,
        terminate_session,
        resolve_approval
    ),
    components(
        schemas(
            HealthResponse,
            ToolListResponse,
            ToolSchema,
            SessionListResponse,
            SessionInfo,
            SessionOptions,
            SessionStatus,
            Effort,
            BackendKind,
            CreateSessionRequest,
            CreateSessionResponse,
            MessageRequest,
            ApprovalRequestBody,
            ApprovalDecision,
            SequencedEvent,
            CanonicalEvent,
            MessageInfo,
            ContentBlock,
            BlockDelta,
            MessageDeltaBody,
            StopReason,
            Usage,
            ErrorBody,
            ErrorKind,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "sessions", description = "Session management"),
        (name = "tools", description = "Tool catalog")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:2468")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Engine(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub backends: Vec<BackendKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Clone, Serialize, ToSchema, JsonSchema)]
pub struct ToolListResponse {
    pub tools: Vec<ToolSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub backend: String,
    #[serde(default)]
    pub options: SessionOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequestBody {
    pub decision: ApprovalDecision,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolsQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if req.uri().path() == "/v1/health" {
        return Ok(next.run(req).await);
    }

    let expected = match &state.auth.token {
        Some(token) => token.as_str(),
        None => return Ok(next.run(req).await),
    };

    if extract_token(req.headers()).as_deref() == Some(expected) {
        Ok(next.run(req).await)
    } else {
        Err(EngineError::Unauthorized {
            message: "missing or invalid token".to_string(),
        }
        .into())
    }
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, rest) = value.trim().split_once(' ')?;
    match scheme.to_ascii_lowercase().as_str() {
        "bearer" | "token" => Some(rest.trim().to_string()),
        _ => None,
    }
}

async fn not_found() -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("404 Not Found\n\n{SERVER_INFO}"),
    )
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        backends: state.session_manager.backends(),
    })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/v1/tools",
    params(("workspace" = Option<String>, Query, description = "Absolute workspace path")),
    responses(
        (status = 200, body = ToolListResponse),
        (status = 400, body = ProblemDetails)
    ),
    tag = "tools"
)]
async fn list_tools(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ToolsQuery>,
) -> Result<Json<ToolListResponse>, ApiError> {
    let workspace = query.workspace.map(PathBuf::from);
    if let Some(path) = &workspace {
        if !path.is_absolute() {
            return Err(EngineError::InvalidRequest {
                message: format!("workspace must be absolute: {}", path.display()),
            }
            .into());
        }
    }
    let tools = state
        .session_manager
        .tool_schemas(workspace.as_deref())
        .await;
    Ok(Json(ToolListResponse { tools }))
}

#[utoipa::path(
    get,
    path = "/v1/sessions",
    responses((status = 200, body = SessionListResponse)),
    tag = "sessions"
)]
async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionListResponse> {
    let sessions = state.session_manager.list_sessions().await;
    Json(SessionListResponse { sessions })
}

#[utoipa::path(
    post,
    path = "/v1/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 200, body = CreateSessionResponse),
        (status = 400, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let backend =
        BackendKind::parse(&request.backend).ok_or_else(|| EngineError::BackendUnavailable {
            backend: request.backend.clone(),
        })?;
    let session_id = state
        .session_manager
        .create_session(request.conversation_id, backend, request.options)
        .await?;
    Ok(Json(CreateSessionResponse { session_id }))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = SessionInfo),
        (status = 404, body = ProblemDetails),
        (status = 410, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    Ok(Json(state.session_manager.session_info(&session_id).await?))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/messages",
    request_body = MessageRequest,
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "SSE stream of the turn's canonical events"),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails),
        (status = 409, body = ProblemDetails),
        (status = 410, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<MessageRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = state
        .session_manager
        .send_message(&session_id, request.message)
        .await?;
    Ok(Sse::new(events.map(|event| Ok::<Event, Infallible>(to_sse_event(event)))))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/events/sse",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "Buffered events, then live events while generation runs"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn get_events_sse(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = match state.session_manager.reconnect_stream(&session_id).await {
        Some(events) => events,
        None => {
            // distinguish an unknown session from one with nothing to replay
            state.session_manager.session_info(&session_id).await?;
            return Err(EngineError::NoActiveStream { session_id }.into());
        }
    };
    Ok(Sse::new(events.map(|event| Ok::<Event, Infallible>(to_sse_event(event)))))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/cancel",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 204, description = "Cancellation requested"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.session_manager.cancel_generation(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/terminate",
    params(("session_id" = String, Path, description = "Session id")),
    responses((status = 204, description = "Session terminated")),
    tag = "sessions"
)]
async fn terminate_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.session_manager.terminate_session(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/approvals/{tool_use_id}",
    request_body = ApprovalRequestBody,
    params(
        ("session_id" = String, Path, description = "Session id"),
        ("tool_use_id" = String, Path, description = "Tool invocation awaiting approval")
    ),
    responses(
        (status = 204, description = "Decision delivered"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn resolve_approval(
    State(state): State<Arc<AppState>>,
    Path((session_id, tool_use_id)): Path<(String, String)>,
    Json(request): Json<ApprovalRequestBody>,
) -> Result<StatusCode, ApiError> {
    state
        .session_manager
        .resolve_approval(&session_id, &tool_use_id, request.decision)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

fn to_sse_event(event: SequencedEvent) -> Event {
    Event::default()
        .json_data(&event)
        .unwrap_or_else(|_| Event::default().data("{}"))
}
