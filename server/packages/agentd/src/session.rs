//! Session ownership, event buffering and replay.
//!
//! Each session owns an append-only buffer of [`SequencedEvent`]s and a
//! broadcast channel. The generation task is the only writer; readers take a
//! snapshot of the buffer and subscribe to the channel under the same lock, so
//! nothing is missed or duplicated between the two.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use agentd_canonical_events::{CanonicalEvent, ErrorKind, SequencedEvent};
use agentd_error::EngineError;
use futures::stream::BoxStream;
use futures::StreamExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::approval::{ApprovalDecision, LoggingApprovalChannel, PendingApprovals};
use crate::backend::{AnthropicBackend, Backend, BackendKind, ClaudeCliBackend, MockBackend};
use crate::config::{EngineConfig, FileSettingsStore};
use crate::mcp::ExternalToolRegistry;
use crate::orchestrator::{EventSink, LoopOutcome, LoopRun, Orchestrator};
use crate::sandbox::SandboxGuard;
use crate::store::{ConversationMessage, ConversationStore, InMemoryConversationStore};
use crate::tools::{DangerPolicy, ToolDispatcher, ToolSchema};

pub const DEFAULT_EVENT_BUFFER: usize = 10_000;
const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Effort {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<Effort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_budget_usd: Option<f64>,
    /// Caps tool-loop iterations for this session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    /// Tool filter; empty allows every tool.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub workspace: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub conversation_id: String,
    pub backend: BackendKind,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_session_id: Option<String>,
    pub options: SessionOptions,
    pub event_count: u64,
    pub stream_complete: bool,
    pub pending_approvals: Vec<String>,
    pub created_at: String,
}

/// Canonical events of one session, oldest first.
pub type EventStream = BoxStream<'static, SequencedEvent>;

#[derive(Debug, Clone)]
enum StreamItem {
    Event(SequencedEvent),
    Complete,
}

#[derive(Debug)]
struct SessionState {
    status: SessionStatus,
    native_session_id: Option<String>,
    events: VecDeque<SequencedEvent>,
    next_sequence: u64,
    /// Bumped by every `send_message`.
    generation: u64,
    stream_complete: bool,
    cancel: Option<CancellationToken>,
}

#[derive(Debug)]
struct Session {
    id: String,
    conversation_id: String,
    backend: Arc<dyn Backend>,
    options: SessionOptions,
    created_at: String,
    capacity: usize,
    approvals: Arc<PendingApprovals>,
    sender: broadcast::Sender<StreamItem>,
    state: Mutex<SessionState>,
}

impl Session {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        // a poisoned lock still holds consistent buffer state
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn info(&self) -> SessionInfo {
        let state = self.lock();
        SessionInfo {
            session_id: self.id.clone(),
            conversation_id: self.conversation_id.clone(),
            backend: self.backend.kind(),
            status: state.status,
            native_session_id: state.native_session_id.clone(),
            options: self.options.clone(),
            event_count: state.events.len() as u64,
            stream_complete: state.stream_complete,
            pending_approvals: self.approvals.pending_ids(),
            created_at: self.created_at.clone(),
        }
    }

    fn complete(&self, state: &mut SessionState) {
        state.stream_complete = true;
        state.cancel = None;
        let _ = self.sender.send(StreamItem::Complete);
    }
}

impl EventSink for Session {
    fn emit(&self, event: CanonicalEvent) {
        let mut state = self.lock();
        if state.status == SessionStatus::Terminated {
            return;
        }
        state.next_sequence += 1;
        let event = SequencedEvent::new(state.next_sequence, &self.id, event);
        if state.events.len() >= self.capacity {
            state.events.pop_front();
        }
        state.events.push_back(event.clone());
        // no receivers is fine; the buffer still has the event
        let _ = self.sender.send(StreamItem::Event(event));
    }
}

#[derive(Debug, Default)]
struct Registry {
    live: HashMap<String, Arc<Session>>,
    terminated: HashSet<String>,
}

/// Owns every session and runs their generations.
#[derive(Debug)]
pub struct SessionManager {
    sessions: RwLock<Registry>,
    backends: HashMap<BackendKind, Arc<dyn Backend>>,
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn ConversationStore>,
    event_capacity: usize,
}

impl SessionManager {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        store: Arc<dyn ConversationStore>,
        backends: impl IntoIterator<Item = Arc<dyn Backend>>,
        event_capacity: usize,
    ) -> Self {
        Self {
            sessions: RwLock::new(Registry::default()),
            backends: backends
                .into_iter()
                .map(|backend| (backend.kind(), backend))
                .collect(),
            orchestrator,
            store,
            event_capacity: event_capacity.max(1),
        }
    }

    /// Wires the default engine: file-backed workspace settings, an in-memory
    /// transcript store, and every built-in backend.
    pub fn from_config(config: &EngineConfig) -> Self {
        let danger = DangerPolicy::new(config.danger_patterns.iter().cloned());
        let guard = SandboxGuard::new(config.config_dir.clone(), Arc::new(FileSettingsStore));
        let registry = ExternalToolRegistry::new(
            config.discovery_timeout,
            config.tool_call_timeout,
            config.catalog_ttl,
            danger.clone(),
        );
        let dispatcher = ToolDispatcher::new(
            guard,
            Arc::new(registry),
            config.bash_timeout,
            config.search_url.clone(),
        );
        let store: Arc<dyn ConversationStore> = Arc::new(InMemoryConversationStore::new());
        let orchestrator = Orchestrator::new(
            Arc::new(dispatcher),
            Arc::new(LoggingApprovalChannel),
            Arc::clone(&store),
            danger,
            config.max_iterations as usize,
        );
        let backends: [Arc<dyn Backend>; 3] = [
            Arc::new(
                ClaudeCliBackend::new(config.claude_binary.clone())
                    .with_default_model(config.default_model.clone()),
            ),
            Arc::new(AnthropicBackend::new(
                config.anthropic_api_key.clone(),
                Some(config.anthropic_base_url.clone()),
                config.default_model.clone(),
            )),
            Arc::new(MockBackend::new()),
        ];
        Self::new(Arc::new(orchestrator), store, backends, config.event_buffer_capacity)
    }

    pub fn backends(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<BackendKind> = self.backends.keys().copied().collect();
        kinds.sort_by_key(|kind| kind.as_str());
        kinds
    }

    pub async fn create_session(
        &self,
        conversation_id: Option<String>,
        backend: BackendKind,
        options: SessionOptions,
    ) -> Result<String, EngineError> {
        let backend_impl = self
            .backends
            .get(&backend)
            .cloned()
            .ok_or_else(|| EngineError::BackendUnavailable {
                backend: backend.to_string(),
            })?;
        if let Some(workspace) = &options.workspace {
            if !workspace.is_absolute() || !workspace.is_dir() {
                return Err(EngineError::InvalidRequest {
                    message: format!(
                        "workspace must be an existing absolute directory: {}",
                        workspace.display()
                    ),
                });
            }
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let conversation_id = conversation_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| session_id.clone());
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        let session = Arc::new(Session {
            id: session_id.clone(),
            conversation_id: conversation_id.clone(),
            backend: backend_impl,
            options,
            created_at: now_rfc3339(),
            capacity: self.event_capacity,
            approvals: Arc::new(PendingApprovals::new()),
            sender,
            state: Mutex::new(SessionState {
                status: SessionStatus::Idle,
                native_session_id: None,
                events: VecDeque::new(),
                next_sequence: 0,
                generation: 0,
                stream_complete: true,
                cancel: None,
            }),
        });
        self.sessions
            .write()
            .await
            .live
            .insert(session_id.clone(), session);
        tracing::info!(
            session_id = %session_id,
            conversation_id = %conversation_id,
            backend = %backend,
            status = SessionStatus::Idle.as_str(),
            "session created"
        );
        Ok(session_id)
    }

    /// Starts a generation and returns its live event stream.
    pub async fn send_message(
        &self,
        session_id: &str,
        text: String,
    ) -> Result<EventStream, EngineError> {
        if text.trim().is_empty() {
            return Err(EngineError::InvalidRequest {
                message: "message must not be empty".to_string(),
            });
        }
        let session = self.session(session_id).await?;
        let cancel = CancellationToken::new();
        let (follow, native_session_id) = {
            let mut state = session.lock();
            match state.status {
                SessionStatus::Terminated => {
                    return Err(EngineError::SessionTerminated {
                        session_id: session_id.to_string(),
                    })
                }
                SessionStatus::Running => {
                    return Err(EngineError::SessionBusy {
                        session_id: session_id.to_string(),
                    })
                }
                SessionStatus::Idle => {}
            }
            state.status = SessionStatus::Running;
            state.events.clear();
            state.generation += 1;
            state.stream_complete = false;
            state.cancel = Some(cancel.clone());
            (
                (session.sender.subscribe(), state.next_sequence, state.generation),
                state.native_session_id.clone(),
            )
        };
        tracing::info!(
            session_id = %session.id,
            backend = %session.backend.kind(),
            status = SessionStatus::Running.as_str(),
            "generation started"
        );

        let run = LoopRun {
            session_id: session.id.clone(),
            conversation_id: session.conversation_id.clone(),
            backend: Arc::clone(&session.backend),
            options: session.options.clone(),
            native_session_id,
            approvals: Arc::clone(&session.approvals),
            cancel,
        };
        let orchestrator = Arc::clone(&self.orchestrator);
        let store = Arc::clone(&self.store);
        let task_session = Arc::clone(&session);
        tokio::spawn(async move {
            generate(task_session, orchestrator, store, run, text).await;
        });

        Ok(event_stream(&session, Vec::new(), Some(follow)))
    }

    /// Replays the current buffer and, while generation is live, follows it.
    ///
    /// `None` for an unknown session, or a completed one with nothing buffered.
    pub async fn reconnect_stream(&self, session_id: &str) -> Option<EventStream> {
        let session = self.session(session_id).await.ok()?;
        let state = session.lock();
        if state.stream_complete && state.events.is_empty() {
            return None;
        }
        let initial: Vec<SequencedEvent> = state.events.iter().cloned().collect();
        let follow = (!state.stream_complete)
            .then(|| (session.sender.subscribe(), state.next_sequence, state.generation));
        drop(state);
        Some(event_stream(&session, initial, follow))
    }

    pub async fn cancel_generation(&self, session_id: &str) -> Result<(), EngineError> {
        let session = self.session(session_id).await?;
        let state = session.lock();
        if let Some(cancel) = &state.cancel {
            tracing::info!(session_id = %session_id, "cancelling generation");
            cancel.cancel();
        }
        Ok(())
    }

    /// Tears the session down. Unknown or already terminated ids are a no-op.
    pub async fn terminate_session(&self, session_id: &str) -> Result<(), EngineError> {
        let session = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.live.remove(session_id) else {
                return Ok(());
            };
            sessions.terminated.insert(session_id.to_string());
            session
        };
        {
            let mut state = session.lock();
            if let Some(cancel) = state.cancel.take() {
                cancel.cancel();
            }
            state.status = SessionStatus::Terminated;
            state.events.clear();
            session.complete(&mut state);
        }
        session.approvals.clear();
        tracing::info!(
            session_id = %session_id,
            backend = %session.backend.kind(),
            status = SessionStatus::Terminated.as_str(),
            "session terminated"
        );
        Ok(())
    }

    pub async fn resolve_approval(
        &self,
        session_id: &str,
        tool_use_id: &str,
        decision: ApprovalDecision,
    ) -> Result<(), EngineError> {
        let session = self.session(session_id).await?;
        if session.approvals.resolve(tool_use_id, decision) {
            Ok(())
        } else {
            Err(EngineError::ApprovalNotFound {
                session_id: session_id.to_string(),
                tool_use_id: tool_use_id.to_string(),
            })
        }
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.live.values().cloned().collect();
        let mut infos: Vec<SessionInfo> = sessions.iter().map(|session| session.info()).collect();
        infos.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        infos
    }

    pub async fn session_info(&self, session_id: &str) -> Result<SessionInfo, EngineError> {
        Ok(self.session(session_id).await?.info())
    }

    /// Tool schemas a session rooted at `workspace` would be offered.
    pub async fn tool_schemas(&self, workspace: Option<&Path>) -> Vec<ToolSchema> {
        let dispatcher = self.orchestrator.dispatcher();
        let ctx = dispatcher.workspace_context(workspace);
        let catalog = dispatcher.external_catalog(&ctx).await;
        dispatcher.tool_schemas(&[], &catalog)
    }

    async fn session(&self, session_id: &str) -> Result<Arc<Session>, EngineError> {
        let sessions = self.sessions.read().await;
        if let Some(session) = sessions.live.get(session_id) {
            return Ok(Arc::clone(session));
        }
        if sessions.terminated.contains(session_id) {
            return Err(EngineError::SessionTerminated {
                session_id: session_id.to_string(),
            });
        }
        Err(EngineError::SessionNotFound {
            session_id: session_id.to_string(),
        })
    }
}

async fn generate(
    session: Arc<Session>,
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn ConversationStore>,
    run: LoopRun,
    text: String,
) {
    let report = match store
        .append(&run.conversation_id, ConversationMessage::user_text(text))
        .await
    {
        Ok(()) => Some(orchestrator.run(run, session.as_ref()).await),
        Err(err) => {
            tracing::warn!(session_id = %session.id, error = %err, "failed to record user message");
            session.emit(CanonicalEvent::error(ErrorKind::Internal, err.to_string()));
            None
        }
    };

    let mut state = session.lock();
    if let Some(report) = &report {
        if report.native_session_id.is_some() {
            state.native_session_id = report.native_session_id.clone();
        }
    }
    if state.status == SessionStatus::Running {
        state.status = SessionStatus::Idle;
    }
    session.complete(&mut state);
    let outcome = report.map(|report| report.outcome).unwrap_or(LoopOutcome::Error);
    tracing::info!(
        session_id = %session.id,
        backend = %session.backend.kind(),
        status = state.status.as_str(),
        outcome = ?outcome,
        "generation finished"
    );
}

fn event_stream(
    session: &Arc<Session>,
    initial: Vec<SequencedEvent>,
    follow: Option<(broadcast::Receiver<StreamItem>, u64, u64)>,
) -> EventStream {
    let replay = futures::stream::iter(initial);
    let Some((receiver, delivered, generation)) = follow else {
        return replay.boxed();
    };
    let follower = LiveFollower {
        session: Arc::clone(session),
        receiver: BroadcastStream::new(receiver),
        backlog: VecDeque::new(),
        delivered,
        generation,
        done: false,
    };
    let live = futures::stream::unfold(follower, |mut follower| async move {
        follower.next().await.map(|event| (event, follower))
    });
    replay.chain(live).boxed()
}

/// Follows one generation live. A receiver that falls behind the broadcast
/// channel resumes from the session buffer after the last delivered sequence.
struct LiveFollower {
    session: Arc<Session>,
    receiver: BroadcastStream<StreamItem>,
    backlog: VecDeque<SequencedEvent>,
    delivered: u64,
    generation: u64,
    done: bool,
}

impl LiveFollower {
    async fn next(&mut self) -> Option<SequencedEvent> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                return Some(event);
            }
            if self.done {
                return None;
            }
            match self.receiver.next().await {
                Some(Ok(StreamItem::Event(event))) => {
                    if event.sequence > self.delivered {
                        self.delivered = event.sequence;
                        return Some(event);
                    }
                }
                Some(Ok(StreamItem::Complete)) | None => self.done = true,
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => self.catch_up(skipped),
            }
        }
    }

    fn catch_up(&mut self, skipped: u64) {
        let state = self.session.lock();
        if state.generation != self.generation {
            // the followed generation ended and its buffer was replaced
            self.done = true;
            return;
        }
        let missed: VecDeque<SequencedEvent> = state
            .events
            .iter()
            .filter(|event| event.sequence > self.delivered)
            .cloned()
            .collect();
        if let Some(first) = missed.front() {
            if first.sequence > self.delivered + 1 {
                tracing::warn!(
                    session_id = %self.session.id,
                    lost = first.sequence - self.delivered - 1,
                    "events evicted before a slow reader caught up"
                );
            }
        }
        if let Some(last) = missed.back() {
            self.delivered = last.sequence;
        }
        // every event is buffered before completion is flagged
        if state.stream_complete {
            self.done = true;
        }
        tracing::debug!(
            session_id = %self.session.id,
            skipped,
            replayed = missed.len(),
            "event stream lagged, resumed from buffer"
        );
        self.backlog = missed;
    }
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockTurn;
    use crate::orchestrator::DEFAULT_MAX_ITERATIONS;
    use serde_json::json;
    use std::time::Duration;

    fn manager(backend: MockBackend, capacity: usize) -> SessionManager {
        let guard = SandboxGuard::new(PathBuf::from("/nonexistent/.agentd"), Arc::new(FileSettingsStore));
        let registry = ExternalToolRegistry::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
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
        let backend: Arc<dyn Backend> = Arc::new(backend);
        SessionManager::new(Arc::new(orchestrator), store, [backend], capacity)
    }

    #[tokio::test]
    async fn turn_streams_and_session_returns_to_idle() {
        let manager = manager(MockBackend::with_turns([MockBackend::text_turn("hi")]), DEFAULT_EVENT_BUFFER);
        let id = manager
            .create_session(None, BackendKind::Mock, SessionOptions::default())
            .await
            .unwrap();
        let events: Vec<SequencedEvent> = manager
            .send_message(&id, "hello".into())
            .await
            .unwrap()
            .collect()
            .await;
        let sequences: Vec<u64> = events.iter().map(|event| event.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5, 6]);

        let info = manager.session_info(&id).await.unwrap();
        assert_eq!(info.status, SessionStatus::Idle);
        assert!(info.stream_complete);
        assert_eq!(info.event_count, 6);
    }

    #[tokio::test]
    async fn reconnect_rules() {
        let manager = manager(
            MockBackend::with_turns([MockTurn::Stall(Vec::new()), MockBackend::text_turn("hi")]),
            DEFAULT_EVENT_BUFFER,
        );
        assert!(manager.reconnect_stream("missing").await.is_none());

        let id = manager
            .create_session(None, BackendKind::Mock, SessionOptions::default())
            .await
            .unwrap();
        // idle and never run: complete with nothing buffered
        assert!(manager.reconnect_stream(&id).await.is_none());

        let _live = manager.send_message(&id, "hello".into()).await.unwrap();
        // live with an empty buffer still reconnects
        assert!(manager.reconnect_stream(&id).await.is_some());
        let busy = manager.send_message(&id, "again".into()).await.err().unwrap();
        assert!(matches!(busy, EngineError::SessionBusy { .. }));

        manager.cancel_generation(&id).await.unwrap();
        wait_for_idle(&manager, &id).await;
        let replay: Vec<SequencedEvent> = manager.reconnect_stream(&id).await.unwrap().collect().await;
        let types: Vec<&str> = replay.iter().map(|event| event.event.event_type()).collect();
        assert_eq!(types, vec!["message_delta", "message_stop"]);
    }

    #[tokio::test]
    async fn termination_is_idempotent() {
        let manager = manager(MockBackend::new(), DEFAULT_EVENT_BUFFER);
        let id = manager
            .create_session(Some("conv".into()), BackendKind::Mock, SessionOptions::default())
            .await
            .unwrap();
        manager.terminate_session(&id).await.unwrap();
        manager.terminate_session(&id).await.unwrap();
        manager.terminate_session("never-existed").await.unwrap();

        let err = manager.send_message(&id, "hi".into()).await.err().unwrap();
        assert!(matches!(err, EngineError::SessionTerminated { .. }));
        assert!(manager.reconnect_stream(&id).await.is_none());
        assert!(manager.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn buffer_evicts_oldest_events() {
        let manager = manager(MockBackend::with_turns([MockBackend::text_turn("hi")]), 3);
        let id = manager
            .create_session(None, BackendKind::Mock, SessionOptions::default())
            .await
            .unwrap();
        let _: Vec<SequencedEvent> = manager.send_message(&id, "hello".into()).await.unwrap().collect().await;
        let replay: Vec<SequencedEvent> = manager.reconnect_stream(&id).await.unwrap().collect().await;
        let sequences: Vec<u64> = replay.iter().map(|event| event.sequence).collect();
        assert_eq!(sequences, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn slow_reader_receives_every_event() {
        let mut native = vec![json!({"type": "message_start", "message": {"id": "msg_1", "model": "mock"}})];
        for index in 0..100 {
            native.push(json!({"type": "content_block_start", "index": index, "content_block": {"type": "text", "text": ""}}));
            native.push(json!({"type": "content_block_delta", "index": index, "delta": {"type": "text_delta", "text": format!("part {index}")}}));
            native.push(json!({"type": "content_block_stop", "index": index}));
        }
        native.push(json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}}));
        native.push(json!({"type": "message_stop"}));
        let manager = manager(MockBackend::with_turns([MockTurn::Events(native)]), DEFAULT_EVENT_BUFFER);
        let id = manager
            .create_session(None, BackendKind::Mock, SessionOptions::default())
            .await
            .unwrap();

        let stream = manager.send_message(&id, "hello".into()).await.unwrap();
        wait_for_idle(&manager, &id).await;
        let events: Vec<SequencedEvent> = stream.collect().await;

        assert!(events.len() > BROADCAST_CAPACITY);
        assert_eq!(events.len() as u64, manager.session_info(&id).await.unwrap().event_count);
        let sequences: Vec<u64> = events.iter().map(|event| event.sequence).collect();
        assert_eq!(sequences, (1..=events.len() as u64).collect::<Vec<_>>());
        assert_eq!(events[0].event.event_type(), "message_start");
    }

    #[tokio::test]
    async fn unknown_backend_and_approval() {
        let manager = manager(MockBackend::new(), DEFAULT_EVENT_BUFFER);
        let err = manager
            .create_session(None, BackendKind::Anthropic, SessionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BackendUnavailable { .. }));

        let id = manager
            .create_session(None, BackendKind::Mock, SessionOptions::default())
            .await
            .unwrap();
        let err = manager
            .resolve_approval(&id, "toolu_x", ApprovalDecision::Approve)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ApprovalNotFound { .. }));
    }

    #[tokio::test]
    async fn relative_workspace_is_rejected() {
        let manager = manager(MockBackend::new(), DEFAULT_EVENT_BUFFER);
        let options = SessionOptions {
            workspace: Some(PathBuf::from("relative/dir")),
            ..SessionOptions::default()
        };
        let err = manager
            .create_session(None, BackendKind::Mock, options)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest { .. }));
    }

    async fn wait_for_idle(manager: &SessionManager, id: &str) {
        for _ in 0..100 {
            if manager.session_info(id).await.unwrap().stream_complete {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {id} never finished");
    }
}
