//! The multi-turn tool-calling loop.
//!
//! One [`Orchestrator::run`] call drives a session from the user's message to
//! a terminal state: model turn, tool requests, approvals, execution, result
//! injection, and the next model turn, until the model stops asking for tools,
//! the iteration cap is hit, the backend fails, or the run is cancelled.

use std::collections::BTreeMap;
use std::sync::Arc;

use agentd_canonical_events::{
    BlockDelta, CanonicalEvent, ContentBlock, ErrorKind, Translator, Usage, StopReason,
    UNKNOWN_TOOL_NAME,
};
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::approval::{ApprovalChannel, ApprovalDecision, ApprovalRequest, PendingApprovals};
use crate::backend::{Backend, NativeStream, TurnRequest};
use crate::mcp::ExternalToolDescriptor;
use crate::session::SessionOptions;
use crate::store::{ConversationMessage, ConversationStore, MessageContent, MessageRole};
use crate::tools::{
    is_allowed, DangerPolicy, ToolDispatcher, ToolInvocationRequest, ToolResult, WorkspaceContext,
};

pub const DEFAULT_MAX_ITERATIONS: usize = 10;
pub const DENIED_BY_USER: &str = "denied by user";

/// Receives every canonical event the loop produces, in order.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: CanonicalEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingModel,
    ModelStreaming,
    ToolRequested,
    AwaitingApproval,
    ToolExecuting,
    ResultInjected,
    Done,
    Cancelled,
    Error,
}

impl LoopState {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopState::AwaitingModel => "awaiting_model",
            LoopState::ModelStreaming => "model_streaming",
            LoopState::ToolRequested => "tool_requested",
            LoopState::AwaitingApproval => "awaiting_approval",
            LoopState::ToolExecuting => "tool_executing",
            LoopState::ResultInjected => "result_injected",
            LoopState::Done => "done",
            LoopState::Cancelled => "cancelled",
            LoopState::Error => "error",
        }
    }
}

/// Terminal state of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    Done,
    Cancelled,
    Error,
}

/// Inputs for one run of the loop.
#[derive(Debug, Clone)]
pub struct LoopRun {
    pub session_id: String,
    pub conversation_id: String,
    pub backend: Arc<dyn Backend>,
    pub options: SessionOptions,
    pub native_session_id: Option<String>,
    pub approvals: Arc<PendingApprovals>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopReport {
    pub outcome: LoopOutcome,
    pub iterations: usize,
    pub native_session_id: Option<String>,
}

#[derive(Debug)]
pub struct Orchestrator {
    dispatcher: Arc<ToolDispatcher>,
    approvals: Arc<dyn ApprovalChannel>,
    store: Arc<dyn ConversationStore>,
    danger: DangerPolicy,
    max_iterations: usize,
}

/// What one model turn produced.
enum TurnOutcome {
    Completed(Vec<ContentBlock>),
    Failed,
    Cancelled,
}

#[derive(Debug)]
struct PendingBlock {
    block: ContentBlock,
    buffer: String,
}

impl Orchestrator {
    pub fn new(
        dispatcher: Arc<ToolDispatcher>,
        approvals: Arc<dyn ApprovalChannel>,
        store: Arc<dyn ConversationStore>,
        danger: DangerPolicy,
        max_iterations: usize,
    ) -> Self {
        Self {
            dispatcher,
            approvals,
            store,
            danger,
            max_iterations: max_iterations.max(1),
        }
    }

    pub fn dispatcher(&self) -> &Arc<ToolDispatcher> {
        &self.dispatcher
    }

    pub async fn run(&self, run: LoopRun, sink: &dyn EventSink) -> LoopReport {
        let mut translator = run.backend.translator();
        let mut native_session_id = run.native_session_id.clone();
        let cap = run
            .options
            .max_turns
            .map(|turns| turns as usize)
            .unwrap_or(self.max_iterations)
            .max(1);
        let ctx = self
            .dispatcher
            .workspace_context(run.options.workspace.as_deref());
        let danger = ctx
            .danger_patterns
            .clone()
            .map(DangerPolicy::new)
            .unwrap_or_else(|| self.danger.clone());

        let catalog = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => {
                return self.cancelled(&run, sink, 0, native_session_id);
            }
            catalog = self.dispatcher.external_catalog(&ctx) => catalog,
        };
        let tools = self
            .dispatcher
            .tool_schemas(&run.options.allowed_tools, &catalog);

        let mut iterations = 0;
        loop {
            if run.cancel.is_cancelled() {
                return self.cancelled(&run, sink, iterations, native_session_id);
            }
            if iterations >= cap {
                tracing::warn!(session_id = %run.session_id, iterations, "tool loop hit iteration limit");
                sink.emit(CanonicalEvent::error(
                    ErrorKind::IterationLimit,
                    format!("tool loop stopped after {cap} iterations"),
                ));
                return self.finish(&run, LoopOutcome::Error, iterations, native_session_id);
            }
            iterations += 1;
            self.transition(&run, LoopState::AwaitingModel);
            translator.reset();

            let messages = match self.store.load(&run.conversation_id).await {
                Ok(messages) => messages,
                Err(err) => {
                    sink.emit(CanonicalEvent::error(ErrorKind::Internal, err.to_string()));
                    return self.finish(&run, LoopOutcome::Error, iterations, native_session_id);
                }
            };
            let request = TurnRequest {
                session_id: run.session_id.clone(),
                messages,
                native_session_id: native_session_id.clone(),
                options: run.options.clone(),
                tools: tools.clone(),
                workspace: ctx.root.clone(),
            };
            let started = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => {
                    return self.cancelled(&run, sink, iterations, native_session_id);
                }
                started = run.backend.start_turn(request) => started,
            };
            let stream = match started {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(session_id = %run.session_id, backend = %run.backend.kind(), error = %err, "backend failed to start turn");
                    sink.emit(CanonicalEvent::error(ErrorKind::Backend, err.to_string()));
                    return self.finish(&run, LoopOutcome::Error, iterations, native_session_id);
                }
            };

            self.transition(&run, LoopState::ModelStreaming);
            let outcome = self
                .stream_turn(&run, stream, translator.as_mut(), sink)
                .await;
            if let Some(native) = translator.native_session_id() {
                native_session_id = Some(native.to_string());
            }
            let blocks = match outcome {
                TurnOutcome::Completed(blocks) => blocks,
                TurnOutcome::Failed => {
                    return self.finish(&run, LoopOutcome::Error, iterations, native_session_id);
                }
                TurnOutcome::Cancelled => {
                    return self.cancelled(&run, sink, iterations, native_session_id);
                }
            };

            let assistant = assistant_message(&blocks);
            if !assistant.content.is_empty() {
                self.append(&run, assistant).await;
            }
            let requests: Vec<ToolInvocationRequest> = blocks
                .into_iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse { id, name, input } => Some(ToolInvocationRequest {
                        id,
                        name,
                        input,
                        session_id: run.session_id.clone(),
                        parent_id: None,
                    }),
                    _ => None,
                })
                .collect();
            if requests.is_empty() {
                return self.finish(&run, LoopOutcome::Done, iterations, native_session_id);
            }

            let mut results = Vec::with_capacity(requests.len());
            for request in requests {
                let Some(result) = self
                    .handle_tool(&run, &request, &ctx, &catalog, &danger, sink)
                    .await
                else {
                    return self.cancelled(&run, sink, iterations, native_session_id);
                };
                sink.emit(CanonicalEvent::ToolResult {
                    tool_use_id: result.tool_use_id.clone(),
                    content: result.content.clone(),
                    is_error: result.is_error,
                });
                results.push(MessageContent::ToolResult {
                    tool_use_id: result.tool_use_id,
                    content: result.content,
                    is_error: result.is_error,
                });
            }

            self.transition(&run, LoopState::ResultInjected);
            self.append(
                &run,
                ConversationMessage {
                    role: MessageRole::User,
                    content: results,
                },
            )
            .await;
        }
    }

    /// Forwards one turn's canonical events and collects its completed blocks.
    async fn stream_turn(
        &self,
        run: &LoopRun,
        mut stream: NativeStream,
        translator: &mut dyn Translator,
        sink: &dyn EventSink,
    ) -> TurnOutcome {
        let mut open: BTreeMap<u32, PendingBlock> = BTreeMap::new();
        let mut completed = Vec::new();
        let mut failed = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => return TurnOutcome::Cancelled,
                next = stream.next() => next,
            };
            let native = match next {
                Some(Ok(native)) => native,
                Some(Err(err)) => {
                    tracing::warn!(session_id = %run.session_id, error = %err, "backend stream failed");
                    sink.emit(CanonicalEvent::error(ErrorKind::Backend, err.to_string()));
                    return TurnOutcome::Failed;
                }
                None => break,
            };
            for event in translator.translate(&native) {
                match &event {
                    CanonicalEvent::ContentBlockStart {
                        index,
                        content_block,
                    } => {
                        open.insert(
                            *index,
                            PendingBlock {
                                block: content_block.clone(),
                                buffer: String::new(),
                            },
                        );
                    }
                    CanonicalEvent::ContentBlockDelta { index, delta } => {
                        if let Some(pending) = open.get_mut(index) {
                            pending.buffer.push_str(delta_text(delta));
                        }
                    }
                    CanonicalEvent::ContentBlockStop { index } => {
                        if let Some(pending) = open.remove(index) {
                            completed.push(complete_block(pending));
                        }
                    }
                    CanonicalEvent::ToolResult { tool_use_id, .. } => {
                        // tools run here, not inside the backend
                        tracing::debug!(session_id = %run.session_id, tool_use_id = %tool_use_id, "ignoring backend-side tool result");
                        continue;
                    }
                    CanonicalEvent::Error { .. } => failed = true,
                    _ => {}
                }
                sink.emit(event);
            }
        }
        if failed {
            TurnOutcome::Failed
        } else {
            TurnOutcome::Completed(completed)
        }
    }

    /// Runs one tool request through approval and execution.
    ///
    /// Returns `None` when the run was cancelled while waiting.
    async fn handle_tool(
        &self,
        run: &LoopRun,
        request: &ToolInvocationRequest,
        ctx: &WorkspaceContext,
        catalog: &[ExternalToolDescriptor],
        danger: &DangerPolicy,
        sink: &dyn EventSink,
    ) -> Option<ToolResult> {
        self.transition(run, LoopState::ToolRequested);
        let requires_approval = danger.is_dangerous(&request.name, catalog, &ctx.servers);
        let rejection = if request.name == UNKNOWN_TOOL_NAME {
            Some("tool name missing".to_string())
        } else if !is_allowed(&run.options.allowed_tools, &request.name) {
            Some(format!("tool {} is not enabled for this session", request.name))
        } else {
            None
        };
        // must be resolvable as soon as the event is observed
        let pending = (rejection.is_none() && requires_approval).then(|| run.approvals.register(&request.id));
        sink.emit(CanonicalEvent::ToolUseStart {
            id: request.id.clone(),
            name: request.name.clone(),
            input: request.input.clone(),
            parent_tool_use_id: request.parent_id.clone(),
            requires_approval,
        });
        if let Some(message) = rejection {
            return Some(ToolResult::error(&request.id, message));
        }

        if let Some(decision) = pending {
            self.transition(run, LoopState::AwaitingApproval);
            self.approvals
                .request_approval(&ApprovalRequest {
                    session_id: run.session_id.clone(),
                    tool_use_id: request.id.clone(),
                    tool_name: request.name.clone(),
                    input: request.input.clone(),
                })
                .await;
            let decision = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => {
                    run.approvals.forget(&request.id);
                    return None;
                }
                decision = decision => decision,
            };
            match decision {
                Ok(ApprovalDecision::Approve) => {
                    tracing::info!(session_id = %run.session_id, tool_use_id = %request.id, tool = %request.name, "tool approved");
                }
                Ok(ApprovalDecision::Deny) => {
                    tracing::info!(session_id = %run.session_id, tool_use_id = %request.id, tool = %request.name, "tool denied");
                    return Some(ToolResult::error(&request.id, DENIED_BY_USER));
                }
                Err(_) => {
                    return Some(ToolResult::error(&request.id, DENIED_BY_USER));
                }
            }
        }

        self.transition(run, LoopState::ToolExecuting);
        let dispatcher = Arc::clone(&self.dispatcher);
        let owned_request = request.clone();
        let owned_ctx = ctx.clone();
        let mut execution = tokio::spawn(async move { dispatcher.execute(&owned_request, &owned_ctx).await });
        tokio::select! {
            biased;
            _ = run.cancel.cancelled() => {
                // dropping the handler kills any child process it spawned
                execution.abort();
                tracing::debug!(session_id = %run.session_id, tool_use_id = %request.id, "abandoned tool execution");
                None
            }
            joined = &mut execution => Some(joined.unwrap_or_else(|err| {
                ToolResult::error(&request.id, format!("tool execution panicked: {err}"))
            })),
        }
    }

    async fn append(&self, run: &LoopRun, message: ConversationMessage) {
        if let Err(err) = self.store.append(&run.conversation_id, message).await {
            tracing::warn!(session_id = %run.session_id, error = %err, "failed to append to conversation");
        }
    }

    fn transition(&self, run: &LoopRun, state: LoopState) {
        tracing::debug!(session_id = %run.session_id, state = state.as_str(), "tool loop transition");
    }

    fn cancelled(
        &self,
        run: &LoopRun,
        sink: &dyn EventSink,
        iterations: usize,
        native_session_id: Option<String>,
    ) -> LoopReport {
        for event in CanonicalEvent::finish(StopReason::Cancelled, Usage::default()) {
            sink.emit(event);
        }
        self.finish(run, LoopOutcome::Cancelled, iterations, native_session_id)
    }

    fn finish(
        &self,
        run: &LoopRun,
        outcome: LoopOutcome,
        iterations: usize,
        native_session_id: Option<String>,
    ) -> LoopReport {
        let state = match outcome {
            LoopOutcome::Done => LoopState::Done,
            LoopOutcome::Cancelled => LoopState::Cancelled,
            LoopOutcome::Error => LoopState::Error,
        };
        self.transition(run, state);
        LoopReport {
            outcome,
            iterations,
            native_session_id,
        }
    }
}

fn delta_text(delta: &BlockDelta) -> &str {
    match delta {
        BlockDelta::TextDelta { text } => text,
        BlockDelta::ThinkingDelta { thinking } => thinking,
        BlockDelta::InputJsonDelta { partial_json } => partial_json,
    }
}

fn complete_block(pending: PendingBlock) -> ContentBlock {
    match pending.block {
        ContentBlock::Text { text } => ContentBlock::Text {
            text: text + &pending.buffer,
        },
        ContentBlock::Thinking { thinking } => ContentBlock::Thinking {
            thinking: thinking + &pending.buffer,
        },
        ContentBlock::ToolUse { id, name, input } => {
            // an unparsable argument buffer falls back to the input from the start event
            let input = if pending.buffer.trim().is_empty() {
                input
            } else {
                serde_json::from_str::<Value>(&pending.buffer).unwrap_or(input)
            };
            ContentBlock::ToolUse { id, name, input }
        }
    }
}

fn assistant_message(blocks: &[ContentBlock]) -> ConversationMessage {
    let content = blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } if !text.is_empty() => {
                Some(MessageContent::Text { text: text.clone() })
            }
            ContentBlock::ToolUse { id, name, input } => Some(MessageContent::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            }),
            _ => None,
        })
        .collect();
    ConversationMessage {
        role: MessageRole::Assistant,
        content,
    }
}
