//! Canonical streaming event protocol shared by every agent backend.
//!
//! Backends speak their own native formats. The translators in [`agents`]
//! project those onto [`CanonicalEvent`], which is what the session manager
//! buffers and what clients consume over SSE.

use std::sync::atomic::{AtomicU64, Ordering};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

pub mod agents;

pub use agents::{anthropic::AnthropicTranslator, claude::ClaudeCliTranslator};

/// Sentinel tool name used when a backend omits the tool name.
pub const UNKNOWN_TOOL_NAME: &str = "unknown";

static SYNTH_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id for tool invocations that arrived without one.
pub fn synthesize_tool_id() -> String {
    next_synth_id("toolu")
}

pub(crate) fn next_synth_id(prefix: &str) -> String {
    let id = SYNTH_ID.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_synth_{id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalEvent {
    MessageStart {
        message: MessageInfo,
    },
    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        usage: Usage,
    },
    MessageStop,
    ToolUseStart {
        id: String,
        name: String,
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_tool_use_id: Option<String>,
        requires_approval: bool,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    Error {
        error: ErrorBody,
    },
    Ping,
}

impl CanonicalEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MessageStart { .. } => "message_start",
            Self::ContentBlockStart { .. } => "content_block_start",
            Self::ContentBlockDelta { .. } => "content_block_delta",
            Self::ContentBlockStop { .. } => "content_block_stop",
            Self::MessageDelta { .. } => "message_delta",
            Self::MessageStop => "message_stop",
            Self::ToolUseStart { .. } => "tool_use_start",
            Self::ToolResult { .. } => "tool_result",
            Self::Error { .. } => "error",
            Self::Ping => "ping",
        }
    }

    pub fn message_start(id: impl Into<String>, model: Option<String>) -> Self {
        Self::MessageStart {
            message: MessageInfo {
                id: id.into(),
                model,
                role: "assistant".to_string(),
            },
        }
    }

    pub fn finish(stop_reason: StopReason, usage: Usage) -> [Self; 2] {
        [
            Self::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: Some(stop_reason),
                },
                usage,
            },
            Self::MessageStop,
        ]
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            error: ErrorBody {
                kind,
                message: message.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct MessageInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse { id: String, name: String, input: Value },
}

impl ContentBlock {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Thinking { .. } => "thinking",
            Self::ToolUse { .. } => "tool_use",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct MessageDeltaBody {
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    Cancelled,
    Error,
}

impl StopReason {
    /// Maps a native finish reason string. Unrecognized values map to `None`.
    pub fn from_native(value: &str) -> Option<Self> {
        match value {
            "end_turn" => Some(Self::EndTurn),
            "tool_use" => Some(Self::ToolUse),
            "max_tokens" => Some(Self::MaxTokens),
            "stop_sequence" => Some(Self::StopSequence),
            "cancelled" => Some(Self::Cancelled),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
}

impl Usage {
    pub fn from_native(value: Option<&Value>) -> Self {
        let Some(value) = value else {
            return Self::default();
        };
        let field = |name: &str| value.get(name).and_then(Value::as_u64);
        Self {
            input_tokens: field("input_tokens").unwrap_or(0),
            output_tokens: field("output_tokens").unwrap_or(0),
            cache_read_input_tokens: field("cache_read_input_tokens"),
            cache_creation_input_tokens: field("cache_creation_input_tokens"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Backend,
    Protocol,
    IterationLimit,
    Internal,
}

/// Wire envelope: a canonical event stamped with its position in the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct SequencedEvent {
    pub sequence: u64,
    pub time: String,
    pub session_id: String,
    #[serde(flatten)]
    pub event: CanonicalEvent,
}

impl SequencedEvent {
    pub fn new(sequence: u64, session_id: impl Into<String>, event: CanonicalEvent) -> Self {
        Self {
            sequence,
            time: now_rfc3339(),
            session_id: session_id.into(),
            event,
        }
    }
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Projects one backend's native events onto canonical events.
///
/// Implementations keep only per-turn block bookkeeping; [`Translator::reset`]
/// is called before each model turn so indices restart at 0.
pub trait Translator: Send {
    fn translate(&mut self, native: &Value) -> Vec<CanonicalEvent>;

    fn reset(&mut self);

    /// Backend-side conversation id observed during the turn, used to resume.
    fn native_session_id(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Default)]
pub(crate) struct BlockIndexer {
    next: u32,
}

impl BlockIndexer {
    pub(crate) fn next(&mut self) -> u32 {
        let index = self.next;
        self.next += 1;
        index
    }

    pub(crate) fn reset(&mut self) {
        self.next = 0;
    }
}

/// Builds a tool-use block, synthesizing id and name when the backend left them out.
pub(crate) fn tool_use_block(id: Option<&str>, name: Option<&str>, input: Value) -> ContentBlock {
    let id = id
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(synthesize_tool_id);
    let name = name
        .filter(|name| !name.is_empty())
        .unwrap_or(UNKNOWN_TOOL_NAME)
        .to_string();
    ContentBlock::ToolUse { id, name, input }
}

/// Emits the start/delta/stop triple for one complete block.
pub(crate) fn block_events(index: u32, block: ContentBlock, delta: BlockDelta) -> [CanonicalEvent; 3] {
    [
        CanonicalEvent::ContentBlockStart {
            index,
            content_block: block,
        },
        CanonicalEvent::ContentBlockDelta { index, delta },
        CanonicalEvent::ContentBlockStop { index },
    ]
}
