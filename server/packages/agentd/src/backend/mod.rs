//! Agent backends.
//!
//! A backend knows how to run one model turn and stream its native output.
//! Everything else (translation, tool execution, looping) lives above it.

pub mod anthropic;
pub mod claude_cli;
pub mod mock;

use std::fmt;
use std::path::PathBuf;

use agentd_canonical_events::Translator;
use async_trait::async_trait;
use futures::stream::BoxStream;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use utoipa::ToSchema;

use crate::session::SessionOptions;
use crate::store::ConversationMessage;
use crate::tools::ToolSchema;

pub use anthropic::AnthropicBackend;
pub use claude_cli::ClaudeCliBackend;
pub use mock::{MockBackend, MockTurn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    ClaudeCli,
    Anthropic,
    Mock,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::ClaudeCli => "claude_cli",
            BackendKind::Anthropic => "anthropic",
            BackendKind::Mock => "mock",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "claude_cli" | "claude" => Some(BackendKind::ClaudeCli),
            "anthropic" => Some(BackendKind::Anthropic),
            "mock" => Some(BackendKind::Mock),
            _ => None,
        }
    }

    pub fn all() -> &'static [BackendKind] {
        &[BackendKind::ClaudeCli, BackendKind::Anthropic, BackendKind::Mock]
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("failed to start backend process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("backend i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("backend protocol error: {0}")]
    Protocol(String),
}

/// Native events of one turn, in arrival order.
pub type NativeStream = BoxStream<'static, Result<Value, BackendError>>;

/// Everything a backend needs to run one model turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    /// Full transcript, ending with the user text or tool results to answer.
    pub messages: Vec<ConversationMessage>,
    pub native_session_id: Option<String>,
    pub options: SessionOptions,
    pub tools: Vec<ToolSchema>,
    pub workspace: Option<PathBuf>,
}

#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    fn kind(&self) -> BackendKind;

    /// Fresh translator for this backend's native format.
    fn translator(&self) -> Box<dyn Translator>;

    async fn start_turn(&self, request: TurnRequest) -> Result<NativeStream, BackendError>;
}
