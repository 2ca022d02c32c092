//! Scripted backend for tests and local development.
//!
//! Turns are queued up front and replayed as Anthropic-shaped native events.
//! With nothing queued, the backend echoes the newest user text.

use std::collections::VecDeque;
use std::sync::Mutex;

use agentd_canonical_events::{AnthropicTranslator, Translator};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use super::{Backend, BackendError, BackendKind, NativeStream, TurnRequest};
use crate::store::{MessageContent, MessageRole};

#[derive(Debug, Clone)]
pub enum MockTurn {
    /// Emits the events, then ends the turn.
    Events(Vec<Value>),
    /// Emits the events, then never finishes.
    Stall(Vec<Value>),
    /// Fails to start.
    Fail(String),
}

#[derive(Debug, Default)]
pub struct MockBackend {
    turns: Mutex<VecDeque<MockTurn>>,
    requests: Mutex<Vec<TurnRequest>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_turns(turns: impl IntoIterator<Item = MockTurn>) -> Self {
        let backend = Self::new();
        for turn in turns {
            backend.push_turn(turn);
        }
        backend
    }

    pub fn push_turn(&self, turn: MockTurn) {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push_back(turn);
        }
    }

    /// Every request the backend has received, oldest first.
    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    /// A turn that answers with one text block.
    pub fn text_turn(text: &str) -> MockTurn {
        let mut events = vec![message_start()];
        events.extend(block(
            0,
            json!({"type": "text", "text": ""}),
            json!({"type": "text_delta", "text": text}),
        ));
        events.extend(message_end("end_turn"));
        MockTurn::Events(events)
    }

    /// A turn that asks for one tool invocation.
    pub fn tool_use_turn(id: &str, name: &str, input: Value) -> MockTurn {
        let mut events = vec![message_start()];
        events.extend(block(
            0,
            json!({"type": "tool_use", "id": id, "name": name, "input": {}}),
            json!({"type": "input_json_delta", "partial_json": input.to_string()}),
        ));
        events.extend(message_end("tool_use"));
        MockTurn::Events(events)
    }
}

fn message_start() -> Value {
    json!({
        "type": "message_start",
        "message": {
            "id": "msg_mock",
            "model": "mock",
            "role": "assistant",
            "usage": {"input_tokens": 1, "output_tokens": 0}
        }
    })
}

fn block(index: u64, content_block: Value, delta: Value) -> [Value; 3] {
    [
        json!({"type": "content_block_start", "index": index, "content_block": content_block}),
        json!({"type": "content_block_delta", "index": index, "delta": delta}),
        json!({"type": "content_block_stop", "index": index}),
    ]
}

fn message_end(stop_reason: &str) -> [Value; 2] {
    [
        json!({
            "type": "message_delta",
            "delta": {"stop_reason": stop_reason},
            "usage": {"output_tokens": 1}
        }),
        json!({"type": "message_stop"}),
    ]
}

#[async_trait]
impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mock
    }

    fn translator(&self) -> Box<dyn Translator> {
        Box::new(AnthropicTranslator::new())
    }

    async fn start_turn(&self, request: TurnRequest) -> Result<NativeStream, BackendError> {
        let echo = echo_text(&request);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let turn = self
            .turns
            .lock()
            .ok()
            .and_then(|mut turns| turns.pop_front());
        let turn = match (turn, echo) {
            (Some(turn), _) => Some(turn),
            (None, Some(text)) => Some(Self::text_turn(&text)),
            (None, None) => None,
        };
        match turn {
            Some(MockTurn::Events(events)) => {
                Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
            }
            Some(MockTurn::Stall(events)) => Ok(futures::stream::iter(events.into_iter().map(Ok))
                .chain(futures::stream::pending::<Result<Value, BackendError>>())
                .boxed()),
            Some(MockTurn::Fail(message)) => Err(BackendError::Unavailable(message)),
            None => Err(BackendError::Protocol(
                "mock backend has no scripted turn".to_string(),
            )),
        }
    }
}

fn echo_text(request: &TurnRequest) -> Option<String> {
    let message = request
        .messages
        .last()
        .filter(|message| message.role == MessageRole::User)?;
    let text: Vec<&str> = message
        .content
        .iter()
        .filter_map(|content| match content {
            MessageContent::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    if text.is_empty() {
        return None;
    }
    Some(format!("echo: {}", text.join("\n")))
}
