//! Anthropic Messages API server-sent events.
//!
//! Native deltas for a block are merged and released as a single canonical
//! delta when the block closes. Native block indices are remapped so that
//! dropped block kinds leave no gaps.

use serde_json::Value;

use crate::{
    block_events, tool_use_block, BlockDelta, BlockIndexer, CanonicalEvent, ContentBlock,
    ErrorKind, MessageDeltaBody, StopReason, Translator, Usage,
};

#[derive(Debug)]
struct OpenBlock {
    native_index: u64,
    block: ContentBlock,
    buffer: String,
}

#[derive(Debug, Default)]
pub struct AnthropicTranslator {
    blocks: BlockIndexer,
    open: Option<OpenBlock>,
    usage: Usage,
}

impl AnthropicTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    fn message_start(&mut self, event: &Value) -> Vec<CanonicalEvent> {
        let message = event.get("message");
        self.usage = Usage::from_native(message.and_then(|msg| msg.get("usage")));
        let id = message
            .and_then(|msg| msg.get("id"))
            .and_then(Value::as_str)
            .unwrap_or("msg_unknown");
        let model = message
            .and_then(|msg| msg.get("model"))
            .and_then(Value::as_str)
            .map(str::to_string);
        vec![CanonicalEvent::message_start(id, model)]
    }

    fn block_start(&mut self, event: &Value) -> Vec<CanonicalEvent> {
        let native_index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
        let Some(native) = event.get("content_block") else {
            return Vec::new();
        };
        let (block, buffer) = match native.get("type").and_then(Value::as_str).unwrap_or("") {
            "text" => (
                ContentBlock::Text {
                    text: String::new(),
                },
                native.get("text").and_then(Value::as_str).unwrap_or(""),
            ),
            "thinking" => (
                ContentBlock::Thinking {
                    thinking: String::new(),
                },
                native.get("thinking").and_then(Value::as_str).unwrap_or(""),
            ),
            "tool_use" => (
                tool_use_block(
                    native.get("id").and_then(Value::as_str),
                    native.get("name").and_then(Value::as_str),
                    Value::Object(Default::default()),
                ),
                "",
            ),
            _ => return Vec::new(),
        };
        self.open = Some(OpenBlock {
            native_index,
            block,
            buffer: buffer.to_string(),
        });
        Vec::new()
    }

    fn block_delta(&mut self, event: &Value) -> Vec<CanonicalEvent> {
        let native_index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
        let Some(open) = self.open.as_mut().filter(|open| open.native_index == native_index)
        else {
            return Vec::new();
        };
        let Some(delta) = event.get("delta") else {
            return Vec::new();
        };
        let field = match (delta.get("type").and_then(Value::as_str), &open.block) {
            (Some("text_delta"), ContentBlock::Text { .. }) => "text",
            (Some("thinking_delta"), ContentBlock::Thinking { .. }) => "thinking",
            (Some("input_json_delta"), ContentBlock::ToolUse { .. }) => "partial_json",
            _ => return Vec::new(),
        };
        if let Some(chunk) = delta.get(field).and_then(Value::as_str) {
            open.buffer.push_str(chunk);
        }
        Vec::new()
    }

    fn block_stop(&mut self, event: &Value) -> Vec<CanonicalEvent> {
        let native_index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
        if self
            .open
            .as_ref()
            .map_or(true, |open| open.native_index != native_index)
        {
            return Vec::new();
        }
        let Some(open) = self.open.take() else {
            return Vec::new();
        };
        let delta = match &open.block {
            ContentBlock::Text { .. } => BlockDelta::TextDelta { text: open.buffer },
            ContentBlock::Thinking { .. } => BlockDelta::ThinkingDelta {
                thinking: open.buffer,
            },
            ContentBlock::ToolUse { .. } => BlockDelta::InputJsonDelta {
                partial_json: open.buffer,
            },
        };
        let index = self.blocks.next();
        block_events(index, open.block, delta).to_vec()
    }

    fn message_delta(&mut self, event: &Value) -> Vec<CanonicalEvent> {
        let stop_reason = event
            .get("delta")
            .and_then(|delta| delta.get("stop_reason"))
            .and_then(Value::as_str)
            .and_then(StopReason::from_native);
        let native = Usage::from_native(event.get("usage"));
        let usage = Usage {
            input_tokens: if native.input_tokens > 0 {
                native.input_tokens
            } else {
                self.usage.input_tokens
            },
            output_tokens: native.output_tokens,
            cache_read_input_tokens: native
                .cache_read_input_tokens
                .or(self.usage.cache_read_input_tokens),
            cache_creation_input_tokens: native
                .cache_creation_input_tokens
                .or(self.usage.cache_creation_input_tokens),
        };
        vec![CanonicalEvent::MessageDelta {
            delta: MessageDeltaBody { stop_reason },
            usage,
        }]
    }
}

impl Translator for AnthropicTranslator {
    fn translate(&mut self, native: &Value) -> Vec<CanonicalEvent> {
        match native.get("type").and_then(Value::as_str).unwrap_or("") {
            "message_start" => self.message_start(native),
            "content_block_start" => self.block_start(native),
            "content_block_delta" => self.block_delta(native),
            "content_block_stop" => self.block_stop(native),
            "message_delta" => self.message_delta(native),
            "message_stop" => vec![CanonicalEvent::MessageStop],
            "ping" => vec![CanonicalEvent::Ping],
            "error" => {
                let message = native
                    .get("error")
                    .and_then(|err| err.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("backend reported an error");
                vec![CanonicalEvent::error(ErrorKind::Backend, message)]
            }
            _ => Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.blocks.reset();
        self.open = None;
        self.usage = Usage::default();
    }
}
