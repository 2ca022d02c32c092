//! Claude CLI `--output-format stream-json` events.
//!
//! The CLI emits whole assistant messages rather than token deltas, so every
//! content block becomes a complete start/delta/stop triple.

use serde_json::Value;

use crate::agents::flatten_text_content;
use crate::{
    block_events, next_synth_id, tool_use_block, BlockDelta, BlockIndexer, CanonicalEvent, ContentBlock,
    StopReason, Translator, Usage,
};

#[derive(Debug, Default)]
pub struct ClaudeCliTranslator {
    blocks: BlockIndexer,
    started: bool,
    saw_tool_use: bool,
    native_session_id: Option<String>,
}

impl ClaudeCliTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    fn system_event(&mut self, event: &Value) -> Vec<CanonicalEvent> {
        if event.get("subtype").and_then(Value::as_str) != Some("init") || self.started {
            return Vec::new();
        }
        self.started = true;
        let id = event
            .get("session_id")
            .and_then(Value::as_str)
            .map(|session| format!("msg_{session}"))
            .unwrap_or_else(|| next_synth_id("msg"));
        let model = event.get("model").and_then(Value::as_str).map(str::to_string);
        vec![CanonicalEvent::message_start(id, model)]
    }

    fn assistant_event(&mut self, event: &Value) -> Vec<CanonicalEvent> {
        let message = event.get("message");
        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            let id = message
                .and_then(|msg| msg.get("id"))
                .and_then(Value::as_str)
                .unwrap_or("msg_unknown");
            let model = message
                .and_then(|msg| msg.get("model"))
                .and_then(Value::as_str)
                .map(str::to_string);
            events.push(CanonicalEvent::message_start(id, model));
        }

        let content = message
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for block in content {
            let block_type = block.get("type").and_then(Value::as_str).unwrap_or("");
            let (start, delta) = match block_type {
                "text" => {
                    let text = block.get("text").and_then(Value::as_str).unwrap_or("");
                    (
                        ContentBlock::Text {
                            text: String::new(),
                        },
                        BlockDelta::TextDelta {
                            text: text.to_string(),
                        },
                    )
                }
                "thinking" => {
                    let thinking = block.get("thinking").and_then(Value::as_str).unwrap_or("");
                    (
                        ContentBlock::Thinking {
                            thinking: String::new(),
                        },
                        BlockDelta::ThinkingDelta {
                            thinking: thinking.to_string(),
                        },
                    )
                }
                "tool_use" => {
                    self.saw_tool_use = true;
                    let input = block
                        .get("input")
                        .cloned()
                        .unwrap_or_else(|| Value::Object(Default::default()));
                    let start = tool_use_block(
                        block.get("id").and_then(Value::as_str),
                        block.get("name").and_then(Value::as_str),
                        Value::Object(Default::default()),
                    );
                    (
                        start,
                        BlockDelta::InputJsonDelta {
                            partial_json: input.to_string(),
                        },
                    )
                }
                _ => continue,
            };
            let index = self.blocks.next();
            events.extend(block_events(index, start, delta));
        }
        events
    }

    fn user_event(&self, event: &Value) -> Vec<CanonicalEvent> {
        let content = event
            .get("message")
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        content
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
            .filter_map(|block| {
                let tool_use_id = block.get("tool_use_id").and_then(Value::as_str)?;
                Some(CanonicalEvent::ToolResult {
                    tool_use_id: tool_use_id.to_string(),
                    content: flatten_text_content(block.get("content").unwrap_or(&Value::Null)),
                    is_error: block
                        .get("is_error")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                })
            })
            .collect()
    }

    fn result_event(&self, event: &Value) -> Vec<CanonicalEvent> {
        let explicit = event
            .get("stop_reason")
            .and_then(Value::as_str)
            .and_then(StopReason::from_native);
        let is_error = event
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let subtype = event.get("subtype").and_then(Value::as_str).unwrap_or("");
        let stop_reason = match explicit {
            Some(reason) => reason,
            None if self.saw_tool_use && !is_error => StopReason::ToolUse,
            None if subtype == "error_max_turns" && self.saw_tool_use => StopReason::ToolUse,
            None if subtype == "success" && !is_error => StopReason::EndTurn,
            None => StopReason::Error,
        };
        CanonicalEvent::finish(stop_reason, Usage::from_native(event.get("usage"))).to_vec()
    }
}

impl Translator for ClaudeCliTranslator {
    fn translate(&mut self, native: &Value) -> Vec<CanonicalEvent> {
        if let Some(session_id) = native.get("session_id").and_then(Value::as_str) {
            if !session_id.is_empty() {
                self.native_session_id = Some(session_id.to_string());
            }
        }
        match native.get("type").and_then(Value::as_str).unwrap_or("") {
            "system" => self.system_event(native),
            "assistant" => self.assistant_event(native),
            "user" => self.user_event(native),
            "result" => self.result_event(native),
            _ => Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.blocks.reset();
        self.started = false;
        self.saw_tool_use = false;
    }

    fn native_session_id(&self) -> Option<&str> {
        self.native_session_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UNKNOWN_TOOL_NAME;
    use serde_json::json;

    fn types(events: &[CanonicalEvent]) -> String {
        events
            .iter()
            .map(CanonicalEvent::event_type)
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn assistant_blocks_become_ordered_triples() {
        let mut translator = ClaudeCliTranslator::new();
        let mut events = translator.translate(&json!({
            "type": "system", "subtype": "init", "session_id": "sess-1", "model": "claude-sonnet"
        }));
        events.extend(translator.translate(&json!({
            "type": "assistant",
            "message": {
                "id": "msg_1",
                "content": [
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "text", "text": "Listing files."},
                    {"type": "tool_use", "id": "toolu_1", "name": "Bash", "input": {"command": "ls"}}
                ]
            }
        })));

        insta::assert_snapshot!(types(&events), @r###"
        message_start
        content_block_start
        content_block_delta
        content_block_stop
        content_block_start
        content_block_delta
        content_block_stop
        content_block_start
        content_block_delta
        content_block_stop
        "###);

        let indices: Vec<u32> = events
            .iter()
            .filter_map(|event| match event {
                CanonicalEvent::ContentBlockStart { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(translator.native_session_id(), Some("sess-1"));

        match &events[8] {
            CanonicalEvent::ContentBlockDelta {
                index: 2,
                delta: BlockDelta::InputJsonDelta { partial_json },
            } => {
                let input: Value = serde_json::from_str(partial_json).unwrap();
                assert_eq!(input, json!({"command": "ls"}));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn result_closes_message_with_usage() {
        let mut translator = ClaudeCliTranslator::new();
        translator.translate(&json!({
            "type": "assistant",
            "message": {"content": [{"type": "tool_use", "id": "t", "name": "Read", "input": {}}]}
        }));
        let events = translator.translate(&json!({
            "type": "result",
            "subtype": "error_max_turns",
            "usage": {"input_tokens": 12, "output_tokens": 3}
        }));
        assert_eq!(events.len(), 2);
        match &events[0] {
            CanonicalEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta.stop_reason, Some(StopReason::ToolUse));
                assert_eq!(usage.input_tokens, 12);
                assert_eq!(usage.output_tokens, 3);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(events[1], CanonicalEvent::MessageStop);
    }

    #[test]
    fn reset_restarts_indices() {
        let mut translator = ClaudeCliTranslator::new();
        let text = json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "a"}]}});
        translator.translate(&text);
        translator.reset();
        let events = translator.translate(&text);
        assert!(matches!(
            events[1],
            CanonicalEvent::ContentBlockStart { index: 0, .. }
        ));
    }

    #[test]
    fn tool_use_without_identity_uses_sentinel() {
        let mut translator = ClaudeCliTranslator::new();
        let events = translator.translate(&json!({
            "type": "assistant",
            "message": {"content": [{"type": "tool_use", "input": {"x": 1}}]}
        }));
        match &events[1] {
            CanonicalEvent::ContentBlockStart {
                content_block: ContentBlock::ToolUse { id, name, .. },
                ..
            } => {
                assert!(!id.is_empty());
                assert_eq!(name, UNKNOWN_TOOL_NAME);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unsupported_shapes_are_dropped() {
        let mut translator = ClaudeCliTranslator::new();
        assert!(translator
            .translate(&json!({"type": "stream_event", "event": {}}))
            .is_empty());
        let events = translator.translate(&json!({
            "type": "assistant",
            "message": {"content": [{"type": "image", "source": {}}]}
        }));
        assert_eq!(types(&events), "message_start");
    }

    #[test]
    fn user_tool_results_pass_through() {
        let mut translator = ClaudeCliTranslator::new();
        let events = translator.translate(&json!({
            "type": "user",
            "message": {"content": [{
                "type": "tool_result",
                "tool_use_id": "toolu_9",
                "content": [{"type": "text", "text": "done"}],
                "is_error": true
            }]}
        }));
        assert_eq!(
            events,
            vec![CanonicalEvent::ToolResult {
                tool_use_id: "toolu_9".into(),
                content: "done".into(),
                is_error: true,
            }]
        );
    }
}
