//! Anthropic Messages API with `stream: true`.
//!
//! The API is stateless, so every turn resends the whole transcript along
//! with the tool schemas.

use std::fmt;

use agentd_canonical_events::{AnthropicTranslator, Translator};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{future, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;

use super::{Backend, BackendError, BackendKind, NativeStream, TurnRequest};
use crate::store::ConversationMessage;
use crate::tools::ToolSchema;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 8_192;

#[derive(Debug, Clone)]
pub struct AnthropicBackend {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    default_model: String,
}

impl AnthropicBackend {
    pub fn new(api_key: Option<String>, base_url: Option<String>, default_model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            default_model: default_model.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    stream: bool,
    messages: &'a [ConversationMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolSchema],
}

fn no_tools(tools: &&[ToolSchema]) -> bool {
    tools.is_empty()
}

#[async_trait]
impl Backend for AnthropicBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Anthropic
    }

    fn translator(&self) -> Box<dyn Translator> {
        Box::new(AnthropicTranslator::new())
    }

    async fn start_turn(&self, request: TurnRequest) -> Result<NativeStream, BackendError> {
        let Some(api_key) = &self.api_key else {
            return Err(BackendError::Unavailable(
                "ANTHROPIC_API_KEY is not set".to_string(),
            ));
        };
        let model = request
            .options
            .model
            .as_deref()
            .unwrap_or(&self.default_model);
        let body = MessagesRequest {
            model,
            max_tokens: MAX_TOKENS,
            stream: true,
            messages: &request.messages,
            system: request.options.system_prompt.as_deref(),
            tools: &request.tools,
        };
        tracing::debug!(
            session_id = %request.session_id,
            model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "starting messages stream"
        );

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, "messages request rejected");
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(native_events(response.bytes_stream()))
    }
}

/// JSON payloads of the `data:` fields of a Server-Sent Events byte stream.
fn native_events<S, B, E>(bytes: S) -> NativeStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    bytes
        .eventsource()
        .filter_map(|event| {
            future::ready(match event {
                Ok(event) => decode_data(&event.event, &event.data).map(Ok),
                Err(err) => Some(Err(BackendError::Protocol(format!(
                    "event stream error: {err}"
                )))),
            })
        })
        .boxed()
}

fn decode_data(event: &str, data: &str) -> Option<Value> {
    if data.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(data) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::debug!(event, error = %err, "skipping malformed SSE payload");
            None
        }
    }
}
