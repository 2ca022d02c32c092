//! Claude Code CLI in `stream-json` mode.
//!
//! One process per model turn. The CLI keeps its own transcript, so after the
//! first turn only the newest user message (or tool results) is written to
//! stdin and the conversation continues with `--resume`.
//!
//! Tools never run inside the CLI: every built-in tool is disallowed, so all
//! execution goes through the sandboxed dispatcher and its approval gate.

use std::path::PathBuf;
use std::process::Stdio;

use agentd_canonical_events::{ClaudeCliTranslator, Translator};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};

use super::{Backend, BackendError, BackendKind, NativeStream, TurnRequest};
use crate::session::Effort;
use crate::store::{MessageContent, MessageRole};

/// Built-in CLI tools, all denied to the CLI process.
const CLI_BUILTIN_TOOLS: [&str; 18] = [
    "Bash",
    "BashOutput",
    "KillShell",
    "Edit",
    "MultiEdit",
    "Write",
    "Read",
    "Glob",
    "Grep",
    "LS",
    "NotebookEdit",
    "NotebookRead",
    "WebFetch",
    "WebSearch",
    "Task",
    "TodoWrite",
    "ExitPlanMode",
    "SlashCommand",
];

#[derive(Debug, Clone)]
pub struct ClaudeCliBackend {
    binary: PathBuf,
    default_model: Option<String>,
}

impl ClaudeCliBackend {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            default_model: None,
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }
}

#[async_trait]
impl Backend for ClaudeCliBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ClaudeCli
    }

    fn translator(&self) -> Box<dyn Translator> {
        Box::new(ClaudeCliTranslator::new())
    }

    async fn start_turn(&self, request: TurnRequest) -> Result<NativeStream, BackendError> {
        let line = input_line(&request)?;
        let mut command = Command::new(&self.binary);
        command
            .args(cli_args(&request, self.default_model.as_deref()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(tokens) = request.options.effort.map(thinking_tokens) {
            command.env("MAX_THINKING_TOKENS", tokens.to_string());
        }
        if let Some(workspace) = &request.workspace {
            command.current_dir(workspace);
        }

        let mut child = command.spawn().map_err(BackendError::Spawn)?;
        tracing::debug!(
            session_id = %request.session_id,
            binary = %self.binary.display(),
            resume = request.native_session_id.is_some(),
            "spawned claude cli"
        );
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Protocol("claude stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Protocol("claude stdout unavailable".to_string()))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        drop(stdin);

        let process = CliProcess {
            lines: BufReader::new(stdout).lines(),
            child,
            saw_result: false,
        };
        Ok(futures::stream::unfold(Some(process), next_event).boxed())
    }
}

struct CliProcess {
    lines: Lines<BufReader<ChildStdout>>,
    child: Child,
    saw_result: bool,
}

async fn next_event(
    state: Option<CliProcess>,
) -> Option<(Result<Value, BackendError>, Option<CliProcess>)> {
    let mut process = state?;
    loop {
        match process.lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(value) => {
                        if value.get("type").and_then(Value::as_str) == Some("result") {
                            process.saw_result = true;
                        }
                        return Some((Ok(value), Some(process)));
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "skipping non-JSON claude output");
                    }
                }
            }
            Ok(None) => {
                // a turn cut short by --max-turns exits non-zero after its result line
                return match process.child.wait().await {
                    Ok(status) if status.success() || process.saw_result => None,
                    Ok(status) => Some((
                        Err(BackendError::Protocol(format!(
                            "claude exited with {status} before producing a result"
                        ))),
                        None,
                    )),
                    Err(err) => Some((Err(BackendError::Io(err)), None)),
                };
            }
            Err(err) => return Some((Err(BackendError::Io(err)), None)),
        }
    }
}

fn cli_args(request: &TurnRequest, default_model: Option<&str>) -> Vec<String> {
    let mut args: Vec<String> = [
        "-p",
        "--output-format",
        "stream-json",
        "--input-format",
        "stream-json",
        "--verbose",
        "--max-turns",
        "1",
        "--permission-mode",
        "default",
    ]
    .into_iter()
    .map(str::to_string)
    .collect();
    if let Some(native) = &request.native_session_id {
        args.push("--resume".to_string());
        args.push(native.clone());
    }
    if let Some(model) = request.options.model.as_deref().or(default_model) {
        args.push("--model".to_string());
        args.push(model.to_string());
    }
    if let Some(prompt) = &request.options.system_prompt {
        args.push("--system-prompt".to_string());
        args.push(prompt.clone());
    }
    if let Some(budget) = request.options.max_budget_usd {
        args.push("--max-budget-usd".to_string());
        args.push(budget.to_string());
    }
    args.push("--disallowedTools".to_string());
    args.push(CLI_BUILTIN_TOOLS.join(","));
    args
}

fn thinking_tokens(effort: Effort) -> u32 {
    match effort {
        Effort::Low => 4_000,
        Effort::Medium => 10_000,
        Effort::High => 32_000,
    }
}

/// The newest user message as one stream-json input line.
fn input_line(request: &TurnRequest) -> Result<String, BackendError> {
    let message = request
        .messages
        .last()
        .filter(|message| message.role == MessageRole::User)
        .ok_or_else(|| BackendError::Protocol("turn must end with a user message".to_string()))?;
    let session_id = request
        .native_session_id
        .clone()
        .unwrap_or_else(|| request.session_id.clone());

    let results: Vec<Value> = message
        .content
        .iter()
        .filter_map(|content| match content {
            MessageContent::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Some(json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            })),
            _ => None,
        })
        .collect();
    let content = if results.is_empty() {
        let text: Vec<&str> = message
            .content
            .iter()
            .filter_map(|content| match content {
                MessageContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        Value::String(text.join("\n"))
    } else {
        Value::Array(results)
    };

    Ok(json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": content,
        },
        "parent_tool_use_id": null,
        "session_id": session_id,
    })
    .to_string())
}
