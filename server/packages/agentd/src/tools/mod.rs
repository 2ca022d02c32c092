//! Tool execution dispatcher.
//!
//! Routes a tool invocation to a built-in handler or to an external tool
//! server. Every failure is folded into an `is_error` [`ToolResult`]; nothing
//! escapes [`ToolDispatcher::execute`].

mod files;
mod notebook;
mod search;
mod shell;
mod web;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use utoipa::ToSchema;

use crate::config::DEFAULT_DANGER_PATTERNS;
use crate::mcp::{
    is_namespaced, match_server, ExternalToolDescriptor, ExternalToolRegistry, ExternalToolServerConfig,
    NAMESPACE_PREFIX,
};
use crate::sandbox::{SandboxGuard, SandboxPolicy, SandboxViolation};

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocationRequest {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub session_id: String,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// Schema entry offered to a backend for one tool.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema, ToSchema)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Everything a handler needs to know about the session's workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceContext {
    pub root: Option<PathBuf>,
    pub policy: SandboxPolicy,
    pub servers: Vec<ExternalToolServerConfig>,
    /// Workspace override of the danger pattern list.
    pub danger_patterns: Option<Vec<String>>,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error(transparent)]
    Sandbox(#[from] SandboxViolation),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Failed(String),
}

pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(input: &Value) -> Result<T, ToolError> {
    let input = if input.is_null() { json!({}) } else { input.clone() };
    serde_json::from_value(input).map_err(|err| ToolError::InvalidArguments(err.to_string()))
}

/// Output a handler produced. Handlers may flag a result as an error without failing.
#[derive(Debug)]
pub(crate) struct HandlerOutput {
    pub content: String,
    pub is_error: bool,
}

impl From<String> for HandlerOutput {
    fn from(content: String) -> Self {
        Self {
            content,
            is_error: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinTool {
    Read,
    Write,
    Edit,
    Glob,
    Grep,
    Bash,
    WebFetch,
    WebSearch,
    NotebookEdit,
}

impl BuiltinTool {
    pub const ALL: [BuiltinTool; 9] = [
        Self::Read,
        Self::Write,
        Self::Edit,
        Self::Glob,
        Self::Grep,
        Self::Bash,
        Self::WebFetch,
        Self::WebSearch,
        Self::NotebookEdit,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Read => "Read",
            Self::Write => "Write",
            Self::Edit => "Edit",
            Self::Glob => "Glob",
            Self::Grep => "Grep",
            Self::Bash => "Bash",
            Self::WebFetch => "WebFetch",
            Self::WebSearch => "WebSearch",
            Self::NotebookEdit => "NotebookEdit",
        }
    }

    pub fn dangerous(&self) -> bool {
        matches!(
            self,
            Self::Write | Self::Edit | Self::Bash | Self::NotebookEdit
        )
    }

    pub fn schema(&self) -> ToolSchema {
        let (description, input_schema) = match self {
            Self::Read => (
                "Read a text file. Lines are returned numbered; use offset and limit for large files.",
                json!({
                    "type": "object",
                    "properties": {
                        "file_path": {"type": "string", "description": "Absolute or workspace-relative path"},
                        "offset": {"type": "integer", "description": "1-based line to start from"},
                        "limit": {"type": "integer", "description": "Maximum number of lines"}
                    },
                    "required": ["file_path"]
                }),
            ),
            Self::Write => (
                "Create or overwrite a file, creating parent directories as needed.",
                json!({
                    "type": "object",
                    "properties": {
                        "file_path": {"type": "string"},
                        "content": {"type": "string"}
                    },
                    "required": ["file_path", "content"]
                }),
            ),
            Self::Edit => (
                "Replace an exact string in a file. old_string must be unique unless replace_all is set.",
                json!({
                    "type": "object",
                    "properties": {
                        "file_path": {"type": "string"},
                        "old_string": {"type": "string"},
                        "new_string": {"type": "string"},
                        "replace_all": {"type": "boolean"}
                    },
                    "required": ["file_path", "old_string", "new_string"]
                }),
            ),
            Self::Glob => (
                "Find files matching a glob pattern, most recently modified first.",
                json!({
                    "type": "object",
                    "properties": {
                        "pattern": {"type": "string", "description": "Glob such as **/*.rs"},
                        "path": {"type": "string", "description": "Directory to search, defaults to the workspace"}
                    },
                    "required": ["pattern"]
                }),
            ),
            Self::Grep => (
                "Search file contents with a regular expression.",
                json!({
                    "type": "object",
                    "properties": {
                        "pattern": {"type": "string"},
                        "path": {"type": "string"},
                        "glob": {"type": "string", "description": "Only search files matching this glob"},
                        "case_insensitive": {"type": "boolean"},
                        "output_mode": {"type": "string", "enum": ["files_with_matches", "content", "count"]},
                        "head_limit": {"type": "integer"}
                    },
                    "required": ["pattern"]
                }),
            ),
            Self::Bash => (
                "Run a shell command in the workspace root.",
                json!({
                    "type": "object",
                    "properties": {
                        "command": {"type": "string"},
                        "timeout": {"type": "integer", "description": "Timeout in milliseconds"},
                        "description": {"type": "string"}
                    },
                    "required": ["command"]
                }),
            ),
            Self::WebFetch => (
                "Fetch a URL over HTTP(S) and return its body as text.",
                json!({
                    "type": "object",
                    "properties": {
                        "url": {"type": "string"},
                        "prompt": {"type": "string"}
                    },
                    "required": ["url"]
                }),
            ),
            Self::WebSearch => (
                "Search the web and return result titles, URLs and snippets.",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string"},
                        "allowed_domains": {"type": "array", "items": {"type": "string"}},
                        "blocked_domains": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["query"]
                }),
            ),
            Self::NotebookEdit => (
                "Replace, insert or delete a cell in a Jupyter notebook.",
                json!({
                    "type": "object",
                    "properties": {
                        "notebook_path": {"type": "string"},
                        "cell_id": {"type": "string"},
                        "cell_index": {"type": "integer"},
                        "new_source": {"type": "string"},
                        "cell_type": {"type": "string", "enum": ["code", "markdown"]},
                        "edit_mode": {"type": "string", "enum": ["replace", "insert", "delete"]}
                    },
                    "required": ["notebook_path", "new_source"]
                }),
            ),
        };
        ToolSchema {
            name: self.name().to_string(),
            description: description.to_string(),
            input_schema,
        }
    }
}

/// Decides which invocations need human approval.
///
/// Built-ins use a fixed set. External tools are matched by substring of their
/// raw tool name against a configurable pattern list; this is a heuristic with
/// known false positives, not a security boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DangerPolicy {
    patterns: Vec<String>,
}

impl Default for DangerPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_DANGER_PATTERNS.iter().map(|pattern| pattern.to_string()))
    }
}

impl DangerPolicy {
    pub fn new(patterns: impl IntoIterator<Item = String>) -> Self {
        Self {
            patterns: patterns
                .into_iter()
                .map(|pattern| pattern.trim().to_lowercase())
                .filter(|pattern| !pattern.is_empty())
                .collect(),
        }
    }

    pub fn matches_external(&self, raw_name: &str) -> bool {
        let raw_name = raw_name.to_lowercase();
        self.patterns
            .iter()
            .any(|pattern| raw_name.contains(pattern.as_str()))
    }

    /// External tools are classified by their raw name only, never by the
    /// server segment of the namespaced name.
    pub fn is_dangerous(
        &self,
        name: &str,
        catalog: &[ExternalToolDescriptor],
        servers: &[ExternalToolServerConfig],
    ) -> bool {
        if let Some(builtin) = BuiltinTool::from_name(name) {
            return builtin.dangerous();
        }
        if !is_namespaced(name) {
            return false;
        }
        let raw_name = match catalog.iter().find(|tool| tool.full_name == name) {
            Some(tool) => tool.name.clone(),
            None => match match_server(name, servers) {
                Some((_, tool)) => tool,
                None => name
                    .strip_prefix(NAMESPACE_PREFIX)
                    .and_then(|rest| rest.split_once("__"))
                    .map(|(_, tool)| tool.to_string())
                    .unwrap_or_default(),
            },
        };
        self.matches_external(&raw_name)
    }
}

#[derive(Debug)]
pub struct ToolDispatcher {
    guard: SandboxGuard,
    registry: Arc<ExternalToolRegistry>,
    http: reqwest::Client,
    bash_timeout: Duration,
    search_url: Option<String>,
}

impl ToolDispatcher {
    pub fn new(
        guard: SandboxGuard,
        registry: Arc<ExternalToolRegistry>,
        bash_timeout: Duration,
        search_url: Option<String>,
    ) -> Self {
        Self {
            guard,
            registry,
            http: reqwest::Client::new(),
            bash_timeout,
            search_url,
        }
    }

    /// Sandbox policy, tool servers and danger overrides for a workspace.
    pub fn workspace_context(&self, workspace: Option<&Path>) -> WorkspaceContext {
        let Some(root) = workspace else {
            return WorkspaceContext {
                root: None,
                policy: SandboxPolicy::disabled(),
                servers: Vec::new(),
                danger_patterns: None,
            };
        };
        let settings = self.guard.load_settings(root);
        WorkspaceContext {
            root: Some(root.to_path_buf()),
            policy: SandboxGuard::policy_from(root, &settings.sandbox),
            servers: settings.servers(),
            danger_patterns: settings.danger_patterns,
        }
    }

    pub async fn external_catalog(&self, ctx: &WorkspaceContext) -> Vec<ExternalToolDescriptor> {
        self.registry.get_cached(&ctx.servers).await
    }

    /// Built-in plus external tool schemas, narrowed to `allowed` when it is non-empty.
    pub fn tool_schemas(&self, allowed: &[String], catalog: &[ExternalToolDescriptor]) -> Vec<ToolSchema> {
        let builtins = BuiltinTool::ALL.iter().map(BuiltinTool::schema);
        let external = catalog.iter().map(|tool| ToolSchema {
            name: tool.full_name.clone(),
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
        });
        builtins
            .chain(external)
            .filter(|schema| is_allowed(allowed, &schema.name))
            .collect()
    }

    pub async fn execute(&self, request: &ToolInvocationRequest, ctx: &WorkspaceContext) -> ToolResult {
        let id = request.id.clone();
        if is_namespaced(&request.name) {
            let result = self
                .registry
                .execute_tool(&request.name, &request.input, &ctx.servers)
                .await;
            return ToolResult {
                tool_use_id: id,
                content: result.content,
                is_error: result.is_error,
            };
        }
        let Some(tool) = BuiltinTool::from_name(&request.name) else {
            return ToolResult::error(id, format!("unknown tool: {}", request.name));
        };
        tracing::debug!(session_id = %request.session_id, tool = tool.name(), tool_use_id = %id, "executing tool");
        match self.run_builtin(tool, &request.input, ctx).await {
            Ok(output) => ToolResult {
                tool_use_id: id,
                content: output.content,
                is_error: output.is_error,
            },
            Err(err) => {
                tracing::debug!(tool = tool.name(), error = %err, "tool failed");
                ToolResult::error(id, err.to_string())
            }
        }
    }

    async fn run_builtin(
        &self,
        tool: BuiltinTool,
        input: &Value,
        ctx: &WorkspaceContext,
    ) -> Result<HandlerOutput, ToolError> {
        match tool {
            BuiltinTool::Read => files::read(input, &self.guard, ctx).await.map(Into::into),
            BuiltinTool::Write => files::write(input, &self.guard, ctx).await.map(Into::into),
            BuiltinTool::Edit => files::edit(input, &self.guard, ctx).await.map(Into::into),
            BuiltinTool::NotebookEdit => notebook::edit(input, &self.guard, ctx).await.map(Into::into),
            BuiltinTool::Glob => search::glob(input, &self.guard, ctx).await.map(Into::into),
            BuiltinTool::Grep => search::grep(input, &self.guard, ctx).await.map(Into::into),
            BuiltinTool::Bash => shell::bash(input, &self.guard, ctx, self.bash_timeout).await,
            BuiltinTool::WebFetch => web::fetch(input, &self.http).await.map(Into::into),
            BuiltinTool::WebSearch => web::search(input, &self.http, self.search_url.as_deref())
                .await
                .map(Into::into),
        }
    }
}

pub fn is_allowed(allowed: &[String], name: &str) -> bool {
    allowed.is_empty() || allowed.iter().any(|entry| entry == name)
}

/// Directory a search handler should start from.
pub(crate) fn base_dir(
    path: Option<&str>,
    guard: &SandboxGuard,
    ctx: &WorkspaceContext,
) -> Result<PathBuf, ToolError> {
    match (path, ctx.root.as_ref()) {
        (Some(path), _) => Ok(guard.validate_path(Path::new(path), &ctx.policy)?),
        (None, Some(root)) => Ok(guard.validate_path(root, &ctx.policy)?),
        (None, None) => Ok(std::env::current_dir()?),
    }
}

/// Truncates to at most `max_bytes`, backing up to a char boundary.
pub(crate) fn truncate_output(text: &str, max_bytes: usize) -> (String, bool) {
    if text.len() <= max_bytes {
        return (text.to_string(), false);
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    (text[..end].to_string(), true)
}
