//! External tool servers speaking line-delimited JSON-RPC over stdio.
//!
//! Every discovery and every call spawns a fresh server process, performs the
//! `initialize` handshake, issues one request and then kills the process.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use agentd_canonical_events::agents::flatten_text_content;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::tools::DangerPolicy;

pub const NAMESPACE_PREFIX: &str = "ns__";
const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Stdio,
    Sse,
    Http,
    #[serde(other)]
    Unknown,
}

impl Transport {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::Http => "http",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalToolServerConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExternalToolDescriptor {
    pub server: String,
    pub name: String,
    pub full_name: String,
    pub description: String,
    pub input_schema: Value,
    pub dangerous: bool,
}

/// Result of one external call. Failures are folded into `is_error`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalCallResult {
    pub content: String,
    pub is_error: bool,
}

impl ExternalCallResult {
    fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }
}

pub fn namespaced_name(server: &str, tool: &str) -> String {
    format!("{NAMESPACE_PREFIX}{server}__{tool}")
}

pub fn is_namespaced(name: &str) -> bool {
    name.starts_with(NAMESPACE_PREFIX)
}

/// Splits `ns__<server>__<tool>` using the configured server names, so tool
/// names may themselves contain `__`.
pub fn match_server<'a>(
    full_name: &str,
    servers: &'a [ExternalToolServerConfig],
) -> Option<(&'a ExternalToolServerConfig, String)> {
    servers.iter().find_map(|server| {
        let prefix = format!("{NAMESPACE_PREFIX}{}__", server.name);
        full_name
            .strip_prefix(&prefix)
            .filter(|tool| !tool.is_empty())
            .map(|tool| (server, tool.to_string()))
    })
}

#[derive(Debug, Error)]
pub enum McpError {
    #[error("failed to spawn tool server `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tool server has no command configured")]
    MissingCommand,
    #[error("failed to capture tool server {0}")]
    MissingPipe(&'static str),
    #[error("tool server i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("tool server closed stdout before responding")]
    Closed,
    #[error("invalid response from tool server: {0}")]
    Malformed(String),
    #[error("tool server error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("tool server did not respond within {0:?}")]
    Timeout(Duration),
    #[error("unsupported transport `{0}`")]
    UnsupportedTransport(String),
}

#[derive(Debug)]
struct StdioConnection {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

impl StdioConnection {
    fn spawn(config: &ExternalToolServerConfig) -> Result<Self, McpError> {
        if config.command.trim().is_empty() {
            return Err(McpError::MissingCommand);
        }
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|source| McpError::Spawn {
            command: config.command.clone(),
            source,
        })?;
        let stdin = child.stdin.take().ok_or(McpError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(McpError::MissingPipe("stdout"))?;
        tracing::debug!(server = %config.name, command = %config.command, "spawned tool server");
        Ok(Self {
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout),
            next_id: 0,
        })
    }

    async fn write_message(&mut self, payload: &Value) -> Result<(), McpError> {
        let mut line = serde_json::to_string(payload)
            .map_err(|err| McpError::Malformed(format!("failed to encode request: {err}")))?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value, McpError> {
        self.next_id += 1;
        let id = self.next_id;
        self.write_message(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .await?;

        loop {
            let mut buffer = String::new();
            let read = self.stdout.read_line(&mut buffer).await?;
            if read == 0 {
                return Err(McpError::Closed);
            }
            let trimmed = buffer.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(trimmed)
                .map_err(|err| McpError::Malformed(err.to_string()))?;
            // notifications and responses to other requests
            if value.get("id").and_then(Value::as_u64) != Some(id) {
                continue;
            }
            if let Some(error) = value.get("error") {
                return Err(McpError::Rpc {
                    code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                });
            }
            return value
                .get("result")
                .cloned()
                .ok_or_else(|| McpError::Malformed("response missing result".to_string()));
        }
    }

    async fn notify(&mut self, method: &str, params: Value) -> Result<(), McpError> {
        self.write_message(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
        .await
    }

    async fn handshake(&mut self) -> Result<(), McpError> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "agentd", "version": env!("CARGO_PKG_VERSION")},
            }),
        )
        .await?;
        self.notify("notifications/initialized", json!({})).await
    }

    async fn shutdown(mut self) {
        let _ = self.child.kill().await;
    }
}

#[derive(Debug)]
struct CatalogCache {
    fetched_at: Instant,
    tools: Vec<ExternalToolDescriptor>,
}

/// One cache slot per distinct server list. Only callers asking for the same
/// list wait on each other's discovery.
type CatalogSlot = Arc<Mutex<Option<CatalogCache>>>;

#[derive(Debug)]
pub struct ExternalToolRegistry {
    discovery_timeout: Duration,
    call_timeout: Duration,
    ttl: Duration,
    danger: DangerPolicy,
    catalogs: StdMutex<HashMap<Vec<ExternalToolServerConfig>, CatalogSlot>>,
}

impl ExternalToolRegistry {
    pub fn new(
        discovery_timeout: Duration,
        call_timeout: Duration,
        ttl: Duration,
        danger: DangerPolicy,
    ) -> Self {
        Self {
            discovery_timeout,
            call_timeout,
            ttl,
            danger,
            catalogs: StdMutex::new(HashMap::new()),
        }
    }

    /// Catalog of one server. Spawn failures and timeouts yield no tools.
    pub async fn discover(&self, server: &ExternalToolServerConfig) -> Vec<ExternalToolDescriptor> {
        if server.transport != Transport::Stdio {
            tracing::warn!(server = %server.name, transport = server.transport.as_str(), "skipping discovery for unsupported transport");
            return Vec::new();
        }
        let started = Instant::now();
        match tokio::time::timeout(self.discovery_timeout, self.list_tools(server)).await {
            Ok(Ok(tools)) => {
                tracing::info!(
                    server = %server.name,
                    tools = tools.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "discovered external tools"
                );
                tools
            }
            Ok(Err(err)) => {
                tracing::warn!(server = %server.name, error = %err, "tool discovery failed");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(
                    server = %server.name,
                    timeout_ms = self.discovery_timeout.as_millis() as u64,
                    "tool discovery timed out"
                );
                Vec::new()
            }
        }
    }

    async fn list_tools(
        &self,
        server: &ExternalToolServerConfig,
    ) -> Result<Vec<ExternalToolDescriptor>, McpError> {
        let mut connection = StdioConnection::spawn(server)?;
        connection.handshake().await?;
        let result = connection.request("tools/list", json!({})).await;
        connection.shutdown().await;
        self.parse_tools(&server.name, &result?)
    }

    fn parse_tools(&self, server: &str, value: &Value) -> Result<Vec<ExternalToolDescriptor>, McpError> {
        let tools = value
            .get("tools")
            .and_then(Value::as_array)
            .ok_or_else(|| McpError::Malformed("tools/list response missing tools".to_string()))?;
        let mut descriptors = Vec::with_capacity(tools.len());
        for tool in tools {
            let Some(name) = tool.get("name").and_then(Value::as_str) else {
                tracing::debug!(server, "skipping tool without a name");
                continue;
            };
            descriptors.push(ExternalToolDescriptor {
                server: server.to_string(),
                name: name.to_string(),
                full_name: namespaced_name(server, name),
                description: tool
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                input_schema: tool
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                dangerous: self.danger.matches_external(name),
            });
        }
        Ok(descriptors)
    }

    /// Aggregate catalog for `servers`, rediscovered once the TTL lapses.
    /// Each distinct server list is cached separately.
    pub async fn get_cached(&self, servers: &[ExternalToolServerConfig]) -> Vec<ExternalToolDescriptor> {
        if servers.is_empty() {
            return Vec::new();
        }
        let slot = self.slot(servers);
        let mut cache = slot.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                return cached.tools.clone();
            }
        }
        let tools: Vec<ExternalToolDescriptor> = join_all(servers.iter().map(|server| self.discover(server)))
            .await
            .into_iter()
            .flatten()
            .collect();
        *cache = Some(CatalogCache {
            fetched_at: Instant::now(),
            tools: tools.clone(),
        });
        tools
    }

    fn slot(&self, servers: &[ExternalToolServerConfig]) -> CatalogSlot {
        let mut catalogs = self
            .catalogs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(catalogs.entry(servers.to_vec()).or_default())
    }

    /// Drops every cached catalog.
    pub fn invalidate(&self) {
        self.catalogs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    pub async fn execute_tool(
        &self,
        full_name: &str,
        args: &Value,
        servers: &[ExternalToolServerConfig],
    ) -> ExternalCallResult {
        let Some((server, tool)) = match_server(full_name, servers) else {
            return ExternalCallResult::error(format!("unknown external tool: {full_name}"));
        };
        if server.transport != Transport::Stdio {
            return ExternalCallResult::error(
                McpError::UnsupportedTransport(server.transport.as_str().to_string()).to_string(),
            );
        }
        let call = self.call_tool(server, &tool, args);
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                tracing::warn!(server = %server.name, tool = %tool, error = %err, "external tool call failed");
                ExternalCallResult::error(err.to_string())
            }
            Err(_) => {
                tracing::warn!(server = %server.name, tool = %tool, "external tool call timed out");
                ExternalCallResult::error(McpError::Timeout(self.call_timeout).to_string())
            }
        }
    }

    async fn call_tool(
        &self,
        server: &ExternalToolServerConfig,
        tool: &str,
        args: &Value,
    ) -> Result<ExternalCallResult, McpError> {
        let mut connection = StdioConnection::spawn(server)?;
        connection.handshake().await?;
        let arguments = if args.is_null() { json!({}) } else { args.clone() };
        let result = connection
            .request("tools/call", json!({"name": tool, "arguments": arguments}))
            .await;
        connection.shutdown().await;
        Ok(call_result(&result?))
    }
}

fn call_result(result: &Value) -> ExternalCallResult {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let content = match result.get("content") {
        Some(content @ (Value::Array(_) | Value::String(_))) => flatten_text_content(content),
        _ => match result.get("structuredContent") {
            Some(structured) => structured.to_string(),
            None => result.to_string(),
        },
    };
    ExternalCallResult { content, is_error }
}
