use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mcp::ExternalToolServerConfig;

pub const SETTINGS_DIR: &str = ".agentd";
pub const SETTINGS_FILE: &str = "settings.json";

const DEFAULT_MAX_ITERATIONS: u32 = 10;
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CATALOG_TTL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_BASH_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_EVENT_BUFFER: usize = 10_000;
const DEFAULT_ANTHROPIC_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Substrings of external tool names that mark the tool as requiring approval.
pub const DEFAULT_DANGER_PATTERNS: [&str; 8] = [
    "write", "delete", "remove", "exec", "run", "create", "update", "edit",
];

/// Process-wide engine settings. Per-workspace settings live in [`WorkspaceSettings`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub config_dir: PathBuf,
    pub max_iterations: u32,
    pub discovery_timeout: Duration,
    pub tool_call_timeout: Duration,
    pub catalog_ttl: Duration,
    pub bash_timeout: Duration,
    pub event_buffer_capacity: usize,
    pub danger_patterns: Vec<String>,
    pub search_url: Option<String>,
    pub claude_binary: PathBuf,
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: String,
    pub default_model: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            tool_call_timeout: DEFAULT_TOOL_CALL_TIMEOUT,
            catalog_ttl: DEFAULT_CATALOG_TTL,
            bash_timeout: DEFAULT_BASH_TIMEOUT,
            event_buffer_capacity: DEFAULT_EVENT_BUFFER,
            danger_patterns: DEFAULT_DANGER_PATTERNS
                .iter()
                .map(|pattern| pattern.to_string())
                .collect(),
            search_url: None,
            claude_binary: PathBuf::from("claude"),
            anthropic_api_key: None,
            anthropic_base_url: DEFAULT_ANTHROPIC_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `AGENTD_*` and `ANTHROPIC_API_KEY` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = env_string("AGENTD_CONFIG_DIR") {
            config.config_dir = PathBuf::from(dir);
        }
        if let Some(value) = env_parsed::<u32>("AGENTD_MAX_ITERATIONS") {
            config.max_iterations = value.max(1);
        }
        if let Some(secs) = env_parsed::<u64>("AGENTD_DISCOVERY_TIMEOUT_SECS") {
            config.discovery_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parsed::<u64>("AGENTD_TOOL_TIMEOUT_SECS") {
            config.tool_call_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parsed::<u64>("AGENTD_BASH_TIMEOUT_SECS") {
            config.bash_timeout = Duration::from_secs(secs);
        }
        if let Some(capacity) = env_parsed::<usize>("AGENTD_EVENT_BUFFER") {
            config.event_buffer_capacity = capacity.max(1);
        }
        if let Some(patterns) = env_string("AGENTD_DANGER_PATTERNS") {
            config.danger_patterns = patterns
                .split(',')
                .map(|pattern| pattern.trim().to_ascii_lowercase())
                .filter(|pattern| !pattern.is_empty())
                .collect();
        }
        config.search_url = env_string("AGENTD_SEARCH_URL");
        if let Some(binary) = env_string("AGENTD_CLAUDE_BIN") {
            config.claude_binary = PathBuf::from(binary);
        }
        config.anthropic_api_key = env_string("ANTHROPIC_API_KEY");
        if let Some(url) = env_string("ANTHROPIC_BASE_URL") {
            config.anthropic_base_url = url;
        }
        if let Some(model) = env_string("AGENTD_MODEL") {
            config.default_model = model;
        }
        config
    }
}

fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .map(|dir| dir.join(SETTINGS_DIR))
        .unwrap_or_else(|| PathBuf::from(".").join(SETTINGS_DIR))
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

/// `<workspace>/.agentd/settings.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSettings {
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub tool_servers: BTreeMap<String, ExternalToolServerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub danger_patterns: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_paths: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_commands: Option<Vec<String>>,
}

impl WorkspaceSettings {
    /// Tool server configs with their names filled in from the map keys.
    pub fn servers(&self) -> Vec<ExternalToolServerConfig> {
        self.tool_servers
            .iter()
            .map(|(name, config)| {
                let mut config = config.clone();
                config.name = name.clone();
                config
            })
            .collect()
    }
}

/// Source of per-workspace settings.
pub trait SettingsStore: Send + Sync + std::fmt::Debug {
    fn load(&self, workspace: &Path) -> WorkspaceSettings;
}

/// Reads settings from `<workspace>/.agentd/settings.json`.
///
/// A missing file yields defaults. A malformed file is logged and also yields defaults.
#[derive(Debug, Default, Clone)]
pub struct FileSettingsStore;

impl FileSettingsStore {
    pub fn settings_path(workspace: &Path) -> PathBuf {
        workspace.join(SETTINGS_DIR).join(SETTINGS_FILE)
    }
}

impl SettingsStore for FileSettingsStore {
    fn load(&self, workspace: &Path) -> WorkspaceSettings {
        let path = Self::settings_path(workspace);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return WorkspaceSettings::default();
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to read workspace settings");
                return WorkspaceSettings::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "invalid workspace settings");
                WorkspaceSettings::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::Transport;

    #[test]
    fn missing_settings_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            FileSettingsStore.load(dir.path()),
            WorkspaceSettings::default()
        );
    }

    #[test]
    fn settings_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = FileSettingsStore::settings_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{
                "sandbox": {"enabled": true, "blockedCommands": ["git push"]},
                "toolServers": {"docs": {"command": "docs-server", "args": ["--stdio"]}}
            }"#,
        )
        .unwrap();

        let settings = FileSettingsStore.load(dir.path());
        assert_eq!(settings.sandbox.enabled, Some(true));
        assert_eq!(
            settings.sandbox.blocked_commands,
            Some(vec!["git push".to_string()])
        );
        let servers = settings.servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "docs");
        assert_eq!(servers[0].transport, Transport::Stdio);
        assert_eq!(servers[0].args, vec!["--stdio".to_string()]);
    }

    #[test]
    fn malformed_settings_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = FileSettingsStore::settings_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(
            FileSettingsStore.load(dir.path()),
            WorkspaceSettings::default()
        );
    }
}
