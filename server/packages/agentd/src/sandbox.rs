//! Filesystem and command policy for tool execution.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::config::{SandboxSettings, SettingsStore, WorkspaceSettings};

pub const DEFAULT_BLOCKED_COMMANDS: [&str; 12] = [
    "rm -rf /",
    "rm -rf ~",
    "rm -rf *",
    "mkfs",
    "dd if=",
    "> /dev/sda",
    ":(){ :|:& };:",
    "chmod -r 777 /",
    "curl | sh",
    "curl | bash",
    "wget | sh",
    "wget | bash",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxPolicy {
    pub enabled: bool,
    pub allowed_paths: Vec<PathBuf>,
    pub blocked_commands: Vec<String>,
}

impl SandboxPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            allowed_paths: Vec::new(),
            blocked_commands: default_blocked_commands(),
        }
    }

    /// Enabled policy rooted at `workspace` with the default deny list.
    pub fn for_workspace(workspace: &Path) -> Self {
        Self {
            enabled: true,
            allowed_paths: vec![normalize_path(workspace)],
            blocked_commands: default_blocked_commands(),
        }
    }

    fn describe_roots(&self) -> String {
        if self.allowed_paths.is_empty() {
            return "(none)".to_string();
        }
        self.allowed_paths
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn default_blocked_commands() -> Vec<String> {
    DEFAULT_BLOCKED_COMMANDS
        .iter()
        .map(|command| command.to_string())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxViolation {
    #[error("path {path} is outside the sandbox; allowed roots: {allowed}")]
    PathDenied { path: PathBuf, allowed: String },
    #[error("command blocked by sandbox policy (matched \"{pattern}\")")]
    CommandBlocked { pattern: String },
}

/// Resolves per-workspace policy and checks paths and commands against it.
#[derive(Debug, Clone)]
pub struct SandboxGuard {
    config_dir: PathBuf,
    settings: Arc<dyn SettingsStore>,
}

impl SandboxGuard {
    pub fn new(config_dir: PathBuf, settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            config_dir: normalize_path(&config_dir),
            settings,
        }
    }

    /// Policy for a workspace. Without a workspace the sandbox is disabled.
    pub fn resolve(&self, workspace: Option<&Path>) -> SandboxPolicy {
        let Some(workspace) = workspace else {
            return SandboxPolicy::disabled();
        };
        let root = normalize_path(workspace);
        let settings = self.settings.load(&root);
        Self::policy_from(&root, &settings.sandbox)
    }

    pub fn load_settings(&self, workspace: &Path) -> WorkspaceSettings {
        self.settings.load(&normalize_path(workspace))
    }

    /// Merges workspace sandbox settings over the defaults for `root`.
    pub fn policy_from(root: &Path, settings: &SandboxSettings) -> SandboxPolicy {
        let root = normalize_path(root);
        let mut policy = SandboxPolicy::for_workspace(&root);
        if let Some(enabled) = settings.enabled {
            policy.enabled = enabled;
        }
        if let Some(paths) = &settings.allowed_paths {
            policy.allowed_paths = paths
                .iter()
                .map(|path| normalize_path(&root.join(path)))
                .collect();
        }
        if let Some(extra) = &settings.blocked_commands {
            for command in extra {
                let command = command.trim().to_string();
                if !command.is_empty() && !policy.blocked_commands.contains(&command) {
                    policy.blocked_commands.push(command);
                }
            }
        }
        policy
    }

    /// Resolves `path` and checks it lies inside an allowed root, both
    /// lexically and after following symlinks in its existing prefix.
    ///
    /// Relative paths resolve against the first allowed root. The per-user
    /// configuration directory is always allowed.
    pub fn validate_path(
        &self,
        path: &Path,
        policy: &SandboxPolicy,
    ) -> Result<PathBuf, SandboxViolation> {
        let resolved = resolve_against(path, policy.allowed_paths.first());
        if !policy.enabled {
            return Ok(resolved);
        }
        let denied = || SandboxViolation::PathDenied {
            path: resolved.clone(),
            allowed: policy.describe_roots(),
        };
        let roots: Vec<PathBuf> = std::iter::once(self.config_dir.clone())
            .chain(policy.allowed_paths.iter().map(|root| normalize_path(root)))
            .collect();
        if !roots.iter().any(|root| resolved.starts_with(root)) {
            return Err(denied());
        }
        let real = follow_links(&resolved).ok_or_else(denied)?;
        let inside = roots.iter().any(|root| {
            let real_root = follow_links(root).unwrap_or_else(|| root.clone());
            real.starts_with(real_root)
        });
        if inside {
            Ok(resolved)
        } else {
            Err(denied())
        }
    }

    pub fn check_command(&self, command: &str, policy: &SandboxPolicy) -> Result<(), SandboxViolation> {
        if !policy.enabled {
            return Ok(());
        }
        match blocked_pattern(command, policy) {
            Some(pattern) => Err(SandboxViolation::CommandBlocked {
                pattern: pattern.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Case-insensitive, trimmed substring match against the blocked list.
pub fn is_command_blocked(command: &str, policy: &SandboxPolicy) -> bool {
    blocked_pattern(command, policy).is_some()
}

fn blocked_pattern<'a>(command: &str, policy: &'a SandboxPolicy) -> Option<&'a str> {
    let command = command.trim().to_lowercase();
    policy
        .blocked_commands
        .iter()
        .map(String::as_str)
        .find(|pattern| {
            let pattern = pattern.trim().to_lowercase();
            !pattern.is_empty() && command.contains(&pattern)
        })
}

fn resolve_against(path: &Path, root: Option<&PathBuf>) -> PathBuf {
    if path.is_absolute() {
        return normalize_path(path);
    }
    let base = match root {
        Some(root) => root.clone(),
        None => std::env::current_dir().unwrap_or_default(),
    };
    normalize_path(&base.join(path))
}

/// Canonicalizes the longest existing prefix of `path` and appends the rest.
///
/// `None` when a component is a dangling symlink, whose target cannot be checked.
fn follow_links(path: &Path) -> Option<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut missing = Vec::new();
    loop {
        if let Ok(real) = existing.canonicalize() {
            let mut real = real;
            real.extend(missing.iter().rev());
            return Some(real);
        }
        if existing.symlink_metadata().is_ok() {
            return None;
        }
        match existing.file_name() {
            Some(name) => missing.push(name.to_os_string()),
            None => return Some(path.to_path_buf()),
        }
        existing.pop();
    }
}

/// Removes `.` and `..` components without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(Path::new(std::path::MAIN_SEPARATOR_STR)),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(value) => normalized.push(value),
        }
    }
    normalized
}
