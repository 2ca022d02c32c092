use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::{parse_args, truncate_output, HandlerOutput, ToolError, WorkspaceContext};
use crate::sandbox::SandboxGuard;

const MAX_OUTPUT_BYTES: usize = 30_000;
const MAX_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Deserialize)]
struct BashArgs {
    command: String,
    /// Milliseconds.
    #[serde(default)]
    timeout: Option<u64>,
}

pub(super) async fn bash(
    input: &Value,
    guard: &SandboxGuard,
    ctx: &WorkspaceContext,
    default_timeout: Duration,
) -> Result<HandlerOutput, ToolError> {
    let args: BashArgs = parse_args(input)?;
    if args.command.trim().is_empty() {
        return Err(ToolError::InvalidArguments("command must not be empty".to_string()));
    }
    guard.check_command(&args.command, &ctx.policy)?;

    let timeout = args
        .timeout
        .map(Duration::from_millis)
        .unwrap_or(default_timeout)
        .min(MAX_TIMEOUT);

    let mut command = tokio::process::Command::new("sh");
    command
        .arg("-c")
        .arg(&args.command)
        .env("TERM", "dumb")
        .env("NO_COLOR", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(root) = &ctx.root {
        command.current_dir(root);
    }
    let child = command
        .spawn()
        .map_err(|err| ToolError::Failed(format!("failed to spawn shell: {err}")))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Ok(HandlerOutput {
                content: format!("command timed out after {} ms", timeout.as_millis()),
                is_error: true,
            });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut content = String::new();
    for stream in [stdout.trim_end(), stderr.trim_end()] {
        if stream.is_empty() {
            continue;
        }
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str(stream);
    }
    let (mut content, truncated) = truncate_output(&content, MAX_OUTPUT_BYTES);
    if truncated {
        content.push_str("\n[output truncated]");
    }

    let success = output.status.success();
    if !success {
        let code = output
            .status
            .code()
            .map(|code| code.to_string())
            .unwrap_or_else(|| "signal".to_string());
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str(&format!("exit code: {code}"));
    }
    Ok(HandlerOutput {
        content,
        is_error: !success,
    })
}
