use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use super::{parse_args, ToolError, WorkspaceContext};
use crate::sandbox::SandboxGuard;

const DEFAULT_READ_LINES: usize = 2_000;
const MAX_LINE_CHARS: usize = 2_000;

#[derive(Debug, Deserialize)]
struct ReadArgs {
    file_path: String,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct WriteArgs {
    file_path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct EditArgs {
    file_path: String,
    old_string: String,
    new_string: String,
    #[serde(default)]
    replace_all: bool,
}

pub(super) async fn read(
    input: &Value,
    guard: &SandboxGuard,
    ctx: &WorkspaceContext,
) -> Result<String, ToolError> {
    let args: ReadArgs = parse_args(input)?;
    let path = guard.validate_path(Path::new(&args.file_path), &ctx.policy)?;
    let text = tokio::fs::read_to_string(&path).await.map_err(|err| {
        ToolError::Failed(format!("failed to read {}: {err}", path.display()))
    })?;
    if text.is_empty() {
        return Ok(format!("{} is empty", path.display()));
    }

    let start = args.offset.unwrap_or(1).max(1);
    let limit = args.limit.unwrap_or(DEFAULT_READ_LINES).max(1);
    let numbered: Vec<String> = text
        .lines()
        .enumerate()
        .skip(start - 1)
        .take(limit)
        .map(|(index, line)| {
            let line: String = line.chars().take(MAX_LINE_CHARS).collect();
            format!("{:>6}\t{line}", index + 1)
        })
        .collect();
    if numbered.is_empty() {
        return Err(ToolError::InvalidArguments(format!(
            "offset {start} is past the end of {} ({} lines)",
            path.display(),
            text.lines().count()
        )));
    }
    Ok(numbered.join("\n"))
}

pub(super) async fn write(
    input: &Value,
    guard: &SandboxGuard,
    ctx: &WorkspaceContext,
) -> Result<String, ToolError> {
    let args: WriteArgs = parse_args(input)?;
    let path = guard.validate_path(Path::new(&args.file_path), &ctx.policy)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, args.content.as_bytes()).await?;
    Ok(format!(
        "Wrote {} bytes to {}",
        args.content.len(),
        path.display()
    ))
}

pub(super) async fn edit(
    input: &Value,
    guard: &SandboxGuard,
    ctx: &WorkspaceContext,
) -> Result<String, ToolError> {
    let args: EditArgs = parse_args(input)?;
    if args.old_string.is_empty() {
        return Err(ToolError::InvalidArguments(
            "old_string must not be empty".to_string(),
        ));
    }
    if args.old_string == args.new_string {
        return Err(ToolError::InvalidArguments(
            "old_string and new_string are identical".to_string(),
        ));
    }
    let path = guard.validate_path(Path::new(&args.file_path), &ctx.policy)?;
    let original = tokio::fs::read_to_string(&path).await.map_err(|err| {
        ToolError::Failed(format!("failed to read {}: {err}", path.display()))
    })?;

    let occurrences = original.matches(args.old_string.as_str()).count();
    if occurrences == 0 {
        return Err(ToolError::Failed(format!(
            "old_string not found in {}",
            path.display()
        )));
    }
    if occurrences > 1 && !args.replace_all {
        return Err(ToolError::Failed(format!(
            "old_string appears {occurrences} times in {}; add context or set replace_all",
            path.display()
        )));
    }
    let updated = if args.replace_all {
        original.replace(&args.old_string, &args.new_string)
    } else {
        original.replacen(&args.old_string, &args.new_string, 1)
    };
    tokio::fs::write(&path, updated.as_bytes()).await?;
    Ok(format!(
        "Replaced {occurrences} occurrence(s) in {}",
        path.display()
    ))
}
