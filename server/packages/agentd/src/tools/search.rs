use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use globset::{GlobBuilder, GlobMatcher};
use regress::Regex;
use serde::Deserialize;
use serde_json::Value;

use super::{base_dir, parse_args, ToolError, WorkspaceContext};
use crate::sandbox::SandboxGuard;

const MAX_FILES: usize = 50_000;
const MAX_FILE_BYTES: u64 = 1_000_000;
const GLOB_LIMIT: usize = 100;
const DEFAULT_HEAD_LIMIT: usize = 200;
const IGNORED_DIRS: [&str; 9] = [
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    ".next",
    ".cache",
    ".agentd",
    "coverage",
];

#[derive(Debug, Deserialize)]
struct GlobArgs {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum OutputMode {
    #[default]
    FilesWithMatches,
    Content,
    Count,
}

#[derive(Debug, Deserialize)]
struct GrepArgs {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    glob: Option<String>,
    #[serde(default)]
    case_insensitive: bool,
    #[serde(default)]
    output_mode: OutputMode,
    #[serde(default)]
    head_limit: Option<usize>,
}

pub(super) async fn glob(
    input: &Value,
    guard: &SandboxGuard,
    ctx: &WorkspaceContext,
) -> Result<String, ToolError> {
    let args: GlobArgs = parse_args(input)?;
    let root = base_dir(args.path.as_deref(), guard, ctx)?;
    let matcher = compile_glob(&args.pattern)?;
    tokio::task::spawn_blocking(move || glob_blocking(&root, &matcher))
        .await
        .map_err(|err| ToolError::Failed(format!("glob task failed: {err}")))
}

fn glob_blocking(root: &Path, matcher: &GlobMatcher) -> String {
    let mut matches: Vec<(SystemTime, PathBuf)> = collect_files(root)
        .into_iter()
        .filter(|path| {
            path.strip_prefix(root)
                .map(|relative| matcher.is_match(relative))
                .unwrap_or(false)
        })
        .map(|path| {
            let modified = fs::metadata(&path)
                .and_then(|metadata| metadata.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, path)
        })
        .collect();
    if matches.is_empty() {
        return "No files found".to_string();
    }
    matches.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    let total = matches.len();
    let mut lines: Vec<String> = matches
        .into_iter()
        .take(GLOB_LIMIT)
        .map(|(_, path)| path.display().to_string())
        .collect();
    if total > GLOB_LIMIT {
        lines.push(format!("({} more results truncated)", total - GLOB_LIMIT));
    }
    lines.join("\n")
}

pub(super) async fn grep(
    input: &Value,
    guard: &SandboxGuard,
    ctx: &WorkspaceContext,
) -> Result<String, ToolError> {
    let args: GrepArgs = parse_args(input)?;
    let root = base_dir(args.path.as_deref(), guard, ctx)?;
    let regex = if args.case_insensitive {
        Regex::with_flags(&args.pattern, "i")
    } else {
        Regex::new(&args.pattern)
    }
    .map_err(|err| ToolError::InvalidArguments(format!("invalid pattern: {err}")))?;
    let filter = args.glob.as_deref().map(compile_glob).transpose()?;
    let mode = args.output_mode;
    let limit = args.head_limit.unwrap_or(DEFAULT_HEAD_LIMIT).max(1);

    tokio::task::spawn_blocking(move || grep_blocking(&root, &regex, filter.as_ref(), mode, limit))
        .await
        .map_err(|err| ToolError::Failed(format!("grep task failed: {err}")))
}

fn grep_blocking(
    root: &Path,
    regex: &Regex,
    filter: Option<&GlobMatcher>,
    mode: OutputMode,
    limit: usize,
) -> String {
    // a single file searches just that file
    let files = if root.is_file() {
        vec![root.to_path_buf()]
    } else {
        collect_files(root)
    };
    let mut lines = Vec::new();
    for file in files {
        if lines.len() >= limit {
            break;
        }
        if let Some(filter) = filter {
            let candidate = file.strip_prefix(root).unwrap_or(&file);
            let by_name = file
                .file_name()
                .map(|name| filter.is_match(Path::new(name)))
                .unwrap_or(false);
            if !filter.is_match(candidate) && !by_name {
                continue;
            }
        }
        match fs::metadata(&file) {
            Ok(metadata) if metadata.len() <= MAX_FILE_BYTES => {}
            _ => continue,
        }
        let Ok(handle) = fs::File::open(&file) else {
            continue;
        };
        let mut count = 0usize;
        for (index, line) in BufReader::new(handle).lines().enumerate() {
            // binary or non-UTF-8 content stops the scan of this file
            let Ok(line) = line else {
                break;
            };
            if regex.find(&line).is_none() {
                continue;
            }
            count += 1;
            match mode {
                OutputMode::FilesWithMatches => break,
                OutputMode::Content => {
                    lines.push(format!("{}:{}:{}", file.display(), index + 1, line));
                    if lines.len() >= limit {
                        break;
                    }
                }
                OutputMode::Count => {}
            }
        }
        if count == 0 {
            continue;
        }
        match mode {
            OutputMode::FilesWithMatches => lines.push(file.display().to_string()),
            OutputMode::Count => lines.push(format!("{}:{count}", file.display())),
            OutputMode::Content => {}
        }
    }
    if lines.is_empty() {
        return "No matches found".to_string();
    }
    lines.join("\n")
}

fn compile_glob(pattern: &str) -> Result<GlobMatcher, ToolError> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|err| ToolError::InvalidArguments(format!("invalid glob: {err}")))
}

fn is_ignored_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| IGNORED_DIRS.contains(&name))
        .unwrap_or(false)
}

fn collect_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            if files.len() >= MAX_FILES {
                return files;
            }
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_symlink() {
                continue;
            }
            let path = entry.path();
            if file_type.is_dir() {
                if !is_ignored_dir(&path) {
                    stack.push(path);
                }
            } else if file_type.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{ctx, guard};
    use serde_json::json;

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        fs::create_dir_all(dir.path().join("target")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {\n    run();\n}\n").unwrap();
        fs::write(dir.path().join("src/nested/lib.rs"), "pub fn run() {}\n").unwrap();
        fs::write(dir.path().join("README.md"), "Run the thing\n").unwrap();
        fs::write(dir.path().join("target/out.rs"), "fn run() {}\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn glob_matches_nested_and_skips_ignored_dirs() {
        let dir = workspace();
        let output = glob(&json!({"pattern": "**/*.rs"}), &guard(), &ctx(dir.path()))
            .await
            .unwrap();
        let mut found: Vec<&str> = output.lines().collect();
        found.sort();
        assert_eq!(found.len(), 2);
        assert!(found[0].ends_with("src/main.rs"));
        assert!(found[1].ends_with("src/nested/lib.rs"));
    }

    #[tokio::test]
    async fn glob_single_star_stays_in_one_directory() {
        let dir = workspace();
        let output = glob(&json!({"pattern": "src/*.rs"}), &guard(), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(output.lines().count(), 1);
        assert!(output.ends_with("src/main.rs"));
    }

    #[tokio::test]
    async fn grep_modes() {
        let dir = workspace();
        let ctx = ctx(dir.path());

        let files = grep(&json!({"pattern": "run"}), &guard(), &ctx).await.unwrap();
        assert_eq!(files.lines().count(), 2);

        let content = grep(
            &json!({"pattern": "run", "output_mode": "content", "glob": "main.rs"}),
            &guard(),
            &ctx,
        )
        .await
        .unwrap();
        assert!(content.ends_with("src/main.rs:2:    run();"));

        let insensitive = grep(
            &json!({"pattern": "^run", "case_insensitive": true, "output_mode": "count"}),
            &guard(),
            &ctx,
        )
        .await
        .unwrap();
        assert!(insensitive.ends_with("README.md:1"));
    }

    #[tokio::test]
    async fn grep_rejects_bad_pattern() {
        let dir = workspace();
        let err = grep(&json!({"pattern": "("}), &guard(), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn search_outside_workspace_is_denied() {
        let dir = workspace();
        let err = glob(&json!({"pattern": "*", "path": "/etc"}), &guard(), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Sandbox(_)));
    }
}
