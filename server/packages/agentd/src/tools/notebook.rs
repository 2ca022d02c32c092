use std::path::Path;

use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_args, ToolError, WorkspaceContext};
use crate::sandbox::SandboxGuard;

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum EditMode {
    #[default]
    Replace,
    Insert,
    Delete,
}

#[derive(Debug, Deserialize)]
struct NotebookEditArgs {
    notebook_path: String,
    #[serde(default)]
    cell_id: Option<String>,
    #[serde(default)]
    cell_index: Option<usize>,
    new_source: String,
    #[serde(default)]
    cell_type: Option<String>,
    #[serde(default)]
    edit_mode: EditMode,
}

pub(super) async fn edit(
    input: &Value,
    guard: &SandboxGuard,
    ctx: &WorkspaceContext,
) -> Result<String, ToolError> {
    let args: NotebookEditArgs = parse_args(input)?;
    let path = guard.validate_path(Path::new(&args.notebook_path), &ctx.policy)?;
    let raw = tokio::fs::read_to_string(&path).await.map_err(|err| {
        ToolError::Failed(format!("failed to read {}: {err}", path.display()))
    })?;
    let mut notebook: Value = serde_json::from_str(&raw)
        .map_err(|err| ToolError::Failed(format!("{} is not a valid notebook: {err}", path.display())))?;
    let cells = notebook
        .get_mut("cells")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| ToolError::Failed(format!("{} has no cells array", path.display())))?;

    let target = locate(cells, &args)?;
    let summary = match args.edit_mode {
        EditMode::Replace => {
            let index = target.ok_or_else(|| {
                ToolError::InvalidArguments("replace needs cell_id or cell_index".to_string())
            })?;
            let cell = &mut cells[index];
            cell["source"] = source_lines(&args.new_source);
            if let Some(cell_type) = &args.cell_type {
                cell["cell_type"] = Value::String(cell_type.clone());
            }
            format!("Replaced cell {index}")
        }
        EditMode::Insert => {
            let cell_type = args.cell_type.as_deref().unwrap_or("code");
            let mut cell = json!({
                "cell_type": cell_type,
                "id": uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
                "metadata": {},
                "source": source_lines(&args.new_source),
            });
            if cell_type == "code" {
                cell["outputs"] = json!([]);
                cell["execution_count"] = Value::Null;
            }
            // new cells go after the referenced one, or first when none is given
            let index = target.map(|index| index + 1).unwrap_or(0);
            cells.insert(index, cell);
            format!("Inserted {cell_type} cell at {index}")
        }
        EditMode::Delete => {
            let index = target.ok_or_else(|| {
                ToolError::InvalidArguments("delete needs cell_id or cell_index".to_string())
            })?;
            cells.remove(index);
            format!("Deleted cell {index}")
        }
    };

    let mut serialized = serde_json::to_string_pretty(&notebook)
        .map_err(|err| ToolError::Failed(format!("failed to encode notebook: {err}")))?;
    serialized.push('\n');
    tokio::fs::write(&path, serialized).await?;
    Ok(format!("{summary} in {}", path.display()))
}

fn locate(cells: &[Value], args: &NotebookEditArgs) -> Result<Option<usize>, ToolError> {
    if let Some(id) = &args.cell_id {
        return cells
            .iter()
            .position(|cell| cell.get("id").and_then(Value::as_str) == Some(id.as_str()))
            .map(Some)
            .ok_or_else(|| ToolError::Failed(format!("cell {id} not found")));
    }
    match args.cell_index {
        Some(index) if index < cells.len() => Ok(Some(index)),
        Some(index) => Err(ToolError::Failed(format!(
            "cell index {index} out of range ({} cells)",
            cells.len()
        ))),
        None => Ok(None),
    }
}

fn source_lines(source: &str) -> Value {
    Value::Array(
        source
            .split_inclusive('\n')
            .map(|line| Value::String(line.to_string()))
            .collect(),
    )
}
