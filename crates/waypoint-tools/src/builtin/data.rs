//! Spillover data tools. Each session gets a private `data/` directory where
//! the model can park content too large to carry in the conversation and
//! pull it back later, possibly from another phase.

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::Tool;
use waypoint_core::types::ToolContext;

const DEFAULT_LOAD_LIMIT: usize = 10_000;

/// Resolve `filename` inside the data directory. Only plain file names are
/// accepted.
fn resolve(data_dir: &Path, filename: &str) -> Result<PathBuf> {
    let trimmed = filename.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains('/')
        || trimmed.contains('\\')
    {
        return Err(WaypointError::ToolValidation(format!(
            "invalid filename '{}': use a plain file name without directories",
            filename
        )));
    }
    Ok(data_dir.join(trimmed))
}

fn io_err(tool: &str, path: &Path, e: std::io::Error) -> WaypointError {
    WaypointError::ToolExecution {
        tool: tool.to_string(),
        message: format!("{}: {}", path.display(), e),
    }
}

fn filename_schema() -> serde_json::Value {
    json!({
        "type": "string",
        "description": "Plain file name inside the session data directory, e.g. \"findings.json\""
    })
}

// ── save_data ───────────────────────────────────────────────────

pub struct SaveDataTool;

#[derive(Deserialize)]
struct WriteInput {
    filename: String,
    data: String,
}

impl Tool for SaveDataTool {
    fn name(&self) -> &str {
        "save_data"
    }

    fn description(&self) -> &str {
        "Save content to a file in the session data directory, replacing any existing file. \
         Use it for results too large to keep in the conversation."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "filename": filename_schema(),
                "data": { "type": "string", "description": "Content to write" }
            },
            "required": ["filename", "data"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let params: WriteInput = serde_json::from_value(input)
                .map_err(|e| WaypointError::ToolValidation(e.to_string()))?;
            let path = resolve(&ctx.data_dir, &params.filename)?;
            debug!(path = %path.display(), "Saving data file");

            tokio::fs::create_dir_all(&ctx.data_dir)
                .await
                .map_err(|e| io_err("save_data", &ctx.data_dir, e))?;
            tokio::fs::write(&path, params.data.as_bytes())
                .await
                .map_err(|e| io_err("save_data", &path, e))?;

            Ok(json!({
                "success": true,
                "filename": params.filename.trim(),
                "size_bytes": params.data.len(),
            }))
        })
    }
}

// ── append_data ─────────────────────────────────────────────────

pub struct AppendDataTool;

impl Tool for AppendDataTool {
    fn name(&self) -> &str {
        "append_data"
    }

    fn description(&self) -> &str {
        "Append content to a file in the session data directory, creating it if needed. \
         Use it to build large files in several smaller calls."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "filename": filename_schema(),
                "data": { "type": "string", "description": "Content to append" }
            },
            "required": ["filename", "data"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let params: WriteInput = serde_json::from_value(input)
                .map_err(|e| WaypointError::ToolValidation(e.to_string()))?;
            let path = resolve(&ctx.data_dir, &params.filename)?;
            debug!(path = %path.display(), "Appending to data file");

            tokio::fs::create_dir_all(&ctx.data_dir)
                .await
                .map_err(|e| io_err("append_data", &ctx.data_dir, e))?;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| io_err("append_data", &path, e))?;
            file.write_all(params.data.as_bytes())
                .await
                .map_err(|e| io_err("append_data", &path, e))?;
            file.flush()
                .await
                .map_err(|e| io_err("append_data", &path, e))?;

            let size = tokio::fs::metadata(&path)
                .await
                .map(|m| m.len())
                .map_err(|e| io_err("append_data", &path, e))?;

            Ok(json!({
                "success": true,
                "filename": params.filename.trim(),
                "size_bytes": size,
            }))
        })
    }
}

// ── load_data ───────────────────────────────────────────────────

pub struct LoadDataTool;

#[derive(Deserialize)]
struct LoadInput {
    filename: String,
    #[serde(default)]
    offset_bytes: usize,
    #[serde(default)]
    limit_bytes: Option<usize>,
}

impl Tool for LoadDataTool {
    fn name(&self) -> &str {
        "load_data"
    }

    fn description(&self) -> &str {
        "Load content from a file in the session data directory. Large files are \
         returned in chunks: pass offset_bytes to continue where has_more left off."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "filename": filename_schema(),
                "offset_bytes": { "type": "integer", "description": "Byte offset to start from (default 0)" },
                "limit_bytes": { "type": "integer", "description": "Maximum bytes to return (default 10000)" }
            },
            "required": ["filename"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let params: LoadInput = serde_json::from_value(input)
                .map_err(|e| WaypointError::ToolValidation(e.to_string()))?;
            let path = resolve(&ctx.data_dir, &params.filename)?;

            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| io_err("load_data", &path, e))?;

            let limit = params.limit_bytes.unwrap_or(DEFAULT_LOAD_LIMIT).max(1);
            let (start, end) = chunk_bounds(&content, params.offset_bytes, limit);

            Ok(json!({
                "filename": params.filename.trim(),
                "content": &content[start..end],
                "offset_bytes": start,
                "size_bytes": content.len(),
                "has_more": end < content.len(),
            }))
        })
    }
}

/// Byte range `[start, end)` of at most roughly `limit` bytes starting near
/// `offset`, adjusted to UTF-8 character boundaries.
fn chunk_bounds(content: &str, offset: usize, limit: usize) -> (usize, usize) {
    let len = content.len();
    let mut start = offset.min(len);
    while !content.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = start.saturating_add(limit).min(len);
    while !content.is_char_boundary(end) {
        end += 1;
    }
    (start, end)
}

// ── list_data_files ─────────────────────────────────────────────

pub struct ListDataFilesTool;

impl Tool for ListDataFilesTool {
    fn name(&self) -> &str {
        "list_data_files"
    }

    fn description(&self) -> &str {
        "List the files in the session data directory with their sizes."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    fn execute(
        &self,
        _input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let files = list_files(&ctx.data_dir)
                .await
                .map_err(|e| io_err("list_data_files", &ctx.data_dir, e))?;
            let files: Vec<serde_json::Value> = files
                .into_iter()
                .map(|(name, size)| json!({ "filename": name, "size_bytes": size }))
                .collect();
            Ok(json!({ "files": files }))
        })
    }
}

/// `(name, size)` of every regular file in `dir`, sorted by name.
/// A missing directory has no files.
pub async fn list_files(dir: &Path) -> std::io::Result<Vec<(String, u64)>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            files.push((name.to_string(), meta.len()));
        }
    }
    files.sort();
    Ok(files)
}
