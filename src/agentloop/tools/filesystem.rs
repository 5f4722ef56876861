//! Workspace-rooted file system tool.
//!
//! All operations are confined to the workspace root supplied at
//! construction: absolute paths are rejected outright and relative paths are
//! normalised (`..` components resolved) before being joined under the root,
//! so a step cannot escape the workspace through traversal. Violations and
//! I/O problems are ordinary tool failures.
//!
//! Operations, selected by the `op` parameter:
//!
//! - `read` — `{ path }` → `{ content }`
//! - `write` — `{ path, content }` → `{ bytesWritten }` (creates parent dirs)
//! - `list` — `{ path? }` → `{ entries: [{ name, isDirectory }] }`

use std::error::Error;
use std::fs;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::agentloop::tool::{ToolAdapter, ToolInput, ToolResult};

pub struct FileSystemTool {
    workspace_root: PathBuf,
}

impl FileSystemTool {
    /// Confine all operations to `workspace_root`.
    pub fn new(workspace_root: PathBuf) -> Self {
        Self { workspace_root }
    }

    /// Normalise a caller path and join it under the workspace root.
    /// Rejects absolute paths; `..` components pop within the sandbox and
    /// can never climb above it.
    fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            return Err(format!("absolute paths are not allowed: {}", path));
        }

        let mut normalized = PathBuf::new();
        for component in candidate.components() {
            match component {
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(format!("path escapes the workspace: {}", path));
                    }
                }
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                _ => return Err(format!("unsupported path component in: {}", path)),
            }
        }

        Ok(self.workspace_root.join(normalized))
    }

    fn read(&self, path: &str) -> ToolResult {
        let resolved = match self.resolve(path) {
            Ok(p) => p,
            Err(msg) => return ToolResult::failure(msg),
        };
        match fs::read_to_string(&resolved) {
            Ok(content) => {
                let mut output = Map::new();
                output.insert("content".to_string(), json!(content));
                ToolResult::success(output)
            }
            Err(err) => ToolResult::failure(format!("cannot read '{}': {}", path, err)),
        }
    }

    fn write(&self, path: &str, content: &str) -> ToolResult {
        let resolved = match self.resolve(path) {
            Ok(p) => p,
            Err(msg) => return ToolResult::failure(msg),
        };
        if let Some(parent) = resolved.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                return ToolResult::failure(format!("cannot create parent dirs: {}", err));
            }
        }
        match fs::write(&resolved, content) {
            Ok(()) => {
                let mut output = Map::new();
                output.insert("bytesWritten".to_string(), json!(content.len()));
                ToolResult::success(output)
            }
            Err(err) => ToolResult::failure(format!("cannot write '{}': {}", path, err)),
        }
    }

    fn list(&self, path: &str) -> ToolResult {
        let resolved = match self.resolve(path) {
            Ok(p) => p,
            Err(msg) => return ToolResult::failure(msg),
        };
        let entries = match fs::read_dir(&resolved) {
            Ok(entries) => entries,
            Err(err) => return ToolResult::failure(format!("cannot list '{}': {}", path, err)),
        };

        let mut listed = Vec::new();
        for entry in entries.flatten() {
            let is_directory = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            listed.push(json!({
                "name": entry.file_name().to_string_lossy(),
                "isDirectory": is_directory,
            }));
        }
        let mut output = Map::new();
        output.insert("entries".to_string(), Value::Array(listed));
        ToolResult::success(output)
    }
}

#[async_trait]
impl ToolAdapter for FileSystemTool {
    fn id(&self) -> &str {
        "fs"
    }

    fn description(&self) -> &str {
        "Reads, writes, and lists files inside the workspace root"
    }

    async fn execute(&self, input: ToolInput) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let op = input.params.get("op").and_then(|v| v.as_str()).unwrap_or("");
        let path = input.params.get("path").and_then(|v| v.as_str());

        let result = match (op, path) {
            ("read", Some(path)) => self.read(path),
            ("write", Some(path)) => {
                let content = input
                    .params
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                self.write(path, content)
            }
            ("list", path) => self.list(path.unwrap_or(".")),
            (other, _) => ToolResult::failure(format!(
                "unknown or incomplete fs operation: '{}'",
                other
            )),
        };
        Ok(result)
    }
}
