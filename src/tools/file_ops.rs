//! File operation tools: read, write, edit, glob, grep.
//!
//! Paths are resolved against the project directory; absolute paths and
//! traversal out of the project are rejected before any I/O happens.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};

use super::{Tool, ToolContext, require_str};
use crate::runtime::ToolOutput;

pub fn tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(ReadFileTool),
        Arc::new(WriteFileTool),
        Arc::new(EditFileTool),
        Arc::new(GlobTool),
        Arc::new(GrepTool),
    ]
}

/// Resolve a relative path inside the project, rejecting escapes.
fn resolve(project_dir: &Path, relative: &str) -> Result<PathBuf> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        anyhow::bail!("absolute paths are not allowed: {relative}");
    }
    if candidate
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        anyhow::bail!("path escapes the project directory: {relative}");
    }
    Ok(project_dir.join(candidate))
}

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> &'static str {
        "Read a file from the project, optionally a line range"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {"type": "string"},
                "offset": {"type": "integer"},
                "limit": {"type": "integer"}
            },
            "required": ["file_path"]
        })
    }

    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let path = resolve(&ctx.paths.project_dir, require_str(&input, "file_path")?)?;
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => return Ok(ToolOutput::error(format!("read failed: {e}"))),
        };
        let offset = input.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
        let limit = input
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(2000) as usize;
        let selected: Vec<&str> = content.lines().skip(offset).take(limit).collect();
        Ok(ToolOutput::ok(selected.join("\n")))
    }
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &'static str {
        "write_file"
    }

    fn description(&self) -> &'static str {
        "Write content to a file, creating parent directories as needed"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["file_path", "content"]
        })
    }

    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let relative = require_str(&input, "file_path")?;
        let path = resolve(&ctx.paths.project_dir, relative)?;
        let content = require_str(&input, "content")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create parent directories")?;
        }
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(ToolOutput::ok(format!(
            "wrote {} bytes to {relative}",
            content.len()
        )))
    }
}

pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &'static str {
        "edit_file"
    }

    fn description(&self) -> &'static str {
        "Replace an exact string in a file; old_string must match uniquely"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {"type": "string"},
                "old_string": {"type": "string"},
                "new_string": {"type": "string"}
            },
            "required": ["file_path", "old_string", "new_string"]
        })
    }

    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let relative = require_str(&input, "file_path")?;
        let path = resolve(&ctx.paths.project_dir, relative)?;
        let old = require_str(&input, "old_string")?;
        let new = require_str(&input, "new_string")?;

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => return Ok(ToolOutput::error(format!("read failed: {e}"))),
        };
        let matches = content.matches(old).count();
        if matches == 0 {
            return Ok(ToolOutput::error("old_string not found in file"));
        }
        if matches > 1 {
            return Ok(ToolOutput::error(format!(
                "old_string matches {matches} times; provide a unique anchor"
            )));
        }
        std::fs::write(&path, content.replacen(old, new, 1))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(ToolOutput::ok(format!("edited {relative}")))
    }
}

pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &'static str {
        "glob"
    }

    fn description(&self) -> &'static str {
        "List project files matching a glob pattern"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string"}
            },
            "required": ["pattern"]
        })
    }

    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let pattern = require_str(&input, "pattern")?;
        if pattern.contains("..") || Path::new(pattern).is_absolute() {
            return Ok(ToolOutput::error("pattern must stay inside the project"));
        }
        let full = ctx.paths.project_dir.join(pattern);
        let Some(full) = full.to_str() else {
            return Ok(ToolOutput::error("pattern is not valid UTF-8"));
        };

        let mut matches = Vec::new();
        for entry in glob::glob(full).context("Invalid glob pattern")? {
            let path = entry?;
            if let Ok(relative) = path.strip_prefix(&ctx.paths.project_dir) {
                matches.push(relative.display().to_string());
            }
        }
        matches.sort();
        Ok(ToolOutput::ok(matches.join("\n")))
    }
}

pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &'static str {
        "grep"
    }

    fn description(&self) -> &'static str {
        "Search project files for a regex pattern"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string"},
                "glob": {"type": "string"}
            },
            "required": ["pattern"]
        })
    }

    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let regex = match Regex::new(require_str(&input, "pattern")?) {
            Ok(regex) => regex,
            Err(e) => return Ok(ToolOutput::error(format!("invalid regex: {e}"))),
        };
        let file_glob = input
            .get("glob")
            .and_then(Value::as_str)
            .unwrap_or("**/*");
        if file_glob.contains("..") || Path::new(file_glob).is_absolute() {
            return Ok(ToolOutput::error("glob must stay inside the project"));
        }

        let full = ctx.paths.project_dir.join(file_glob);
        let Some(full) = full.to_str() else {
            return Ok(ToolOutput::error("glob is not valid UTF-8"));
        };

        let mut hits = Vec::new();
        for entry in glob::glob(full).context("Invalid glob pattern")? {
            let path = entry?;
            if !path.is_file() {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue; // binary or unreadable
            };
            let relative = path
                .strip_prefix(&ctx.paths.project_dir)
                .unwrap_or(&path)
                .display()
                .to_string();
            for (line_no, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    hits.push(format!("{relative}:{}:{line}", line_no + 1));
                    if hits.len() >= 200 {
                        hits.push("... (truncated)".to_string());
                        return Ok(ToolOutput::ok(hits.join("\n")));
                    }
                }
            }
        }
        Ok(ToolOutput::ok(hits.join("\n")))
    }
}
