//! Gated shell execution.
//!
//! The security gate runs in the hook pipeline before this handler is
//! reached; the handler itself just executes and captures output with a
//! hard timeout.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::process::Command;

use super::{Tool, ToolContext, require_str};
use crate::runtime::ToolOutput;

const DEFAULT_TIMEOUT_SECS: u64 = 120;
const MAX_OUTPUT_BYTES: usize = 30_000;

pub struct BashTool;

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &'static str {
        "bash"
    }

    fn description(&self) -> &'static str {
        "Run a shell command in the project directory (allowlist-gated)"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string"},
                "timeout_secs": {"type": "integer"}
            },
            "required": ["command"]
        })
    }

    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let command = require_str(&input, "command")?;
        let timeout_secs = input
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.paths.project_dir)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(Duration::from_secs(timeout_secs), child).await {
            Ok(result) => result.context("Failed to run command")?,
            Err(_) => {
                return Ok(ToolOutput::error(format!(
                    "command timed out after {timeout_secs}s"
                )));
            }
        };

        let mut text = String::new();
        text.push_str(&String::from_utf8_lossy(&output.stdout));
        if !output.stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        if text.len() > MAX_OUTPUT_BYTES {
            text.truncate(MAX_OUTPUT_BYTES);
            text.push_str("\n... (output truncated)");
        }

        if output.status.success() {
            Ok(ToolOutput::ok(text))
        } else {
            let code = output.status.code().unwrap_or(-1);
            Ok(ToolOutput::error(format!("exit code {code}\n{text}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_context;

    #[tokio::test]
    async fn captures_stdout() {
        let (ctx, _dir) = test_context();
        let out = BashTool
            .handle(&ctx, json!({"command": "echo hello"}))
            .await
            .unwrap();
        assert!(!out.is_error);
        assert!(out.text_content().contains("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_tool_error() {
        let (ctx, _dir) = test_context();
        let out = BashTool
            .handle(&ctx, json!({"command": "ls /definitely/not/here"}))
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.text_content().contains("exit code"));
    }

    #[tokio::test]
    async fn timeout_is_enforced() {
        let (ctx, _dir) = test_context();
        let out = BashTool
            .handle(&ctx, json!({"command": "sleep 5", "timeout_secs": 1}))
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.text_content().contains("timed out"));
    }

    #[tokio::test]
    async fn runs_in_project_directory() {
        let (ctx, _dir) = test_context();
        std::fs::write(ctx.paths.project_dir.join("marker.txt"), "here").unwrap();
        let out = BashTool
            .handle(&ctx, json!({"command": "cat marker.txt"}))
            .await
            .unwrap();
        assert!(out.text_content().contains("here"));
    }
}
