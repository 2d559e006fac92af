//! Server lifecycle tools and process tracking.
//!
//! Dev servers spawned by the agent are tracked by name so later calls
//! (and the supervisor on shutdown) can stop them without resorting to
//! process-wide kills.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::{Tool, ToolContext, require_str};
use crate::runtime::ToolOutput;

pub fn tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(ServerStartTool),
        Arc::new(ServerStopTool),
        Arc::new(ServerWaitTool),
        Arc::new(ServerStatusTool),
    ]
}

struct TrackedProcess {
    child: Child,
    command: String,
    port: Option<u16>,
}

/// Registry of background processes started through the server tools.
#[derive(Clone)]
pub struct ProcessTracker {
    inner: Arc<Mutex<HashMap<String, TrackedProcess>>>,
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn insert(&self, name: String, child: Child, command: String, port: Option<u16>) {
        self.inner.lock().await.insert(
            name,
            TrackedProcess {
                child,
                command,
                port,
            },
        );
    }

    /// Kill and forget one process. Returns false when the name is
    /// unknown.
    pub async fn stop(&self, name: &str) -> Result<bool> {
        let mut map = self.inner.lock().await;
        let Some(mut tracked) = map.remove(name) else {
            return Ok(false);
        };
        tracked.child.kill().await.ok();
        Ok(true)
    }

    /// Kill everything. Called by the supervisor during shutdown.
    pub async fn stop_all(&self) {
        let mut map = self.inner.lock().await;
        for (_, tracked) in map.iter_mut() {
            tracked.child.kill().await.ok();
        }
        map.clear();
    }

    pub async fn status(&self) -> Vec<Value> {
        let mut map = self.inner.lock().await;
        let mut out = Vec::new();
        for (name, tracked) in map.iter_mut() {
            let running = matches!(tracked.child.try_wait(), Ok(None));
            out.push(json!({
                "name": name,
                "command": tracked.command,
                "port": tracked.port,
                "running": running,
                "pid": tracked.child.id(),
            }));
        }
        out.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        out
    }
}

impl Default for ProcessTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ServerStartTool;

#[async_trait]
impl Tool for ServerStartTool {
    fn name(&self) -> &'static str {
        "server_start"
    }

    fn description(&self) -> &'static str {
        "Start a named background dev server in the project directory"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "command": {"type": "string"},
                "port": {"type": "integer"}
            },
            "required": ["name", "command"]
        })
    }

    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let name = require_str(&input, "name")?.to_string();
        let command = require_str(&input, "command")?.to_string();
        let port = input
            .get("port")
            .and_then(Value::as_u64)
            .map(|p| p as u16);

        if ctx.processes.status().await.iter().any(|p| p["name"] == name.as_str()) {
            return Ok(ToolOutput::error(format!(
                "a server named '{name}' is already tracked; stop it first"
            )));
        }

        let child = match Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&ctx.paths.project_dir)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return Ok(ToolOutput::error(format!("spawn failed: {e}"))),
        };

        let pid = child.id();
        ctx.processes
            .insert(name.clone(), child, command, port)
            .await;
        Ok(ToolOutput::ok(
            json!({"name": name, "pid": pid, "port": port}).to_string(),
        ))
    }
}

pub struct ServerStopTool;

#[async_trait]
impl Tool for ServerStopTool {
    fn name(&self) -> &'static str {
        "server_stop"
    }

    fn description(&self) -> &'static str {
        "Stop a tracked dev server by name"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "required": ["name"]
        })
    }

    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let name = require_str(&input, "name")?;
        if ctx.processes.stop(name).await? {
            Ok(ToolOutput::ok(format!("stopped '{name}'")))
        } else {
            Ok(ToolOutput::error(format!("no tracked server named '{name}'")))
        }
    }
}

pub struct ServerWaitTool;

#[async_trait]
impl Tool for ServerWaitTool {
    fn name(&self) -> &'static str {
        "server_wait"
    }

    fn description(&self) -> &'static str {
        "Wait until a TCP port accepts connections"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "port": {"type": "integer"},
                "timeout_secs": {"type": "integer"}
            },
            "required": ["port"]
        })
    }

    async fn handle(&self, _ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let port = input
            .get("port")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow::anyhow!("missing required field 'port'"))? as u16;
        let timeout_secs = input
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .unwrap_or(30);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
        loop {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(_) => return Ok(ToolOutput::ok(format!("port {port} is accepting"))),
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
                Err(e) => {
                    return Ok(ToolOutput::error(format!(
                        "port {port} not ready after {timeout_secs}s: {e}"
                    )));
                }
            }
        }
    }
}

pub struct ServerStatusTool;

#[async_trait]
impl Tool for ServerStatusTool {
    fn name(&self) -> &'static str {
        "server_status"
    }

    fn description(&self) -> &'static str {
        "List tracked dev servers and whether they are still running"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn handle(&self, ctx: &ToolContext, _input: Value) -> Result<ToolOutput> {
        let status = ctx.processes.status().await;
        Ok(ToolOutput::ok(json!(status).to_string()))
    }
}
