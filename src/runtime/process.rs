//! Adapter to an external agent process.
//!
//! The agent command is spawned once per session. It receives a JSON
//! header (prompt + tool catalog) on stdin, then emits newline-delimited
//! JSON events on stdout; tool results are written back to its stdin.
//! The process is the opaque LLM runtime — this adapter only moves the
//! stream.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::{AgentEvent, AgentRuntime, SessionPrompt, ToolOutput, ToolSpec};

pub struct ProcessRuntime {
    command: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
}

impl ProcessRuntime {
    /// `command` is run via `sh -c` with the project directory as cwd.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            child: None,
            stdin: None,
            stdout: None,
        }
    }
}

#[async_trait]
impl AgentRuntime for ProcessRuntime {
    async fn start(&mut self, prompt: &SessionPrompt, catalog: &[ToolSpec]) -> Result<()> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn agent command: {}", self.command))?;

        let mut stdin = child.stdin.take().context("agent stdin unavailable")?;
        let stdout = child.stdout.take().context("agent stdout unavailable")?;

        let header = json!({
            "type": "session",
            "system": prompt.system,
            "user": prompt.user,
            "tools": catalog,
        });
        stdin
            .write_all(format!("{header}\n").as_bytes())
            .await
            .context("Failed to send session header")?;

        self.stdin = Some(stdin);
        self.stdout = Some(BufReader::new(stdout).lines());
        self.child = Some(child);
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<AgentEvent>> {
        let lines = self.stdout.as_mut().context("runtime not started")?;
        loop {
            let Some(line) = lines.next_line().await? else {
                return Ok(None); // agent closed its stdout
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AgentEvent>(&line) {
                Ok(event) => return Ok(Some(event)),
                Err(_) => continue, // stray non-protocol output
            }
        }
    }

    async fn provide_tool_result(&mut self, id: &str, result: ToolOutput) -> Result<()> {
        let stdin = self.stdin.as_mut().context("runtime not started")?;
        let frame = json!({
            "type": "tool_result",
            "id": id,
            "content": result.content,
            "is_error": result.is_error,
        });
        stdin
            .write_all(format!("{frame}\n").as_bytes())
            .await
            .context("Failed to send tool result")?;
        Ok(())
    }
}

impl Drop for ProcessRuntime {
    fn drop(&mut self) {
        if let Some(child) = &mut self.child {
            child.start_kill().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A tiny shell agent that emits one message, one tool call, reads
    /// the result, and finishes.
    const FAKE_AGENT: &str = r#"
read -r _header
printf '%s\n' '{"type":"message","text":"hi","usage":{"input_tokens":10,"output_tokens":2}}'
printf '%s\n' '{"type":"tool_call","id":"t1","name":"progress_status","input":{}}'
read -r _result
printf '%s\n' '{"type":"done","summary":"done"}'
"#;

    #[tokio::test]
    async fn round_trips_events_with_a_child_process() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("agent.sh");
        std::fs::write(&script, FAKE_AGENT).unwrap();

        let mut runtime = ProcessRuntime::new(format!("sh {}", script.display()));
        runtime
            .start(&SessionPrompt::default(), &[])
            .await
            .unwrap();

        let Some(AgentEvent::Message { usage, .. }) = runtime.next_event().await.unwrap() else {
            panic!("expected message");
        };
        assert_eq!(usage.input_tokens, 10);

        let Some(AgentEvent::ToolCall { id, name, .. }) = runtime.next_event().await.unwrap()
        else {
            panic!("expected tool call");
        };
        assert_eq!(name, "progress_status");

        runtime
            .provide_tool_result(&id, ToolOutput::ok("{}"))
            .await
            .unwrap();

        let Some(AgentEvent::Done { summary }) = runtime.next_event().await.unwrap() else {
            panic!("expected done");
        };
        assert_eq!(summary.as_deref(), Some("done"));
        assert!(runtime.next_event().await.unwrap().is_none());
    }
}
