//! Contract with the LLM runtime that executes a session.
//!
//! The runtime is an opaque callable: it consumes a prompt and a tool
//! catalog and emits a stream of tool invocations and textual messages.
//! It must await each tool result before proceeding and must expose token
//! counts on every message for budget accounting.
//!
//! `ScriptedRuntime` replays a canned sequence for tests and replay;
//! `process::ProcessRuntime` adapts an external agent over stdio.

pub mod process;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

/// Token counts attached to runtime messages.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// One tool as advertised to the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Prompt handed to the runtime at session start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionPrompt {
    pub system: String,
    pub user: String,
}

/// Events emitted by the runtime during a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    Message {
        text: String,
        usage: TokenUsage,
    },
    Done {
        summary: Option<String>,
    },
}

/// Content block in a tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    Text { text: String },
    Image { path: String },
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        ContentItem::Text { text: text.into() }
    }
}

/// Result of one tool invocation, returned to the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: Vec<ContentItem>,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(text)],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(text)],
            is_error: true,
        }
    }

    /// Concatenated text content, for logging and matching.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|item| match item {
                ContentItem::Text { text } => Some(text.as_str()),
                ContentItem::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The LLM runtime as seen by the supervisor.
#[async_trait]
pub trait AgentRuntime: Send {
    /// Begin a session with the composed prompt and tool catalog.
    async fn start(&mut self, prompt: &SessionPrompt, catalog: &[ToolSpec]) -> Result<()>;

    /// Next event in the stream; `None` when the runtime is finished.
    async fn next_event(&mut self) -> Result<Option<AgentEvent>>;

    /// Deliver the result for the tool call with the given id. The
    /// runtime blocks on this before emitting further events.
    async fn provide_tool_result(&mut self, id: &str, result: ToolOutput) -> Result<()>;
}

/// Deterministic runtime double: replays a scripted event sequence and
/// records every tool result it is handed.
pub struct ScriptedRuntime {
    script: VecDeque<AgentEvent>,
    pub started_with: Option<SessionPrompt>,
    pub catalog_size: usize,
    pub results: Vec<(String, ToolOutput)>,
}

impl ScriptedRuntime {
    pub fn new(script: Vec<AgentEvent>) -> Self {
        Self {
            script: script.into(),
            started_with: None,
            catalog_size: 0,
            results: Vec::new(),
        }
    }

    /// Convenience: a tool call step with a generated id.
    pub fn tool_call(id: &str, name: &str, input: Value) -> AgentEvent {
        AgentEvent::ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            input,
        }
    }

    pub fn message(text: &str, input_tokens: u64, output_tokens: u64) -> AgentEvent {
        AgentEvent::Message {
            text: text.to_string(),
            usage: TokenUsage {
                input_tokens,
                output_tokens,
            },
        }
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn start(&mut self, prompt: &SessionPrompt, catalog: &[ToolSpec]) -> Result<()> {
        self.started_with = Some(prompt.clone());
        self.catalog_size = catalog.len();
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<AgentEvent>> {
        Ok(self.script.pop_front())
    }

    async fn provide_tool_result(&mut self, id: &str, result: ToolOutput) -> Result<()> {
        self.results.push((id.to_string(), result));
        Ok(())
    }
}
