//! Append-only, crash-safe event log.
//!
//! The log is the authoritative timeline of a project: one JSON object per
//! line in `.events.jsonl`, fsynced before `append` returns. Relational
//! rows in the store are derived views. A partially written trailing
//! record (crash mid-write) is skipped on read; nothing that `append`
//! acknowledged can disappear.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Every observable action in the system maps to one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStart,
    SessionEnd,
    ToolCall,
    ToolResult,
    ToolError,
    ToolBlocked,
    Decision,
    Checkpoint,
    Injection,
    Escalation,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionStart => "session_start",
            EventType::SessionEnd => "session_end",
            EventType::ToolCall => "tool_call",
            EventType::ToolResult => "tool_result",
            EventType::ToolError => "tool_error",
            EventType::ToolBlocked => "tool_blocked",
            EventType::Decision => "decision",
            EventType::Checkpoint => "checkpoint",
            EventType::Injection => "injection",
            EventType::Escalation => "escalation",
            EventType::Error => "error",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One record in the timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: i64,
    pub session_id: i64,
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: Value,
}

impl Event {
    pub fn new(session_id: i64, event_type: EventType, payload: Value) -> Self {
        Self {
            event_id: 0, // assigned by the log on append
            session_id,
            ts: Utc::now(),
            event_type,
            payload,
        }
    }
}

/// Durable writer plus reader over the JSONL sink.
pub struct EventLog {
    path: PathBuf,
    file: File,
    next_id: i64,
}

impl EventLog {
    /// Open (or create) the log, scanning existing records to resume the
    /// id sequence past any prior run.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let next_id = if path.exists() {
            read_events_from(&path)?
                .iter()
                .map(|e| e.event_id)
                .max()
                .unwrap_or(0)
                + 1
        } else {
            1
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open event log at {}", path.display()))?;
        Ok(Self {
            path,
            file,
            next_id,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event durably. Returns the assigned event id only after
    /// the bytes have reached disk.
    pub fn append(&mut self, mut event: Event) -> Result<i64> {
        event.event_id = self.next_id;
        let line = serde_json::to_string(&event).context("Failed to serialize event")?;
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.write_all(b"\n"))
            .and_then(|_| self.file.sync_data())
            .context("Failed to write event record")?;
        self.next_id += 1;
        Ok(event.event_id)
    }

    /// All events, optionally restricted to one session. Malformed
    /// trailing records are skipped.
    pub fn iter(&self, session_id: Option<i64>) -> Result<Vec<Event>> {
        let events = read_events_from(&self.path)?;
        Ok(match session_id {
            Some(id) => events.into_iter().filter(|e| e.session_id == id).collect(),
            None => events,
        })
    }

    /// Ordered event list for one session.
    pub fn reconstruct_session(&self, session_id: i64) -> Result<Vec<Event>> {
        let mut events = self.iter(Some(session_id))?;
        events.sort_by_key(|e| e.event_id);
        Ok(events)
    }

    /// Derived snapshot of the timeline at a point in time: how many of
    /// each event type had happened, and the last event per session.
    pub fn context_at(&self, ts: DateTime<Utc>) -> Result<TimelineContext> {
        let mut context = TimelineContext::default();
        for event in self.iter(None)? {
            if event.ts > ts {
                continue;
            }
            *context
                .counts
                .entry(event.event_type.as_str().to_string())
                .or_default() += 1;
            let newer = context
                .last_event_per_session
                .get(&event.session_id)
                .map(|e: &Event| e.event_id < event.event_id)
                .unwrap_or(true);
            if newer {
                context.last_event_per_session.insert(event.session_id, event);
            }
        }
        Ok(context)
    }

    /// Aggregate counters over the whole log.
    pub fn metrics(&self) -> Result<RunMetrics> {
        let mut metrics = RunMetrics::default();
        for event in self.iter(None)? {
            match event.event_type {
                EventType::SessionEnd => metrics.sessions += 1,
                EventType::ToolCall => {
                    metrics.tool_calls += 1;
                    metrics.input_tokens += token_count(&event.payload, "input_tokens");
                    metrics.output_tokens += token_count(&event.payload, "output_tokens");
                }
                EventType::ToolResult => {
                    metrics.input_tokens += token_count(&event.payload, "input_tokens");
                    metrics.output_tokens += token_count(&event.payload, "output_tokens");
                }
                EventType::ToolError => metrics.tool_errors += 1,
                EventType::ToolBlocked => metrics.tool_blocked += 1,
                EventType::Escalation => metrics.escalations += 1,
                _ => {}
            }
        }
        Ok(metrics)
    }
}

fn token_count(payload: &Value, key: &str) -> u64 {
    payload.get(key).and_then(Value::as_u64).unwrap_or(0)
}

/// Read every well-formed record from the file. A torn final line (or any
/// line that fails to parse) is ignored rather than failing the read.
fn read_events_from(path: &Path) -> Result<Vec<Event>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read event log line")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(&line) {
            Ok(event) => events.push(event),
            Err(_) => continue, // torn or corrupt record
        }
    }
    Ok(events)
}

/// Timeline state reconstructed up to a timestamp.
#[derive(Debug, Default)]
pub struct TimelineContext {
    pub counts: std::collections::HashMap<String, u64>,
    pub last_event_per_session: std::collections::HashMap<i64, Event>,
}

/// Counters derived from a full scan of the log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    pub sessions: u64,
    pub tool_calls: u64,
    pub tool_errors: u64,
    pub tool_blocked: u64,
    pub escalations: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}
