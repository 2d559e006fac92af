//! Post-hoc failure analysis.
//!
//! Scans a session's events, classifies what went wrong, and produces a
//! report with the last good action, the failing action, likely cause,
//! and fixes that worked on similar past failures (matched against cold
//! knowledge). The report is persisted and emitted as an ERROR event.

use anyhow::Result;
use serde_json::{Value, json};

use crate::events::{Event, EventType};
use crate::human::learning::error_class;
use crate::store::StateStore;
use crate::store::models::FailureReport;

/// Session failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    CyclicError,
    BlockedCommands,
    Timeout,
    Crash,
    Regression,
    Ok,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CyclicError => "cyclic_error",
            Self::BlockedCommands => "blocked_commands",
            Self::Timeout => "timeout",
            Self::Crash => "crash",
            Self::Regression => "regression",
            Self::Ok => "ok",
        }
    }
}

pub struct FailureAnalyzer;

impl FailureAnalyzer {
    /// Analyze one session and persist the report.
    pub fn analyze(store: &mut StateStore, session_id: i64) -> Result<FailureReport> {
        let events = store.events_for_session(session_id)?;

        let errors: Vec<&Event> = events
            .iter()
            .filter(|e| e.event_type == EventType::ToolError)
            .collect();
        let blocked: Vec<&Event> = events
            .iter()
            .filter(|e| e.event_type == EventType::ToolBlocked)
            .collect();

        let failure_type = classify(&events, &errors, &blocked);

        let last_successful_action = events
            .iter()
            .rev()
            .find(|e| e.event_type == EventType::ToolResult)
            .and_then(|e| e.payload.get("tool"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let failing_action = errors
            .last()
            .and_then(|e| e.payload.get("tool"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let error_messages: Vec<String> = errors
            .iter()
            .rev()
            .take(5)
            .filter_map(|e| e.payload.get("content").and_then(Value::as_str))
            .map(str::to_string)
            .collect();

        // Match the dominant error against archived knowledge.
        let similar_past_failures = match error_messages.first() {
            Some(message) => store
                .cold_search_knowledge(&first_words(&error_class(message), 4))?
                .into_iter()
                .take(3)
                .map(|k| k.content)
                .collect(),
            None => Vec::new(),
        };

        let (likely_cause, confidence, suggested_fixes) =
            diagnosis(failure_type, &errors, &blocked);

        let report = FailureReport {
            id: 0,
            session_id,
            failure_type: failure_type.as_str().to_string(),
            last_successful_action,
            failing_action,
            error_messages,
            likely_cause,
            confidence,
            similar_past_failures,
            suggested_fixes,
            created_at: String::new(),
        };

        let id = store.insert_failure_report(&report)?;
        store.append_event(
            session_id,
            EventType::Error,
            json!({
                "failure_report_id": id,
                "failure_type": report.failure_type,
                "likely_cause": report.likely_cause,
            }),
        )?;

        Ok(FailureReport { id, ..report })
    }
}

fn classify(events: &[Event], errors: &[&Event], blocked: &[&Event]) -> FailureType {
    // Crash: a synthetic SESSION_END written by recovery.
    if events.iter().any(|e| {
        e.event_type == EventType::SessionEnd
            && e.payload.get("synthetic").and_then(Value::as_bool) == Some(true)
    }) {
        return FailureType::Crash;
    }

    // Cyclic: the same normalized error three or more times.
    let mut classes: std::collections::HashMap<String, usize> = Default::default();
    for error in errors {
        if let Some(content) = error.payload.get("content").and_then(Value::as_str) {
            *classes.entry(error_class(content)).or_default() += 1;
        }
    }
    if classes.values().any(|count| *count >= 3) {
        return FailureType::CyclicError;
    }

    if blocked.len() >= 2 {
        return FailureType::BlockedCommands;
    }

    if errors.iter().any(|e| {
        e.payload
            .get("content")
            .and_then(Value::as_str)
            .map(|c| c.to_lowercase().contains("timed out") || c.to_lowercase().contains("timeout"))
            .unwrap_or(false)
    }) {
        return FailureType::Timeout;
    }

    // Regression surfaced through an escalation.
    if events.iter().any(|e| {
        e.event_type == EventType::Escalation
            && e.payload.get("rule_id").and_then(Value::as_str) == Some("feature_regression")
    }) {
        return FailureType::Regression;
    }

    FailureType::Ok
}

fn diagnosis(
    failure_type: FailureType,
    errors: &[&Event],
    blocked: &[&Event],
) -> (String, f64, Vec<String>) {
    match failure_type {
        FailureType::CyclicError => (
            "The agent is repeating the same failing action without adapting".to_string(),
            0.85,
            vec![
                "Provide guidance on the stuck feature".to_string(),
                "Skip the feature and revisit later".to_string(),
                "Check whether the feature is blocked by another issue".to_string(),
            ],
        ),
        FailureType::BlockedCommands => (
            format!(
                "{} command(s) were blocked by the security allowlist",
                blocked.len()
            ),
            0.9,
            vec![
                "Use allowed alternatives for the blocked commands".to_string(),
                "Review whether the allowlist should grow".to_string(),
            ],
        ),
        FailureType::Timeout => (
            "An operation exceeded its time limit".to_string(),
            0.7,
            vec![
                "Raise the timeout if the operation is legitimately slow".to_string(),
                "Check for a hung dev server or port conflict".to_string(),
            ],
        ),
        FailureType::Crash => (
            "The supervisor process died mid-session; the log was reconstructed on restart"
                .to_string(),
            0.8,
            vec![
                "Inspect the last events before the gap".to_string(),
                "Resume from the latest checkpoint".to_string(),
            ],
        ),
        FailureType::Regression => (
            "A previously passing feature regressed".to_string(),
            0.75,
            vec![
                "Rollback to the checkpoint before the regression".to_string(),
                "Re-verify the regressed feature's evidence".to_string(),
            ],
        ),
        FailureType::Ok => {
            let cause = if errors.is_empty() {
                "No failure signature found".to_string()
            } else {
                "Scattered errors without a dominant pattern".to_string()
            };
            (cause, 0.5, vec![])
        }
    }
}

fn first_words(text: &str, n: usize) -> String {
    text.split_whitespace()
        .take(n)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    fn tool_error(store: &mut StateStore, session_id: i64, content: &str) {
        store
            .append_event(
                session_id,
                EventType::ToolError,
                json!({"tool": "bash", "content": content}),
            )
            .unwrap();
    }

    #[test]
    fn three_identical_errors_classify_as_cyclic() {
        let (mut store, _dir) = test_store();
        let session = store.create_session().unwrap();
        for port in [5173, 5174, 5175] {
            tool_error(&mut store, session.id, &format!("Port {port} in use"));
        }

        let report = FailureAnalyzer::analyze(&mut store, session.id).unwrap();
        assert_eq!(report.failure_type, "cyclic_error");
        assert!(report.confidence >= 0.8);
        assert_eq!(report.failing_action.as_deref(), Some("bash"));
        assert!(!report.suggested_fixes.is_empty());
    }

    #[test]
    fn blocked_commands_classification() {
        let (mut store, _dir) = test_store();
        let session = store.create_session().unwrap();
        for cmd in ["rm -rf /", "sudo reboot"] {
            store
                .append_event(
                    session.id,
                    EventType::ToolBlocked,
                    json!({"tool": "bash", "command": cmd, "reason": "not allowed"}),
                )
                .unwrap();
        }

        let report = FailureAnalyzer::analyze(&mut store, session.id).unwrap();
        assert_eq!(report.failure_type, "blocked_commands");
    }

    #[test]
    fn synthetic_session_end_classifies_as_crash() {
        let (mut store, _dir) = test_store();
        let session = store.create_session().unwrap();
        store
            .append_event(
                session.id,
                EventType::SessionEnd,
                json!({"synthetic": true, "reason": "crash"}),
            )
            .unwrap();

        let report = FailureAnalyzer::analyze(&mut store, session.id).unwrap();
        assert_eq!(report.failure_type, "crash");
    }

    #[test]
    fn clean_session_reports_ok_and_persists() {
        let (mut store, _dir) = test_store();
        let session = store.create_session().unwrap();
        store
            .append_event(
                session.id,
                EventType::ToolResult,
                json!({"tool": "read_file", "is_error": false}),
            )
            .unwrap();

        let report = FailureAnalyzer::analyze(&mut store, session.id).unwrap();
        assert_eq!(report.failure_type, "ok");
        assert_eq!(report.last_successful_action.as_deref(), Some("read_file"));

        let stored = store.get_failure_report(session.id).unwrap().unwrap();
        assert_eq!(stored.failure_type, "ok");
    }

    #[test]
    fn similar_failures_come_from_cold_knowledge() {
        let (mut store, _dir) = test_store();
        store
            .cold_add_knowledge(
                "port # in use",
                "Kill the stale vite process, then restart with --port 3001",
                1,
                0.9,
            )
            .unwrap();
        let session = store.create_session().unwrap();
        for _ in 0..3 {
            tool_error(&mut store, session.id, "Port 5173 in use");
        }

        let report = FailureAnalyzer::analyze(&mut store, session.id).unwrap();
        assert_eq!(report.failure_type, "cyclic_error");
        assert!(
            report
                .similar_past_failures
                .iter()
                .any(|f| f.contains("3001"))
        );
    }
}
