//! End-to-end scenarios: a scripted agent runtime driving the full
//! supervisor against a real project directory (git repo, SQLite store,
//! JSONL event log).

use std::sync::atomic::Ordering;

use serde_json::{Value, json};
use tempfile::TempDir;

use arcadia_forge::config::{ForgeConfig, ProjectPaths};
use arcadia_forge::events::EventType;
use arcadia_forge::runtime::{AgentEvent, ScriptedRuntime};
use arcadia_forge::session::{RunOutcome, Supervisor};
use arcadia_forge::store::models::{CheckpointTrigger, InjectionType, SessionStatus};

fn project_with_spec(spec: &str) -> (Supervisor, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("app_spec.txt"), spec).unwrap();
    let supervisor = Supervisor::open(dir.path()).unwrap();
    (supervisor, dir)
}

fn write_evidence(dir: &TempDir, name: &str, bytes: &[u8]) {
    let verification = dir.path().join("verification");
    std::fs::create_dir_all(&verification).unwrap();
    std::fs::write(verification.join(name), bytes).unwrap();
}

async fn session_events(supervisor: &Supervisor, session_id: i64) -> Vec<(EventType, Value)> {
    supervisor
        .db()
        .call(move |store| store.events_for_session(session_id))
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.event_type, e.payload))
        .collect()
}

// ── Scenario 1: fresh init → first feature ─────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn fresh_init_creates_features_and_completes() {
    let (mut supervisor, _dir) = project_with_spec("- show a welcome page\n");
    assert_eq!(supervisor.initialize_features().unwrap(), 1);

    let mut runtime = ScriptedRuntime::new(vec![AgentEvent::Done { summary: None }]);
    let report = supervisor.run_session(&mut runtime).await.unwrap();

    let events = session_events(&supervisor, report.session_id).await;
    let starts = events
        .iter()
        .filter(|(t, _)| *t == EventType::SessionStart)
        .count();
    let ends = events
        .iter()
        .filter(|(t, _)| *t == EventType::SessionEnd)
        .count();
    assert_eq!((starts, ends), (1, 1));

    let count = supervisor
        .db()
        .call(|store| Ok(store.list_features()?.len()))
        .await
        .unwrap();
    assert_eq!(count, 1);
    supervisor.shutdown().await.unwrap();
}

// ── Scenario 2: mark without evidence ──────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn mark_without_evidence_is_rejected_and_logged() {
    let (mut supervisor, _dir) = project_with_spec(
        "- one\n- two\n- three\n- four\n- login works end to end\n",
    );
    supervisor.initialize_features().unwrap();

    let mut runtime = ScriptedRuntime::new(vec![
        ScriptedRuntime::tool_call("m1", "feature_mark", json!({"index": 5, "artifacts": []})),
        AgentEvent::Done { summary: None },
    ]);
    let report = supervisor.run_session(&mut runtime).await.unwrap();

    // The agent saw a structured error naming the reason.
    let (_, result) = &runtime.results[0];
    assert!(result.is_error);
    assert!(result.text_content().contains("MissingEvidence"));

    // Feature 5 is untouched and a TOOL_ERROR event is on the timeline.
    let feature = supervisor
        .db()
        .call(|store| Ok(store.get_feature(5)?.unwrap()))
        .await
        .unwrap();
    assert!(!feature.passes);
    assert_eq!(feature.failure_count, 0, "rejection is not an attempt");

    let events = session_events(&supervisor, report.session_id).await;
    assert!(events.iter().any(|(t, _)| *t == EventType::ToolError));
    supervisor.shutdown().await.unwrap();
}

// ── Scenario 3: mark with evidence → checkpoint + warm memory ──────────

#[tokio::test(flavor = "multi_thread")]
async fn mark_with_evidence_checkpoints_and_updates_warm_memory() {
    let (mut supervisor, dir) =
        project_with_spec("- one\n- two\n- three\n- four\n- login works\n");
    supervisor.initialize_features().unwrap();
    write_evidence(&dir, "feature_5_login.png", b"screenshot bytes");

    let mut runtime = ScriptedRuntime::new(vec![
        ScriptedRuntime::tool_call(
            "m1",
            "feature_mark",
            json!({"index": 5, "artifacts": ["verification/feature_5_login.png"]}),
        ),
        AgentEvent::Done { summary: None },
    ]);
    let report = supervisor.run_session(&mut runtime).await.unwrap();
    assert_eq!(report.features_completed, vec![5]);

    let (feature, checkpoints, summaries) = supervisor
        .db()
        .call(move |store| {
            Ok((
                store.get_feature(5)?.unwrap(),
                store.list_checkpoints(Some(report.session_id))?,
                store.warm_summaries()?,
            ))
        })
        .await
        .unwrap();

    assert!(feature.passes);
    assert_eq!(feature.verification_artifacts.len(), 1);

    let complete = checkpoints
        .iter()
        .find(|c| c.trigger == CheckpointTrigger::FeatureComplete)
        .expect("FEATURE_COMPLETE checkpoint");
    assert_eq!(complete.feature_status.get(&5), Some(&true));

    // SESSION_END demoted the hot context into a warm summary.
    assert_eq!(summaries.len(), 1);
    assert!(
        summaries[0].1["accomplished"]
            .as_array()
            .unwrap()
            .iter()
            .any(|a| a.as_str().unwrap().contains("#5"))
    );
    supervisor.shutdown().await.unwrap();
}

// ── Scenario 3b: marking twice is idempotent ───────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn double_mark_is_a_noop_with_a_note() {
    let (mut supervisor, dir) = project_with_spec("- login works\n");
    supervisor.initialize_features().unwrap();
    write_evidence(&dir, "feature_1_login.png", b"bytes");

    let call = || {
        ScriptedRuntime::tool_call(
            "m",
            "feature_mark",
            json!({"index": 1, "artifacts": ["verification/feature_1_login.png"]}),
        )
    };
    let mut runtime = ScriptedRuntime::new(vec![call(), call(), AgentEvent::Done {
        summary: None,
    }]);
    let report = supervisor.run_session(&mut runtime).await.unwrap();

    assert!(!runtime.results[0].1.is_error);
    assert!(!runtime.results[1].1.is_error);
    assert!(
        runtime.results[1]
            .1
            .text_content()
            .contains("already passing")
    );
    // Only the first mark completed a feature.
    assert_eq!(report.features_completed, vec![1]);
    supervisor.shutdown().await.unwrap();
}

// ── Scenario 4: cyclic detection ───────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn cyclic_errors_set_status_and_open_guidance_injection() {
    let (mut supervisor, _dir) = project_with_spec("- a\n- b\n- c\n- d\n- e\n- f\n- seven\n");
    supervisor.initialize_features().unwrap();

    let script: Vec<AgentEvent> = (0..3)
        .map(|i| {
            ScriptedRuntime::tool_call(
                &format!("t{i}"),
                "read_file",
                json!({"file_path": "feature7_data.json"}),
            )
        })
        .collect();
    let mut runtime = ScriptedRuntime::new(script);
    let report = supervisor.run_session(&mut runtime).await.unwrap();

    assert_eq!(report.status, SessionStatus::Cyclic);

    let (session, pending) = supervisor
        .db()
        .call(move |store| {
            Ok((
                store.get_session(report.session_id)?.unwrap(),
                store.pending_injection_points()?,
            ))
        })
        .await
        .unwrap();
    assert_eq!(session.status, SessionStatus::Cyclic);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].injection_type, InjectionType::Guidance);
    supervisor.shutdown().await.unwrap();
}

// ── Scenario 5: pause and resume ───────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn pause_writes_snapshot_and_resume_continues_the_stream() {
    let (mut supervisor, dir) = project_with_spec("- a\n- b\n");
    supervisor.initialize_features().unwrap();

    supervisor.pause_handle().store(true, Ordering::Relaxed);
    let mut runtime = ScriptedRuntime::new(vec![ScriptedRuntime::tool_call(
        "t1",
        "progress_status",
        json!({}),
    )]);
    let report = supervisor.run_session(&mut runtime).await.unwrap();
    assert_eq!(report.status, SessionStatus::Paused);

    let paths = ProjectPaths::new(dir.path());
    assert!(paths.paused_session_path.exists());
    let paused: Value =
        serde_json::from_str(&std::fs::read_to_string(&paths.paused_session_path).unwrap())
            .unwrap();
    assert_eq!(paused["session_id"].as_i64().unwrap(), report.session_id);
    assert!(paused["resume_prompt"].as_str().unwrap().len() > 0);

    // Resume: same session id; the first TOOL_CALL after resume lands in
    // the same event stream.
    supervisor.pause_handle().store(false, Ordering::Relaxed);
    let mut runtime = ScriptedRuntime::new(vec![
        ScriptedRuntime::tool_call("t2", "progress_status", json!({})),
        AgentEvent::Done { summary: None },
    ]);
    let resumed = supervisor.run_session(&mut runtime).await.unwrap();
    assert_eq!(resumed.session_id, report.session_id);
    assert!(!paths.paused_session_path.exists());

    let events = session_events(&supervisor, report.session_id).await;
    let tool_calls: Vec<&Value> = events
        .iter()
        .filter(|(t, _)| *t == EventType::ToolCall)
        .map(|(_, p)| p)
        .collect();
    assert_eq!(tool_calls.len(), 2);
    assert_eq!(tool_calls[1]["invocation_id"], "t2");
    supervisor.shutdown().await.unwrap();
}

// ── Scenario 6: budget cutoff ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn budget_cutoff_finishes_current_tool_then_stops() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("app_spec.txt"), "- a\n").unwrap();

    // Cap the run at 1 USD via the project config file.
    let paths = ProjectPaths::new(dir.path());
    paths.ensure_dirs().unwrap();
    let mut config = ForgeConfig::default();
    config.budget.max_budget_usd = 1.0;
    config.save(&paths).unwrap();

    let mut supervisor = Supervisor::open(dir.path()).unwrap();
    std::fs::write(dir.path().join("n.txt"), "x").unwrap();

    let outcome = supervisor
        .run_loop(
            || {
                Box::new(ScriptedRuntime::new(vec![
                    // 300k input * 0.003/1k + 10k output * 0.015/1k = 1.05
                    ScriptedRuntime::message("thinking hard", 300_000, 10_000),
                    ScriptedRuntime::tool_call("t1", "read_file", json!({"file_path": "n.txt"})),
                ]))
            },
            Some(2),
        )
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::BudgetExceeded);
    assert!(supervisor.budget().cost_usd() >= 1.0);

    let sessions = supervisor
        .db()
        .call(|store| store.list_sessions(1))
        .await
        .unwrap();
    assert_eq!(sessions[0].status, SessionStatus::BudgetExceeded);
    supervisor.shutdown().await.unwrap();
}

// ── Timeline invariants ────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn every_tool_call_has_a_matching_terminal_event() {
    let (mut supervisor, dir) = project_with_spec("- a\n");
    supervisor.initialize_features().unwrap();
    std::fs::write(dir.path().join("ok.txt"), "fine").unwrap();

    let mut runtime = ScriptedRuntime::new(vec![
        ScriptedRuntime::tool_call("a", "read_file", json!({"file_path": "ok.txt"})),
        ScriptedRuntime::tool_call("b", "read_file", json!({"file_path": "missing.txt"})),
        ScriptedRuntime::tool_call("c", "bash", json!({"command": "sudo reboot"})),
        AgentEvent::Done { summary: None },
    ]);
    let report = supervisor.run_session(&mut runtime).await.unwrap();

    let events = session_events(&supervisor, report.session_id).await;
    // TOOL_CALL events only exist for admitted calls; blocked calls get
    // TOOL_BLOCKED instead. Every admitted id must terminate.
    let call_ids: Vec<String> = events
        .iter()
        .filter(|(t, _)| *t == EventType::ToolCall)
        .filter_map(|(_, p)| p["invocation_id"].as_str().map(str::to_string))
        .collect();
    for id in &call_ids {
        let terminated = events.iter().any(|(t, p)| {
            matches!(t, EventType::ToolResult | EventType::ToolError)
                && p["invocation_id"].as_str() == Some(id)
        });
        assert!(terminated, "tool call {id} has no terminal event");
    }
    // The denied command produced a TOOL_BLOCKED with its own id.
    assert!(events.iter().any(|(t, p)| {
        *t == EventType::ToolBlocked && p["invocation_id"].as_str() == Some("c")
    }));
    supervisor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn warm_memory_window_respected_across_many_sessions() {
    let (mut supervisor, _dir) = project_with_spec("- a\n- b\n");
    supervisor.initialize_features().unwrap();

    for _ in 0..7 {
        let mut runtime = ScriptedRuntime::new(vec![AgentEvent::Done { summary: None }]);
        supervisor.run_session(&mut runtime).await.unwrap();
    }

    let (summaries, cold) = supervisor
        .db()
        .call(|store| Ok((store.warm_summaries()?, store.cold_session_count()?)))
        .await
        .unwrap();
    assert_eq!(summaries.len(), 5);
    assert_eq!(cold, 2, "evicted summaries are archived, not dropped");
    supervisor.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn run_loop_reaches_complete_and_would_exit_zero() {
    let (mut supervisor, dir) = project_with_spec("- welcome page\n");
    write_evidence(&dir, "feature_1_welcome.png", b"png");

    let outcome = supervisor
        .run_loop(
            || {
                Box::new(ScriptedRuntime::new(vec![
                    ScriptedRuntime::tool_call(
                        "m1",
                        "feature_mark",
                        json!({"index": 1, "artifacts": ["verification/feature_1_welcome.png"]}),
                    ),
                    AgentEvent::Done { summary: None },
                ]))
            },
            Some(2),
        )
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Complete);
    supervisor.shutdown().await.unwrap();
}
