//! Session lifecycle supervisor.
//!
//! One session runs INIT → RESUMING? → PREP → RUN → SETTLE → END, with a
//! concurrent stall watchdog and an injection poller. The supervisor is
//! the only writer of the working tree (through tool handlers and
//! checkpoint rollbacks) and the only process allowed per project
//! directory, enforced by the store's supervisor lock.

pub mod paused;
pub mod prompt;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tokio::sync::watch;

use crate::analysis::FailureAnalyzer;
use crate::autonomy::AutonomyManager;
use crate::budget::BudgetTracker;
use crate::checkpoint::CheckpointManager;
use crate::checkpoint::git::GitWorkspace;
use crate::config::{ForgeConfig, ProjectPaths};
use crate::events::EventType;
use crate::hooks::pipeline::HookChain;
use crate::hooks::{Invocation, PreDecision};
use crate::human::escalation::{EscalationContext, EscalationEngine};
use crate::human::learning::{ContextSignature, InterventionLearner, error_class};
use crate::human::{HumanChannel, InjectionResolution};
use crate::memory::{MemoryManager, SessionSummary};
use crate::risk::RiskClassifier;
use crate::runtime::{AgentEvent, AgentRuntime, ToolOutput};
use crate::security::SecurityGate;
use crate::store::features::SalienceContext;
use crate::store::models::{CheckpointTrigger, FeatureCategory, SessionStatus};
use crate::store::{Db, StateStore};
use crate::tools::server::ProcessTracker;
use crate::tools::{ToolContext, ToolRegistry};

/// Terminal outcome of the supervisor loop, mapped to exit codes by the
/// binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All features passing, or an explicit stop (exit 0).
    Complete,
    /// Paused cleanly; restart to resume (exit 10).
    Paused,
    /// The run budget is spent (exit 20).
    BudgetExceeded,
}

/// What one session did, for the loop and for tests.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: i64,
    pub status: SessionStatus,
    pub tool_calls: u64,
    pub errors: u64,
    pub features_completed: Vec<i64>,
}

pub struct Supervisor {
    config: ForgeConfig,
    paths: ProjectPaths,
    db: Db,
    chain: HookChain,
    registry: Arc<ToolRegistry>,
    channel: HumanChannel,
    memory: MemoryManager,
    escalations: EscalationEngine,
    processes: ProcessTracker,
    budget: BudgetTracker,
    pause_flag: Arc<AtomicBool>,
}

impl Supervisor {
    /// Open the project, claim the supervisor lock, and assemble the
    /// hook chain.
    pub fn open(project_dir: impl Into<std::path::PathBuf>) -> Result<Self> {
        let paths = ProjectPaths::new(project_dir);
        let config = ForgeConfig::load(&paths)?;

        let store = StateStore::open(&paths)?;
        store.acquire_supervisor_lock(std::process::id())?;

        let mut risk = RiskClassifier::new();
        risk.load_custom_patterns(&store)?;
        let autonomy = AutonomyManager::load(&store)?;
        let escalations = EscalationEngine::load(&store)?;
        let workspace = GitWorkspace::open_or_init(&paths.project_dir)?;

        let db = Db::new(store);
        let chain = HookChain::new(
            SecurityGate::default(),
            risk,
            autonomy,
            CheckpointManager::new(workspace),
        );

        Ok(Self {
            budget: BudgetTracker::new(config.budget.clone()),
            chain,
            registry: Arc::new(ToolRegistry::with_builtin_tools()),
            channel: HumanChannel::new(db.clone()),
            memory: MemoryManager::new(config.memory.warm_max_sessions),
            escalations,
            processes: ProcessTracker::new(),
            pause_flag: Arc::new(AtomicBool::new(false)),
            config,
            paths,
            db,
        })
    }

    /// Flag checked at every suspension point; SIGINT/SIGTERM handlers
    /// set it.
    pub fn pause_handle(&self) -> Arc<AtomicBool> {
        self.pause_flag.clone()
    }

    pub fn db(&self) -> Db {
        self.db.clone()
    }

    pub fn budget(&self) -> &BudgetTracker {
        &self.budget
    }

    /// Release resources on the way out. The store lock is what keeps a
    /// second supervisor off this project.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.processes.stop_all().await;
        let store = self.db.lock_sync()?;
        store.release_supervisor_lock()?;
        Ok(())
    }

    /// Crash recovery: an unterminated session row whose event stream
    /// lacks SESSION_END gets a synthetic one, and the session is marked
    /// failed. Runs before PREP on every start.
    pub fn recover_crashed_session(&mut self) -> Result<Option<i64>> {
        // A paused session is not a crash; resume handles it.
        if paused::PausedSession::load(&self.paths)?.is_some() {
            return Ok(None);
        }
        let mut store = self.db.lock_sync()?;
        let Some(session) = store.latest_unterminated_session()? else {
            return Ok(None);
        };
        let has_end = store
            .events_for_session(session.id)?
            .iter()
            .any(|e| e.event_type == EventType::SessionEnd);
        if !has_end {
            store.append_event(
                session.id,
                EventType::SessionEnd,
                json!({"synthetic": true, "reason": "crash"}),
            )?;
        }
        store.finish_session(session.id, SessionStatus::Failed, Some("crashed"))?;
        drop(store);

        let mut store = self.db.lock_sync()?;
        FailureAnalyzer::analyze(&mut store, session.id)?;
        Ok(Some(session.id))
    }

    /// Seed the feature catalogue from `app_spec.txt` on first run. One
    /// bullet or line per feature; a `style:` prefix selects the style
    /// category.
    pub fn initialize_features(&self) -> Result<usize> {
        let mut store = self.db.lock_sync()?;
        if !store.list_features()?.is_empty() {
            return Ok(0);
        }
        if !self.paths.app_spec_path.exists() {
            return Ok(0);
        }
        let spec = std::fs::read_to_string(&self.paths.app_spec_path)
            .context("Failed to read app_spec.txt")?;

        let mut inserted = 0usize;
        for line in spec.lines() {
            let line = line.trim().trim_start_matches(['-', '*']).trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (category, description) = match line.strip_prefix("style:") {
                Some(rest) => (FeatureCategory::Style, rest.trim()),
                None => (FeatureCategory::Functional, line),
            };
            inserted += 1;
            store.add_feature(inserted as i64, category, description, &[], 2, &[])?;
        }
        Ok(inserted)
    }

    /// Drive sessions until a terminal condition. `max_sessions` bounds
    /// the loop (None means run until complete/paused/over budget).
    pub async fn run_loop(
        &mut self,
        mut make_runtime: impl FnMut() -> Box<dyn AgentRuntime>,
        max_sessions: Option<u32>,
    ) -> Result<RunOutcome> {
        self.initialize_features()?;

        let mut sessions_run = 0u32;
        loop {
            self.recover_crashed_session()?;

            let mut runtime = make_runtime();
            let report = self.run_session(runtime.as_mut()).await?;
            sessions_run += 1;

            match report.status {
                SessionStatus::Paused => return Ok(RunOutcome::Paused),
                SessionStatus::BudgetExceeded => return Ok(RunOutcome::BudgetExceeded),
                _ => {}
            }

            if self.all_features_passing()? {
                return Ok(RunOutcome::Complete);
            }
            if let Some(max) = max_sessions {
                if sessions_run >= max {
                    return Ok(RunOutcome::Complete);
                }
            }

            tokio::time::sleep(Duration::from_secs(self.config.session_cooldown_secs)).await;
        }
    }

    fn all_features_passing(&self) -> Result<bool> {
        let store = self.db.lock_sync()?;
        let features = store.list_features()?;
        Ok(!features.is_empty() && features.iter().all(|f| f.passes))
    }

    /// One full session: INIT → RESUMING? → PREP → RUN → SETTLE → END.
    pub async fn run_session(&mut self, runtime: &mut dyn AgentRuntime) -> Result<SessionReport> {
        let started = Instant::now();

        // ── INIT / RESUMING ───────────────────────────────────────────
        let resume = paused::PausedSession::load(&self.paths)?;
        let (session_id, resume_prompt) = {
            let mut store = self.db.lock_sync()?;
            match &resume {
                Some(paused) => {
                    let session = store.reopen_session(paused.session_id)?;
                    (session.id, Some(paused.resume_prompt.clone()))
                }
                None => (store.create_session()?.id, None),
            }
        };
        if resume.is_some() {
            paused::PausedSession::clear(&self.paths)?;
        }

        {
            let mut store = self.db.lock_sync()?;
            store.append_event(
                session_id,
                EventType::SessionStart,
                json!({"resumed": resume.is_some()}),
            )?;
            self.chain.checkpoints().create(
                &mut store,
                session_id,
                CheckpointTrigger::SessionStart,
                &[],
                None,
            )?;
        }

        // ── PREP ──────────────────────────────────────────────────────
        let (prompt, focus_feature) = self.prepare_prompt(resume_prompt.as_deref())?;
        {
            let mut store = self.db.lock_sync()?;
            if let Some(focus) = focus_feature {
                store.hot_put(session_id, "focus", &json!({"feature": focus}))?;
            }
        }
        runtime
            .start(&prompt, &self.registry.catalog())
            .await
            .map_err(|e| anyhow::anyhow!("runtime failed to start: {e}"))?;

        // ── RUN, with the stall watchdog alongside ────────────────────
        let vitals = Arc::new(std::sync::Mutex::new(Instant::now()));
        let (stall_tx, mut stall_rx) = watch::channel(false);
        let watchdog = tokio::spawn(stall_watchdog(
            vitals.clone(),
            Duration::from_secs(self.config.watchdog.stall_timeout_secs),
            Duration::from_secs(self.config.watchdog.poll_interval_secs.max(1)),
            stall_tx,
        ));

        let mut report = SessionReport {
            session_id,
            status: SessionStatus::Success,
            tool_calls: 0,
            errors: 0,
            features_completed: Vec::new(),
        };
        let mut summary_note = String::new();
        let mut error_classes: HashMap<String, u32> = HashMap::new();
        let mut consecutive_failures = 0i64;

        loop {
            if self.pause_flag.load(Ordering::Relaxed) {
                report.status = SessionStatus::Paused;
                break;
            }

            let event = tokio::select! {
                changed = stall_rx.changed() => {
                    if changed.is_ok() && *stall_rx.borrow() {
                        report.status = SessionStatus::NoProgress;
                        break;
                    }
                    continue;
                }
                event = runtime.next_event() => event?,
            };

            match event {
                None => break,
                Some(AgentEvent::Done { summary }) => {
                    if let Some(summary) = summary {
                        summary_note = summary;
                    }
                    break;
                }
                Some(AgentEvent::Message { usage, .. }) => {
                    self.budget.record(usage);
                    if self.budget.over_budget() {
                        report.status = SessionStatus::BudgetExceeded;
                        break;
                    }
                }
                Some(AgentEvent::ToolCall { id, name, input }) => {
                    *vitals.lock().expect("vitals lock") = Instant::now();
                    report.tool_calls += 1;

                    let invocation = Invocation::with_id(&id, &name, input);
                    let output = match self
                        .execute_invocation(session_id, &invocation, focus_feature)
                        .await
                    {
                        Ok(output) => output,
                        Err(e) => {
                            // Supervisor error: unwind to SETTLE with a
                            // recovery checkpoint and a pending approval
                            // for the human.
                            self.recover_from_supervisor_error(session_id, &e)?;
                            report.status = SessionStatus::Failed;
                            break;
                        }
                    };

                    if output.is_error {
                        report.errors += 1;
                        consecutive_failures += 1;
                        let class = error_class(&output.text_content());
                        let count = error_classes.entry(class.clone()).or_default();
                        *count += 1;

                        let cyclic = *count >= self.config.watchdog.cyclic_threshold;
                        // Escalate at failure-streak crossings and when
                        // the loop closes; never twice for one result.
                        if cyclic || consecutive_failures == 3 || consecutive_failures == 5 {
                            self.escalate(
                                session_id,
                                &EscalationContext {
                                    confidence: 1.0,
                                    feature_index: focus_feature,
                                    consecutive_failures,
                                    error_message: Some(output.text_content()),
                                    error_count: *count as i64,
                                    ..Default::default()
                                },
                            )?;
                        }
                        if cyclic {
                            runtime
                                .provide_tool_result(&invocation.id, output)
                                .await
                                .ok();
                            report.status = SessionStatus::Cyclic;
                            break;
                        }
                    } else {
                        consecutive_failures = 0;
                        if invocation.tool == "feature_mark"
                            && !output.text_content().contains("already passing")
                        {
                            if let Some(index) = invocation.input.get("index").and_then(Value::as_i64)
                            {
                                report.features_completed.push(index);
                            }
                        }
                    }

                    runtime
                        .provide_tool_result(&invocation.id, output)
                        .await
                        .map_err(|e| anyhow::anyhow!("runtime rejected tool result: {e}"))?;

                    // Budget is enforced at the next safe point, never
                    // mid-tool.
                    if self.budget.over_budget() {
                        report.status = SessionStatus::BudgetExceeded;
                        break;
                    }
                }
            }
        }
        watchdog.abort();

        // ── SETTLE ────────────────────────────────────────────────────
        self.settle(
            &report,
            focus_feature,
            summary_note,
            error_classes,
            started.elapsed(),
        )
        .await?;

        Ok(report)
    }

    fn prepare_prompt(
        &self,
        resume_prompt: Option<&str>,
    ) -> Result<(crate::runtime::SessionPrompt, Option<i64>)> {
        let store = self.db.lock_sync()?;
        let priming = self.memory.priming_context(&store)?;
        let candidates = store.features_by_salience(&SalienceContext::default())?;
        let app_spec = if self.paths.app_spec_path.exists() {
            std::fs::read_to_string(&self.paths.app_spec_path)?
        } else {
            String::new()
        };
        drop(store);

        let focus = candidates.first().map(|(f, _)| f.index);
        let prompt = prompt::compose(&prompt::PromptInputs {
            app_spec: &app_spec,
            priming: &priming,
            candidates: &candidates,
            catalog: &self.registry.catalog(),
            resume_prompt,
        });
        Ok((prompt, focus))
    }

    /// Run one invocation through the full pipeline: pre hooks, approval
    /// (learned or human), dispatch, post hooks.
    async fn execute_invocation(
        &mut self,
        session_id: i64,
        invocation: &Invocation,
        focus_feature: Option<i64>,
    ) -> Result<ToolOutput> {
        let decision = {
            let mut store = self.db.lock_sync()?;
            self.chain
                .pre(&mut store, session_id, invocation, None, focus_feature)?
        };

        let (admitted, applied_pattern): (bool, Option<ContextSignature>) = match decision {
            PreDecision::Blocked { output } => return Ok(output),
            PreDecision::Proceed { .. } => (true, None),
            PreDecision::NeedsApproval {
                assessment,
                gate,
                request,
                signature,
            } => {
                let learned = {
                    let store = self.db.lock_sync()?;
                    InterventionLearner::auto_response(&store, &signature)?
                };
                let (response, applied) = match learned {
                    Some(pattern) => (Some(pattern.learned_response), Some(signature.clone())),
                    None => {
                        let recommendation = request.recommendation.clone();
                        let (injection_id, resolution) =
                            self.channel.request(session_id, request).await?;
                        if let InjectionResolution::Responded { response, .. } = &resolution {
                            let mut store = self.db.lock_sync()?;
                            InterventionLearner::record_response(
                                &mut store,
                                session_id,
                                injection_id,
                                &signature,
                                recommendation.as_deref(),
                                response,
                            )?;
                        }
                        (resolution.response().map(str::to_string), None)
                    }
                };

                if response.as_deref() == Some("Approve") {
                    let mut store = self.db.lock_sync()?;
                    self.chain
                        .admit(&mut store, session_id, invocation, &assessment)?;
                    (true, applied)
                } else {
                    let reason = response.unwrap_or_else(|| "no response".to_string());
                    let mut store = self.db.lock_sync()?;
                    let output =
                        self.chain
                            .reject(&mut store, session_id, invocation, &gate, &reason)?;
                    if let Some(signature) = applied {
                        InterventionLearner::record_outcome(&mut store, &signature, false)?;
                    }
                    return Ok(output);
                }
            }
        };
        debug_assert!(admitted);

        // ── EXEC ──────────────────────────────────────────────────────
        // The hard timeout bounds how long a pause can be held up by a
        // draining tool.
        let started = Instant::now();
        let hard_timeout = Duration::from_secs(self.config.tool_drain_timeout_secs.max(1));
        let output =
            match tokio::time::timeout(hard_timeout, self.dispatch(session_id, invocation)).await
            {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => ToolOutput::error(format!("tool failed: {e:#}")),
                Err(_) => ToolOutput::error(format!(
                    "tool exceeded the {}s hard timeout",
                    hard_timeout.as_secs()
                )),
            };
        let duration_ms = started.elapsed().as_millis() as u64;

        // ── POST ──────────────────────────────────────────────────────
        {
            let mut store = self.db.lock_sync()?;
            self.chain
                .post(&mut store, session_id, invocation, &output, duration_ms)?;
            if let Some(signature) = applied_pattern {
                InterventionLearner::record_outcome(&mut store, &signature, !output.is_error)?;
            }
        }

        Ok(output)
    }

    async fn dispatch(&self, session_id: i64, invocation: &Invocation) -> Result<ToolOutput> {
        let Some(tool) = self.registry.get(&invocation.tool) else {
            return Ok(ToolOutput::error(format!(
                "unknown tool: {}",
                invocation.tool
            )));
        };
        let context = ToolContext {
            db: self.db.clone(),
            paths: self.paths.clone(),
            session_id,
            processes: self.processes.clone(),
        };
        tool.handle(&context, invocation.input.clone()).await
    }

    /// A supervisor-level failure (store unavailable, VCS failure):
    /// record it, take an ERROR_RECOVERY checkpoint carrying the hot
    /// working context, and leave an approval request for the human.
    fn recover_from_supervisor_error(&self, session_id: i64, error: &anyhow::Error) -> Result<()> {
        let mut store = self.db.lock_sync()?;
        store.append_event(
            session_id,
            EventType::Error,
            json!({"scope": "supervisor", "message": format!("{error:#}")}),
        )?;

        let hot_context: Vec<(String, Value)> = store.hot_all(session_id).unwrap_or_default();
        let notes = serde_json::to_string(&hot_context).unwrap_or_default();
        self.chain.checkpoints().create(
            &mut store,
            session_id,
            CheckpointTrigger::ErrorRecovery,
            &[],
            Some(&notes),
        )?;

        store.create_injection_point(
            session_id,
            crate::store::models::InjectionType::Approval,
            &format!("Supervisor error needs review: {error:#}"),
            &["Resume".to_string(), "Hold".to_string()],
            Some("Hold"),
            900,
            Some("Hold"),
        )?;
        Ok(())
    }

    /// Evaluate escalation rules; the first match is put on the
    /// timeline, and a pending injection row is opened when the rule
    /// pauses the agent.
    fn escalate(&self, session_id: i64, context: &EscalationContext) -> Result<()> {
        let Some(triggered) = self.escalations.first_match(context) else {
            return Ok(());
        };
        let mut store = self.db.lock_sync()?;
        store.append_event(
            session_id,
            EventType::Escalation,
            json!({
                "rule_id": triggered.rule_id,
                "severity": triggered.severity,
                "message": triggered.message,
                "auto_pause": triggered.auto_pause,
            }),
        )?;
        if triggered.auto_pause {
            // The row stays pending; the human answers out of process
            // and the next session picks the guidance up.
            store.create_injection_point(
                session_id,
                triggered.injection_type,
                &triggered.message,
                &triggered.suggested_actions,
                triggered.default_action.as_deref(),
                triggered.timeout_seconds,
                triggered.default_action.as_deref(),
            )?;
        }
        Ok(())
    }

    async fn settle(
        &mut self,
        report: &SessionReport,
        focus_feature: Option<i64>,
        summary_note: String,
        error_classes: HashMap<String, u32>,
        duration: Duration,
    ) -> Result<()> {
        let session_id = report.session_id;

        // Pause path: checkpoint + snapshot file, then a paused row.
        if report.status == SessionStatus::Paused {
            let mut store = self.db.lock_sync()?;
            let checkpoint = self.chain.checkpoints().create(
                &mut store,
                session_id,
                CheckpointTrigger::Pause,
                &[],
                Some("paused by signal"),
            )?;
            drop(store);
            paused::PausedSession {
                session_id,
                current_feature: focus_feature,
                last_checkpoint_id: Some(checkpoint.id),
                resume_prompt: format!(
                    "The previous session paused mid-work{}. Continue where it left off.",
                    focus_feature
                        .map(|f| format!(" on feature #{f}"))
                        .unwrap_or_default()
                ),
                pause_reason: "signal".to_string(),
                human_notes: None,
            }
            .save(&self.paths)?;
        }

        // Attempt bookkeeping for the focused feature.
        if let Some(focus) = focus_feature {
            let completed = report.features_completed.contains(&focus);
            let failed = matches!(
                report.status,
                SessionStatus::Cyclic | SessionStatus::NoProgress | SessionStatus::Failed
            );
            if completed || failed {
                let mut store = self.db.lock_sync()?;
                store.record_attempt(focus, completed)?;
            }
        }

        // Summarize into warm memory and clear hot.
        let summary = SessionSummary {
            session_id,
            accomplished: report
                .features_completed
                .iter()
                .map(|i| format!("completed feature #{i}"))
                .collect(),
            tests_completed: report.features_completed.clone(),
            status: report.status.as_str().to_string(),
            next_steps: match focus_feature {
                Some(focus) if !report.features_completed.contains(&focus) => {
                    vec![format!("continue feature #{focus}")]
                }
                _ => vec!["pick the next feature by salience".to_string()],
            },
            issues_found: error_classes.keys().cloned().collect(),
            issues_fixed: Vec::new(),
            notes: summary_note,
            tool_calls: report.tool_calls,
            duration_seconds: duration.as_secs_f64(),
        };
        {
            let mut store = self.db.lock_sync()?;
            self.memory.on_session_end(&mut store, &summary)?;
        }

        // Failure report for flagged sessions.
        if matches!(
            report.status,
            SessionStatus::Cyclic
                | SessionStatus::NoProgress
                | SessionStatus::Failed
                | SessionStatus::BudgetExceeded
        ) {
            let mut store = self.db.lock_sync()?;
            FailureAnalyzer::analyze(&mut store, session_id)?;
        }

        // END: checkpoint, SESSION_END event, final row.
        {
            let mut store = self.db.lock_sync()?;
            self.chain.checkpoints().create(
                &mut store,
                session_id,
                CheckpointTrigger::SessionEnd,
                &[],
                None,
            )?;
            store.append_event(
                session_id,
                EventType::SessionEnd,
                json!({
                    "status": report.status.as_str(),
                    "tool_calls": report.tool_calls,
                    "errors": report.errors,
                    "cost_usd": self.budget.cost_usd(),
                }),
            )?;
            store.finish_session(
                session_id,
                report.status,
                Some(&format!(
                    "{} tool calls, {} completed, status {}",
                    report.tool_calls,
                    report.features_completed.len(),
                    report.status.as_str()
                )),
            )?;
        }

        Ok(())
    }
}

/// Stall watchdog task: flips the watch channel when no tool call has
/// been seen for the configured timeout.
async fn stall_watchdog(
    vitals: Arc<std::sync::Mutex<Instant>>,
    timeout: Duration,
    poll: Duration,
    tx: watch::Sender<bool>,
) {
    loop {
        tokio::time::sleep(poll).await;
        let last = *vitals.lock().expect("vitals lock");
        if last.elapsed() >= timeout {
            let _ = tx.send(true);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ScriptedRuntime;
    use serde_json::json;
    use tempfile::tempdir;

    fn project() -> (Supervisor, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("app_spec.txt"),
            "- login page works\n- style: dark theme\n",
        )
        .unwrap();
        let supervisor = Supervisor::open(dir.path()).unwrap();
        (supervisor, dir)
    }

    fn event_types(supervisor: &Supervisor, session_id: i64) -> Vec<EventType> {
        let store = supervisor.db.lock_sync().unwrap();
        store
            .events_for_session(session_id)
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fresh_init_inserts_features_and_brackets_session() {
        let (mut supervisor, _dir) = project();
        assert_eq!(supervisor.initialize_features().unwrap(), 2);

        {
            let store = supervisor.db.lock_sync().unwrap();
            let features = store.list_features().unwrap();
            assert_eq!(features.len(), 2);
            assert_eq!(features[1].category, FeatureCategory::Style);
        }

        let mut runtime = ScriptedRuntime::new(vec![AgentEvent::Done { summary: None }]);
        let report = supervisor.run_session(&mut runtime).await.unwrap();
        assert_eq!(report.status, SessionStatus::Success);

        let types = event_types(&supervisor, report.session_id);
        assert_eq!(
            types
                .iter()
                .filter(|t| **t == EventType::SessionStart)
                .count(),
            1
        );
        assert_eq!(
            types
                .iter()
                .filter(|t| **t == EventType::SessionEnd)
                .count(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tool_calls_flow_through_the_pipeline() {
        let (mut supervisor, dir) = project();
        supervisor.initialize_features().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        let mut runtime = ScriptedRuntime::new(vec![
            ScriptedRuntime::tool_call("t1", "read_file", json!({"file_path": "notes.txt"})),
            ScriptedRuntime::tool_call("t2", "bash", json!({"command": "rm -rf /"})),
            AgentEvent::Done { summary: None },
        ]);
        let report = supervisor.run_session(&mut runtime).await.unwrap();

        assert_eq!(report.tool_calls, 2);
        assert_eq!(report.errors, 1, "the blocked command is an error result");
        assert!(!runtime.results[0].1.is_error);
        assert!(runtime.results[1].1.is_error);

        let types = event_types(&supervisor, report.session_id);
        assert!(types.contains(&EventType::ToolCall));
        assert!(types.contains(&EventType::ToolResult));
        assert!(types.contains(&EventType::ToolBlocked));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cyclic_errors_flag_session_and_open_guidance() {
        let (mut supervisor, _dir) = project();
        supervisor.initialize_features().unwrap();

        // The same failing read three times: identical error class.
        let script: Vec<AgentEvent> = (0..3)
            .map(|i| {
                ScriptedRuntime::tool_call(
                    &format!("t{i}"),
                    "read_file",
                    json!({"file_path": "missing_7.txt"}),
                )
            })
            .collect();
        let mut runtime = ScriptedRuntime::new(script);
        let report = supervisor.run_session(&mut runtime).await.unwrap();

        assert_eq!(report.status, SessionStatus::Cyclic);
        let types = event_types(&supervisor, report.session_id);
        assert!(types.contains(&EventType::Escalation));

        let store = supervisor.db.lock_sync().unwrap();
        let pending = store.pending_injection_points().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].injection_type,
            crate::store::models::InjectionType::Guidance
        );
        assert!(store.get_failure_report(report.session_id).unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn budget_exceeded_stops_after_current_tool() {
        let (mut supervisor, dir) = project();
        supervisor.initialize_features().unwrap();
        std::fs::write(dir.path().join("n.txt"), "x").unwrap();

        // Cap of 1 USD: 60k output tokens at 0.015/1k = 0.90, then the
        // next message pushes past 1.00.
        supervisor.config.budget.max_budget_usd = 1.0;
        supervisor.budget = BudgetTracker::new(supervisor.config.budget.clone());

        let mut runtime = ScriptedRuntime::new(vec![
            ScriptedRuntime::message("working", 0, 60_000),
            ScriptedRuntime::tool_call("t1", "read_file", json!({"file_path": "n.txt"})),
            ScriptedRuntime::message("more", 0, 10_000),
            ScriptedRuntime::tool_call("t2", "read_file", json!({"file_path": "n.txt"})),
        ]);
        let report = supervisor.run_session(&mut runtime).await.unwrap();

        assert_eq!(report.status, SessionStatus::BudgetExceeded);
        // The first tool finished; the second never ran.
        assert_eq!(report.tool_calls, 1);
        assert_eq!(runtime.results.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pause_flag_writes_snapshot_and_resume_reuses_session() {
        let (mut supervisor, _dir) = project();
        supervisor.initialize_features().unwrap();

        supervisor.pause_flag.store(true, Ordering::Relaxed);
        let mut runtime = ScriptedRuntime::new(vec![ScriptedRuntime::tool_call(
            "t1",
            "progress_status",
            json!({}),
        )]);
        let report = supervisor.run_session(&mut runtime).await.unwrap();
        assert_eq!(report.status, SessionStatus::Paused);

        let paused = paused::PausedSession::load(&supervisor.paths)
            .unwrap()
            .expect("pause snapshot written");
        assert_eq!(paused.session_id, report.session_id);
        assert!(paused.last_checkpoint_id.is_some());

        // Resume: same session id, new TOOL_CALL lands in its stream.
        supervisor.pause_flag.store(false, Ordering::Relaxed);
        let mut runtime = ScriptedRuntime::new(vec![
            ScriptedRuntime::tool_call("t2", "progress_status", json!({})),
            AgentEvent::Done { summary: None },
        ]);
        let resumed = supervisor.run_session(&mut runtime).await.unwrap();
        assert_eq!(resumed.session_id, report.session_id);
        assert!(
            paused::PausedSession::load(&supervisor.paths)
                .unwrap()
                .is_none()
        );
        assert!(
            runtime
                .started_with
                .as_ref()
                .unwrap()
                .user
                .contains("RESUMING")
        );
    }

    struct HangingRuntime;

    #[async_trait::async_trait]
    impl AgentRuntime for HangingRuntime {
        async fn start(
            &mut self,
            _prompt: &crate::runtime::SessionPrompt,
            _catalog: &[crate::runtime::ToolSpec],
        ) -> Result<()> {
            Ok(())
        }

        async fn next_event(&mut self) -> Result<Option<AgentEvent>> {
            // Simulates a runtime that never emits another tool call.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }

        async fn provide_tool_result(
            &mut self,
            _id: &str,
            _result: crate::runtime::ToolOutput,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stall_watchdog_flags_a_silent_runtime() {
        let (mut supervisor, _dir) = project();
        supervisor.initialize_features().unwrap();
        supervisor.config.watchdog.stall_timeout_secs = 1;
        supervisor.config.watchdog.poll_interval_secs = 1;

        let mut runtime = HangingRuntime;
        let report = supervisor.run_session(&mut runtime).await.unwrap();
        assert_eq!(report.status, SessionStatus::NoProgress);

        let store = supervisor.db.lock_sync().unwrap();
        let session = store.get_session(report.session_id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::NoProgress);
        assert!(store.get_failure_report(report.session_id).unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn crash_recovery_writes_synthetic_end() {
        let (mut supervisor, _dir) = project();
        let session_id = {
            let mut store = supervisor.db.lock_sync().unwrap();
            let session = store.create_session().unwrap();
            store
                .append_event(session.id, EventType::SessionStart, json!({}))
                .unwrap();
            session.id
        };

        let recovered = supervisor.recover_crashed_session().unwrap();
        assert_eq!(recovered, Some(session_id));

        let store = supervisor.db.lock_sync().unwrap();
        let session = store.get_session(session_id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        let events = store.events_for_session(session_id).unwrap();
        assert!(events.iter().any(|e| {
            e.event_type == EventType::SessionEnd
                && e.payload.get("synthetic").and_then(Value::as_bool) == Some(true)
        }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_loop_completes_when_all_features_pass() {
        let (mut supervisor, dir) = project();
        std::fs::write(
            dir.path().join("verification").join("feature_1_login.png"),
            b"png",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("verification").join("feature_2_theme.png"),
            b"png2",
        )
        .unwrap();

        let outcome = supervisor
            .run_loop(
                || {
                    Box::new(ScriptedRuntime::new(vec![
                        ScriptedRuntime::tool_call(
                            "m1",
                            "feature_mark",
                            json!({"index": 1, "artifacts": ["verification/feature_1_login.png"]}),
                        ),
                        ScriptedRuntime::tool_call(
                            "m2",
                            "feature_mark",
                            json!({"index": 2, "artifacts": ["verification/feature_2_theme.png"]}),
                        ),
                        AgentEvent::Done { summary: None },
                    ]))
                },
                Some(3),
            )
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Complete);

        let store = supervisor.db.lock_sync().unwrap();
        assert!(store.list_features().unwrap().iter().all(|f| f.passes));
        // FEATURE_COMPLETE checkpoints exist with the right snapshots.
        let checkpoints = store.list_checkpoints(None).unwrap();
        assert!(
            checkpoints
                .iter()
                .any(|c| c.trigger == CheckpointTrigger::FeatureComplete
                    && c.feature_status.get(&1) == Some(&true))
        );
    }
}
