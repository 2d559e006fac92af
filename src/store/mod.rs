//! Embedded relational store: the single source of truth.
//!
//! All durable entities live in `.arcadia/project.db`. Event appends are
//! written through the JSONL sink (`EventLog`) before the relational row
//! commits, so the log remains authoritative after a crash.
//!
//! `Db` is the async-safe handle: it wraps `StateStore` behind
//! `Arc<Mutex>` and runs closures on tokio's blocking pool so synchronous
//! SQLite I/O never ties up async worker threads.

pub mod autonomy;
pub mod features;
pub mod human;
pub mod memory;
pub mod models;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::config::ProjectPaths;
use crate::errors::StoreError;
use crate::events::{Event, EventLog, EventType};
use models::*;

/// Async-safe, clonable handle to the state store.
#[derive(Clone)]
pub struct Db {
    inner: Arc<std::sync::Mutex<StateStore>>,
}

impl Db {
    pub fn new(store: StateStore) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure against the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut StateStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = store
                .lock()
                .map_err(|_| anyhow::Error::from(StoreError::LockPoisoned))?;
            f(&mut guard)
        })
        .await
        .context("Store task panicked")?
    }

    /// Acquire the store mutex synchronously. For startup, shutdown, and
    /// tests; must not be called from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, StateStore>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::Error::from(StoreError::LockPoisoned))
    }
}

pub struct StateStore {
    pub(crate) conn: Connection,
    event_log: EventLog,
}

/// RFC 3339 UTC timestamp used for every row.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

impl StateStore {
    /// Open (or create) the project store, run migrations, and attach the
    /// write-through event sink.
    pub fn open(paths: &ProjectPaths) -> Result<Self> {
        paths.ensure_dirs()?;
        let conn = Connection::open(&paths.db_path).map_err(|source| StoreError::OpenFailed {
            path: paths.db_path.clone(),
            source,
        })?;
        let event_log = EventLog::open(&paths.events_path)?;
        let store = Self { conn, event_log };
        store.init()?;
        Ok(store)
    }

    /// In-memory store with a scratch event log (for testing).
    pub fn open_in_memory(events_path: &Path) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory store")?;
        let event_log = EventLog::open(events_path)?;
        let store = Self { conn, event_log };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS schema_version (
                    version INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS features (
                    idx INTEGER PRIMARY KEY,
                    category TEXT NOT NULL DEFAULT 'functional',
                    description TEXT NOT NULL,
                    steps TEXT NOT NULL DEFAULT '[]',
                    passes INTEGER NOT NULL DEFAULT 0,
                    priority INTEGER NOT NULL DEFAULT 3,
                    failure_count INTEGER NOT NULL DEFAULT 0,
                    last_worked TEXT,
                    verified_at TEXT,
                    skip_verification INTEGER NOT NULL DEFAULT 0,
                    blocked_reason TEXT
                );

                CREATE TABLE IF NOT EXISTS feature_deps (
                    feature_idx INTEGER NOT NULL REFERENCES features(idx),
                    depends_on_idx INTEGER NOT NULL REFERENCES features(idx),
                    PRIMARY KEY (feature_idx, depends_on_idx)
                );

                CREATE TABLE IF NOT EXISTS feature_artifacts (
                    feature_idx INTEGER NOT NULL REFERENCES features(idx),
                    artifact_id INTEGER NOT NULL REFERENCES artifacts(id),
                    PRIMARY KEY (feature_idx, artifact_id)
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    start_time TEXT NOT NULL,
                    end_time TEXT,
                    status TEXT NOT NULL DEFAULT 'running',
                    summary TEXT
                );

                CREATE TABLE IF NOT EXISTS events (
                    event_id INTEGER PRIMARY KEY,
                    session_id INTEGER NOT NULL,
                    ts TEXT NOT NULL,
                    type TEXT NOT NULL,
                    payload TEXT NOT NULL DEFAULT '{}'
                );

                CREATE TABLE IF NOT EXISTS checkpoints (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id INTEGER NOT NULL,
                    seq INTEGER NOT NULL,
                    timestamp TEXT NOT NULL,
                    trigger TEXT NOT NULL,
                    vcs_commit_hash TEXT NOT NULL,
                    vcs_branch TEXT NOT NULL DEFAULT '',
                    feature_status TEXT NOT NULL DEFAULT '{}',
                    pending_work TEXT NOT NULL DEFAULT '[]',
                    notes TEXT,
                    UNIQUE(session_id, trigger, seq)
                );

                CREATE TABLE IF NOT EXISTS artifacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id INTEGER NOT NULL,
                    type TEXT NOT NULL,
                    path_relative TEXT NOT NULL,
                    sha256_checksum TEXT NOT NULL UNIQUE,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS decisions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id INTEGER NOT NULL,
                    decision_type TEXT NOT NULL,
                    context TEXT NOT NULL DEFAULT '',
                    choice TEXT NOT NULL,
                    alternatives TEXT NOT NULL DEFAULT '[]',
                    rationale TEXT NOT NULL DEFAULT '',
                    confidence REAL NOT NULL DEFAULT 1.0,
                    related_features TEXT NOT NULL DEFAULT '[]',
                    outcome TEXT,
                    outcome_success INTEGER,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS hypotheses (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    created_session INTEGER NOT NULL,
                    observation TEXT NOT NULL,
                    hypothesis TEXT NOT NULL,
                    confidence REAL NOT NULL DEFAULT 0.5,
                    evidence_for TEXT NOT NULL DEFAULT '[]',
                    evidence_against TEXT NOT NULL DEFAULT '[]',
                    status TEXT NOT NULL DEFAULT 'open',
                    related_features TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS hot_memory (
                    session_id INTEGER NOT NULL,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (session_id, key)
                );

                CREATE TABLE IF NOT EXISTS warm_summaries (
                    session_id INTEGER PRIMARY KEY,
                    summary TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS warm_issues (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    description TEXT NOT NULL,
                    issue_type TEXT NOT NULL DEFAULT 'error',
                    related_features TEXT NOT NULL DEFAULT '[]',
                    sessions_seen TEXT NOT NULL DEFAULT '[]',
                    priority INTEGER NOT NULL DEFAULT 3,
                    resolved INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    last_updated TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS warm_patterns (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    pattern_type TEXT NOT NULL DEFAULT 'fix',
                    problem TEXT NOT NULL,
                    solution TEXT NOT NULL,
                    keywords TEXT NOT NULL DEFAULT '[]',
                    success_count INTEGER NOT NULL DEFAULT 1,
                    confidence REAL NOT NULL DEFAULT 0.5,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS cold_sessions (
                    session_id INTEGER PRIMARY KEY,
                    stats TEXT NOT NULL,
                    archived_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS cold_knowledge (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    keywords TEXT NOT NULL DEFAULT '',
                    content TEXT NOT NULL,
                    source_session INTEGER NOT NULL DEFAULT 0,
                    confidence REAL NOT NULL DEFAULT 0.5,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS injection_points (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id INTEGER NOT NULL,
                    type TEXT NOT NULL,
                    context TEXT NOT NULL DEFAULT '',
                    options TEXT NOT NULL DEFAULT '[]',
                    recommendation TEXT,
                    timeout_s INTEGER NOT NULL DEFAULT 300,
                    default_on_timeout TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    response TEXT,
                    responded_by TEXT,
                    created_at TEXT NOT NULL,
                    responded_at TEXT
                );

                CREATE TABLE IF NOT EXISTS interventions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id INTEGER NOT NULL,
                    injection_id INTEGER NOT NULL,
                    signature TEXT NOT NULL,
                    agent_recommendation TEXT,
                    human_response TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS intervention_patterns (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    signature TEXT NOT NULL UNIQUE,
                    learned_response TEXT NOT NULL,
                    times_applied INTEGER NOT NULL DEFAULT 0,
                    times_succeeded INTEGER NOT NULL DEFAULT 0,
                    confidence REAL NOT NULL DEFAULT 0.0,
                    auto_apply INTEGER NOT NULL DEFAULT 0,
                    min_confidence_for_auto REAL NOT NULL DEFAULT 0.8,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS escalation_rules (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    rule_id TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    condition_type TEXT NOT NULL,
                    condition_params TEXT NOT NULL DEFAULT '{}',
                    severity INTEGER NOT NULL,
                    injection_type TEXT NOT NULL,
                    message_template TEXT NOT NULL,
                    suggested_actions TEXT NOT NULL DEFAULT '[]',
                    auto_pause INTEGER NOT NULL DEFAULT 0,
                    timeout_seconds INTEGER NOT NULL DEFAULT 300,
                    default_action TEXT,
                    enabled INTEGER NOT NULL DEFAULT 1
                );

                CREATE TABLE IF NOT EXISTS risk_patterns (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    pattern_id TEXT NOT NULL UNIQUE,
                    description TEXT NOT NULL,
                    tool TEXT,
                    input_field TEXT,
                    input_pattern TEXT,
                    risk_level INTEGER NOT NULL,
                    reversible INTEGER NOT NULL DEFAULT 1,
                    affects_source_of_truth INTEGER NOT NULL DEFAULT 0,
                    external_side_effects INTEGER NOT NULL DEFAULT 0,
                    requires_approval INTEGER NOT NULL DEFAULT 0,
                    requires_checkpoint INTEGER NOT NULL DEFAULT 0,
                    mitigation TEXT,
                    enabled INTEGER NOT NULL DEFAULT 1
                );

                CREATE TABLE IF NOT EXISTS risk_assessments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id INTEGER NOT NULL,
                    tool TEXT NOT NULL,
                    input_summary TEXT NOT NULL DEFAULT '',
                    risk_level INTEGER NOT NULL,
                    reversible INTEGER NOT NULL,
                    affects_source_of_truth INTEGER NOT NULL,
                    external_side_effects INTEGER NOT NULL,
                    requires_approval INTEGER NOT NULL,
                    requires_checkpoint INTEGER NOT NULL,
                    requires_review INTEGER NOT NULL,
                    mitigation TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS autonomy_config (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    level INTEGER NOT NULL DEFAULT 3,
                    min_level INTEGER NOT NULL DEFAULT 1,
                    max_level INTEGER NOT NULL DEFAULT 4,
                    action_levels TEXT NOT NULL DEFAULT '{}',
                    confidence_threshold REAL NOT NULL DEFAULT 0.5,
                    error_demotion_count INTEGER NOT NULL DEFAULT 3,
                    success_promotion_count INTEGER NOT NULL DEFAULT 10,
                    auto_adjust INTEGER NOT NULL DEFAULT 1
                );

                CREATE TABLE IF NOT EXISTS autonomy_metrics (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    consecutive_successes INTEGER NOT NULL DEFAULT 0,
                    consecutive_errors INTEGER NOT NULL DEFAULT 0,
                    total_actions INTEGER NOT NULL DEFAULT 0,
                    total_errors INTEGER NOT NULL DEFAULT 0,
                    recent_outcomes TEXT NOT NULL DEFAULT '[]',
                    level_changes TEXT NOT NULL DEFAULT '[]'
                );

                CREATE TABLE IF NOT EXISTS autonomy_decisions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id INTEGER NOT NULL,
                    tool TEXT NOT NULL,
                    allowed INTEGER NOT NULL,
                    required_level INTEGER NOT NULL,
                    current_level INTEGER NOT NULL,
                    effective_level INTEGER NOT NULL,
                    reason TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS failure_reports (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id INTEGER NOT NULL,
                    failure_type TEXT NOT NULL,
                    last_successful_action TEXT,
                    failing_action TEXT,
                    error_messages TEXT NOT NULL DEFAULT '[]',
                    likely_cause TEXT NOT NULL DEFAULT '',
                    confidence REAL NOT NULL DEFAULT 0.5,
                    similar_past_failures TEXT NOT NULL DEFAULT '[]',
                    suggested_fixes TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS supervisor_lock (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    pid INTEGER NOT NULL,
                    acquired_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id);
                CREATE INDEX IF NOT EXISTS idx_checkpoints_session ON checkpoints(session_id);
                CREATE INDEX IF NOT EXISTS idx_injections_status ON injection_points(status);
                CREATE INDEX IF NOT EXISTS idx_deps_depends_on ON feature_deps(depends_on_idx);
                ",
            )
            .context("Failed to create tables")?;

        let version: Option<i64> = self
            .conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .optional()
            .context("Failed to read schema version")?;
        if version.is_none() {
            self.conn
                .execute("INSERT INTO schema_version (version) VALUES (1)", [])
                .context("Failed to set schema version")?;
        }

        Ok(())
    }

    // ── Supervisor lock ───────────────────────────────────────────────

    /// Claim the single-supervisor lock. A stale lock (dead pid) is
    /// replaced; a live one is an error.
    pub fn acquire_supervisor_lock(&self, pid: u32) -> Result<()> {
        let existing: Option<(u32, String)> = self
            .conn
            .query_row(
                "SELECT pid, acquired_at FROM supervisor_lock WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((held_pid, _)) = existing {
            if held_pid != pid && process_alive(held_pid) {
                return Err(StoreError::SupervisorLockHeld { pid: held_pid }.into());
            }
        }

        self.conn.execute(
            "INSERT INTO supervisor_lock (id, pid, acquired_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET pid = ?1, acquired_at = ?2",
            params![pid, now_iso()],
        )?;
        Ok(())
    }

    pub fn release_supervisor_lock(&self) -> Result<()> {
        self.conn
            .execute("DELETE FROM supervisor_lock WHERE id = 1", [])?;
        Ok(())
    }

    // ── Events (write-through) ────────────────────────────────────────

    /// Append an event. The JSONL write (with fsync) happens first and is
    /// the durability point; the relational row is the queryable view.
    pub fn append_event(
        &mut self,
        session_id: i64,
        event_type: EventType,
        payload: Value,
    ) -> Result<i64> {
        let event = Event::new(session_id, event_type, payload.clone());
        let ts = event.ts.to_rfc3339();
        let event_id = self.event_log.append(event)?;
        self.conn.execute(
            "INSERT INTO events (event_id, session_id, ts, type, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![event_id, session_id, ts, event_type.as_str(), payload.to_string()],
        )?;
        Ok(event_id)
    }

    pub fn events_for_session(&self, session_id: i64) -> Result<Vec<Event>> {
        self.event_log.reconstruct_session(session_id)
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    // ── Sessions ──────────────────────────────────────────────────────

    pub fn create_session(&self) -> Result<Session> {
        self.conn.execute(
            "INSERT INTO sessions (start_time, status) VALUES (?1, 'running')",
            params![now_iso()],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_session(id)?
            .ok_or_else(|| StoreError::SessionNotFound { id }.into())
    }

    pub fn get_session(&self, id: i64) -> Result<Option<Session>> {
        self.conn
            .query_row(
                "SELECT id, start_time, end_time, status, summary FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?
            .map(|(id, start_time, end_time, status, summary)| {
                Ok(Session {
                    id,
                    start_time,
                    end_time,
                    status: status
                        .parse()
                        .map_err(|e: String| anyhow::anyhow!(e))?,
                    summary,
                })
            })
            .transpose()
    }

    /// The most recent session still marked running, if any. Used by
    /// crash recovery.
    pub fn latest_unterminated_session(&self) -> Result<Option<Session>> {
        let id: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM sessions WHERE status = 'running' ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => self.get_session(id),
            None => Ok(None),
        }
    }

    pub fn finish_session(
        &mut self,
        id: i64,
        status: SessionStatus,
        summary: Option<&str>,
    ) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE sessions SET end_time = ?1, status = ?2, summary = ?3 WHERE id = ?4",
            params![now_iso(), status.as_str(), summary, id],
        )?;
        if changed == 0 {
            return Err(StoreError::SessionNotFound { id }.into());
        }
        Ok(())
    }

    /// Put a paused session back into the running state so resumed work
    /// lands in the same event stream.
    pub fn reopen_session(&mut self, id: i64) -> Result<Session> {
        let changed = self.conn.execute(
            "UPDATE sessions SET status = 'running', end_time = NULL WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Err(StoreError::SessionNotFound { id }.into());
        }
        Ok(self.get_session(id)?.expect("session exists after update"))
    }

    pub fn list_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM sessions ORDER BY id DESC LIMIT ?1",
        )?;
        let ids: Vec<i64> = stmt
            .query_map(params![limit as i64], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = self.get_session(id)? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    // ── Checkpoint rows ───────────────────────────────────────────────

    /// Insert a checkpoint row, reading the feature snapshot inside the
    /// same transaction. Idempotent per (session, trigger, seq).
    pub fn insert_checkpoint(
        &mut self,
        session_id: i64,
        seq: i64,
        trigger: CheckpointTrigger,
        vcs_commit_hash: &str,
        vcs_branch: &str,
        pending_work: &[String],
        notes: Option<&str>,
    ) -> Result<Checkpoint> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin checkpoint transaction")?;

        let mut stmt = tx.prepare("SELECT idx, passes FROM features")?;
        let status: std::collections::HashMap<i64, bool> = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? != 0))
            })?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        tx.execute(
            "INSERT INTO checkpoints
                (session_id, seq, timestamp, trigger, vcs_commit_hash, vcs_branch,
                 feature_status, pending_work, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(session_id, trigger, seq) DO NOTHING",
            params![
                session_id,
                seq,
                now_iso(),
                trigger.as_str(),
                vcs_commit_hash,
                vcs_branch,
                serde_json::to_string(&status)?,
                serde_json::to_string(pending_work)?,
                notes,
            ],
        )?;
        tx.commit().context("Failed to commit checkpoint")?;

        let id: i64 = self.conn.query_row(
            "SELECT id FROM checkpoints WHERE session_id = ?1 AND trigger = ?2 AND seq = ?3",
            params![session_id, trigger.as_str(), seq],
            |row| row.get(0),
        )?;
        self.get_checkpoint(id)?
            .ok_or_else(|| StoreError::CheckpointNotFound { id }.into())
    }

    pub fn get_checkpoint(&self, id: i64) -> Result<Option<Checkpoint>> {
        self.conn
            .query_row(
                "SELECT id, session_id, seq, timestamp, trigger, vcs_commit_hash, vcs_branch,
                        feature_status, pending_work, notes
                 FROM checkpoints WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, Option<String>>(9)?,
                    ))
                },
            )
            .optional()?
            .map(|row| parse_checkpoint_row(row))
            .transpose()
    }

    pub fn list_checkpoints(&self, session_id: Option<i64>) -> Result<Vec<Checkpoint>> {
        let mut out = Vec::new();
        let ids: Vec<i64> = match session_id {
            Some(sid) => {
                let mut stmt = self.conn.prepare(
                    "SELECT id FROM checkpoints WHERE session_id = ?1 ORDER BY id",
                )?;
                let ids = stmt
                    .query_map(params![sid], |row| row.get(0))?
                    .collect::<std::result::Result<_, _>>()?;
                ids
            }
            None => {
                let mut stmt = self.conn.prepare("SELECT id FROM checkpoints ORDER BY id")?;
                let ids = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<_, _>>()?;
                ids
            }
        };
        for id in ids {
            if let Some(cp) = self.get_checkpoint(id)? {
                out.push(cp);
            }
        }
        Ok(out)
    }

    /// Highest checkpoint sequence used in a session so far.
    pub fn max_checkpoint_seq(&self, session_id: i64) -> Result<i64> {
        let seq: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM checkpoints WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(seq)
    }

    // ── Artifacts ─────────────────────────────────────────────────────

    /// Insert (or return the existing) content-addressed artifact.
    pub fn record_artifact(
        &mut self,
        session_id: i64,
        artifact_type: ArtifactType,
        path_relative: &str,
        sha256_checksum: &str,
        metadata: Value,
    ) -> Result<Artifact> {
        self.conn.execute(
            "INSERT INTO artifacts (session_id, type, path_relative, sha256_checksum, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(sha256_checksum) DO NOTHING",
            params![
                session_id,
                artifact_type.as_str(),
                path_relative,
                sha256_checksum,
                metadata.to_string(),
                now_iso(),
            ],
        )?;
        let id: i64 = self.conn.query_row(
            "SELECT id FROM artifacts WHERE sha256_checksum = ?1",
            params![sha256_checksum],
            |row| row.get(0),
        )?;
        Ok(self.get_artifact(id)?.expect("artifact exists after insert"))
    }

    pub fn get_artifact(&self, id: i64) -> Result<Option<Artifact>> {
        self.conn
            .query_row(
                "SELECT id, session_id, type, path_relative, sha256_checksum, metadata, created_at
                 FROM artifacts WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?
            .map(
                |(id, session_id, ty, path_relative, sha256_checksum, metadata, created_at)| {
                    Ok(Artifact {
                        id,
                        session_id,
                        artifact_type: ty.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                        path_relative,
                        sha256_checksum,
                        metadata: serde_json::from_str(&metadata)?,
                        created_at,
                    })
                },
            )
            .transpose()
    }

    // ── Decisions ─────────────────────────────────────────────────────

    pub fn record_decision(
        &mut self,
        session_id: i64,
        decision_type: &str,
        context: &str,
        choice: &str,
        alternatives: &[String],
        rationale: &str,
        confidence: f64,
        related_features: &[i64],
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO decisions
                (session_id, decision_type, context, choice, alternatives, rationale,
                 confidence, related_features, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session_id,
                decision_type,
                context,
                choice,
                serde_json::to_string(alternatives)?,
                rationale,
                confidence,
                serde_json::to_string(related_features)?,
                now_iso(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn record_decision_outcome(
        &mut self,
        decision_id: i64,
        outcome: &str,
        success: bool,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE decisions SET outcome = ?1, outcome_success = ?2 WHERE id = ?3",
            params![outcome, success, decision_id],
        )?;
        Ok(())
    }

    pub fn list_decisions(&self, session_id: Option<i64>, limit: usize) -> Result<Vec<Decision>> {
        let sql = match session_id {
            Some(_) => {
                "SELECT id, session_id, decision_type, context, choice, alternatives, rationale,
                        confidence, related_features, outcome, outcome_success, created_at
                 FROM decisions WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2"
            }
            None => {
                "SELECT id, session_id, decision_type, context, choice, alternatives, rationale,
                        confidence, related_features, outcome, outcome_success, created_at
                 FROM decisions WHERE ?1 >= 0 ORDER BY id DESC LIMIT ?2"
            }
        };
        let mut stmt = self.conn.prepare(sql)?;
        let key = session_id.unwrap_or(0);
        let rows = stmt.query_map(params![key, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, f64>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, Option<String>>(9)?,
                row.get::<_, Option<bool>>(10)?,
                row.get::<_, String>(11)?,
            ))
        })?;
        let mut decisions = Vec::new();
        for row in rows {
            let (
                id,
                session_id,
                decision_type,
                context,
                choice,
                alternatives,
                rationale,
                confidence,
                related_features,
                outcome,
                outcome_success,
                created_at,
            ) = row?;
            decisions.push(Decision {
                id,
                session_id,
                decision_type,
                context,
                choice,
                alternatives: serde_json::from_str(&alternatives)?,
                rationale,
                confidence,
                related_features: serde_json::from_str(&related_features)?,
                outcome,
                outcome_success,
                created_at,
            });
        }
        Ok(decisions)
    }

    // ── Hypotheses ────────────────────────────────────────────────────

    pub fn record_hypothesis(
        &mut self,
        created_session: i64,
        observation: &str,
        hypothesis: &str,
        confidence: f64,
        related_features: &[i64],
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO hypotheses
                (created_session, observation, hypothesis, confidence, related_features, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                created_session,
                observation,
                hypothesis,
                confidence,
                serde_json::to_string(related_features)?,
                now_iso(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_hypothesis_status(
        &mut self,
        id: i64,
        status: HypothesisStatus,
        evidence: Option<&str>,
        supporting: bool,
    ) -> Result<()> {
        if let Some(evidence) = evidence {
            let column = if supporting {
                "evidence_for"
            } else {
                "evidence_against"
            };
            let current: String = self.conn.query_row(
                &format!("SELECT {column} FROM hypotheses WHERE id = ?1"),
                params![id],
                |row| row.get(0),
            )?;
            let mut list: Vec<String> = serde_json::from_str(&current)?;
            list.push(evidence.to_string());
            self.conn.execute(
                &format!("UPDATE hypotheses SET {column} = ?1 WHERE id = ?2"),
                params![serde_json::to_string(&list)?, id],
            )?;
        }
        self.conn.execute(
            "UPDATE hypotheses SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    pub fn list_hypotheses(&self, status: Option<HypothesisStatus>) -> Result<Vec<Hypothesis>> {
        let sql = "SELECT id, created_session, observation, hypothesis, confidence,
                          evidence_for, evidence_against, status, related_features, created_at
                   FROM hypotheses ORDER BY id";
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
            ))
        })?;
        let mut hypotheses = Vec::new();
        for row in rows {
            let (
                id,
                created_session,
                observation,
                hypothesis,
                confidence,
                evidence_for,
                evidence_against,
                row_status,
                related_features,
                created_at,
            ) = row?;
            let parsed: HypothesisStatus = row_status
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            if let Some(filter) = status {
                if parsed != filter {
                    continue;
                }
            }
            hypotheses.push(Hypothesis {
                id,
                created_session,
                observation,
                hypothesis,
                confidence,
                evidence_for: serde_json::from_str(&evidence_for)?,
                evidence_against: serde_json::from_str(&evidence_against)?,
                status: parsed,
                related_features: serde_json::from_str(&related_features)?,
                created_at,
            });
        }
        Ok(hypotheses)
    }

    // ── Failure reports ───────────────────────────────────────────────

    pub fn insert_failure_report(&mut self, report: &FailureReport) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO failure_reports
                (session_id, failure_type, last_successful_action, failing_action,
                 error_messages, likely_cause, confidence, similar_past_failures,
                 suggested_fixes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                report.session_id,
                report.failure_type,
                report.last_successful_action,
                report.failing_action,
                serde_json::to_string(&report.error_messages)?,
                report.likely_cause,
                report.confidence,
                serde_json::to_string(&report.similar_past_failures)?,
                serde_json::to_string(&report.suggested_fixes)?,
                now_iso(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_failure_report(&self, session_id: i64) -> Result<Option<FailureReport>> {
        self.conn
            .query_row(
                "SELECT id, session_id, failure_type, last_successful_action, failing_action,
                        error_messages, likely_cause, confidence, similar_past_failures,
                        suggested_fixes, created_at
                 FROM failure_reports WHERE session_id = ?1 ORDER BY id DESC LIMIT 1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, f64>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, String>(10)?,
                    ))
                },
            )
            .optional()?
            .map(
                |(
                    id,
                    session_id,
                    failure_type,
                    last_successful_action,
                    failing_action,
                    error_messages,
                    likely_cause,
                    confidence,
                    similar_past_failures,
                    suggested_fixes,
                    created_at,
                )| {
                    Ok(FailureReport {
                        id,
                        session_id,
                        failure_type,
                        last_successful_action,
                        failing_action,
                        error_messages: serde_json::from_str(&error_messages)?,
                        likely_cause,
                        confidence,
                        similar_past_failures: serde_json::from_str(&similar_past_failures)?,
                        suggested_fixes: serde_json::from_str(&suggested_fixes)?,
                        created_at,
                    })
                },
            )
            .transpose()
    }
}

type CheckpointRow = (
    i64,
    i64,
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
);

fn parse_checkpoint_row(row: CheckpointRow) -> Result<Checkpoint> {
    let (id, session_id, seq, timestamp, trigger, hash, branch, status, pending, notes) = row;
    Ok(Checkpoint {
        id,
        session_id,
        seq,
        timestamp,
        trigger: trigger.parse().map_err(|e: String| anyhow::anyhow!(e))?,
        vcs_commit_hash: hash,
        vcs_branch: branch,
        feature_status: serde_json::from_str(&status)?,
        pending_work: serde_json::from_str(&pending)?,
        notes,
    })
}

/// Best-effort liveness probe. Where /proc is unavailable the lock is
/// treated as stale, which errs toward letting a restart proceed.
fn process_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(test)]
pub(crate) fn test_store() -> (StateStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open_in_memory(&dir.path().join("events.jsonl")).unwrap();
    (store, dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_lifecycle() {
        let (mut store, _dir) = test_store();
        let session = store.create_session().unwrap();
        assert_eq!(session.status, SessionStatus::Running);

        store
            .finish_session(session.id, SessionStatus::Success, Some("done"))
            .unwrap();
        let reloaded = store.get_session(session.id).unwrap().unwrap();
        assert_eq!(reloaded.status, SessionStatus::Success);
        assert!(reloaded.end_time.is_some());
        assert_eq!(reloaded.summary.as_deref(), Some("done"));
    }

    #[test]
    fn unterminated_session_is_found_for_recovery() {
        let (mut store, _dir) = test_store();
        assert!(store.latest_unterminated_session().unwrap().is_none());
        let session = store.create_session().unwrap();
        let found = store.latest_unterminated_session().unwrap().unwrap();
        assert_eq!(found.id, session.id);
        store
            .finish_session(session.id, SessionStatus::Failed, None)
            .unwrap();
        assert!(store.latest_unterminated_session().unwrap().is_none());
    }

    #[test]
    fn append_event_writes_row_and_log() {
        let (mut store, _dir) = test_store();
        let session = store.create_session().unwrap();
        let id = store
            .append_event(session.id, EventType::ToolCall, json!({"tool": "Read"}))
            .unwrap();
        assert!(id > 0);

        let events = store.events_for_session(session.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::ToolCall);

        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn checkpoint_insert_is_idempotent_per_seq() {
        let (mut store, _dir) = test_store();
        let session = store.create_session().unwrap();
        let a = store
            .insert_checkpoint(
                session.id,
                1,
                CheckpointTrigger::SessionStart,
                "abc123",
                "main",
                &[],
                None,
            )
            .unwrap();
        let b = store
            .insert_checkpoint(
                session.id,
                1,
                CheckpointTrigger::SessionStart,
                "def456",
                "main",
                &[],
                None,
            )
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.vcs_commit_hash, "abc123", "second insert is a no-op");
    }

    #[test]
    fn artifacts_are_content_addressed() {
        let (mut store, _dir) = test_store();
        let session = store.create_session().unwrap();
        let a = store
            .record_artifact(
                session.id,
                ArtifactType::Screenshot,
                "verification/feature_5_login.png",
                "deadbeef",
                json!({}),
            )
            .unwrap();
        let b = store
            .record_artifact(
                session.id,
                ArtifactType::Screenshot,
                "verification/feature_5_login_copy.png",
                "deadbeef",
                json!({}),
            )
            .unwrap();
        assert_eq!(a.id, b.id, "same checksum resolves to the same artifact");
    }

    #[test]
    fn supervisor_lock_blocks_live_holder() {
        let (store, _dir) = test_store();
        let my_pid = std::process::id();
        store.acquire_supervisor_lock(my_pid).unwrap();
        // Re-acquiring with the same pid is fine (restart after pause).
        store.acquire_supervisor_lock(my_pid).unwrap();
        store.release_supervisor_lock().unwrap();
    }

    #[test]
    fn decision_outcome_round_trip() {
        let (mut store, _dir) = test_store();
        let session = store.create_session().unwrap();
        let id = store
            .record_decision(
                session.id,
                "approach",
                "login page",
                "use form POST",
                &["use fetch".into()],
                "simpler",
                0.8,
                &[1],
            )
            .unwrap();
        store.record_decision_outcome(id, "worked", true).unwrap();
        let decisions = store.list_decisions(Some(session.id), 10).unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].outcome_success, Some(true));
    }

    #[test]
    fn hypothesis_status_and_evidence() {
        let (mut store, _dir) = test_store();
        let id = store
            .record_hypothesis(1, "login flaky", "race in session init", 0.6, &[2])
            .unwrap();
        store
            .update_hypothesis_status(id, HypothesisStatus::Confirmed, Some("repro'd twice"), true)
            .unwrap();
        let confirmed = store
            .list_hypotheses(Some(HypothesisStatus::Confirmed))
            .unwrap();
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].evidence_for, vec!["repro'd twice"]);
    }
}
