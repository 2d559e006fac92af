//! Hot / Warm / Cold memory tiers.
//!
//! Three concrete components share the small `MemoryTier` interface and
//! are composed by `MemoryManager`; no tier holds state of its own, all
//! rows live in the store. Hot is per-session scratch, cleared at session
//! end. Warm keeps the last N session summaries plus unresolved issues
//! and proven patterns. Cold archives evicted summaries and distilled
//! knowledge, searchable by keyword.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::store::StateStore;
use crate::store::memory::{ProvenPattern, UnresolvedIssue};

/// Minimal tier interface. Each tier interprets keys its own way.
pub trait MemoryTier {
    fn put(&self, store: &mut StateStore, key: &str, value: &Value) -> Result<()>;
    fn get(&self, store: &StateStore, key: &str) -> Result<Option<Value>>;
    /// Remove whatever this tier is ready to let go of, returning the
    /// evicted entries so a colder tier can absorb them.
    fn evict(&self, store: &mut StateStore) -> Result<Vec<(String, Value)>>;
}

/// Session summary synthesized into warm memory at SESSION_END.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: i64,
    pub accomplished: Vec<String>,
    pub tests_completed: Vec<i64>,
    pub status: String,
    pub next_steps: Vec<String>,
    pub issues_found: Vec<String>,
    pub issues_fixed: Vec<String>,
    pub notes: String,
    pub tool_calls: u64,
    pub duration_seconds: f64,
}

/// Hot tier: per-session working context.
pub struct HotTier {
    pub session_id: i64,
}

impl MemoryTier for HotTier {
    fn put(&self, store: &mut StateStore, key: &str, value: &Value) -> Result<()> {
        store.hot_put(self.session_id, key, value)
    }

    fn get(&self, store: &StateStore, key: &str) -> Result<Option<Value>> {
        store.hot_get(self.session_id, key)
    }

    fn evict(&self, store: &mut StateStore) -> Result<Vec<(String, Value)>> {
        let all = store.hot_all(self.session_id)?;
        store.hot_clear(self.session_id)?;
        Ok(all)
    }
}

/// Warm tier: recent session summaries, keyed by session id.
pub struct WarmTier {
    pub max_sessions: usize,
}

impl MemoryTier for WarmTier {
    fn put(&self, store: &mut StateStore, key: &str, value: &Value) -> Result<()> {
        let session_id: i64 = key.parse().map_err(|_| {
            anyhow::anyhow!("warm memory keys are session ids, got {key:?}")
        })?;
        store.warm_insert_summary(session_id, value)
    }

    fn get(&self, store: &StateStore, key: &str) -> Result<Option<Value>> {
        let session_id: i64 = key.parse().map_err(|_| {
            anyhow::anyhow!("warm memory keys are session ids, got {key:?}")
        })?;
        Ok(store
            .warm_summaries()?
            .into_iter()
            .find(|(id, _)| *id == session_id)
            .map(|(_, summary)| summary))
    }

    fn evict(&self, store: &mut StateStore) -> Result<Vec<(String, Value)>> {
        Ok(store
            .warm_evict_beyond(self.max_sessions)?
            .into_iter()
            .map(|(id, summary)| (id.to_string(), summary))
            .collect())
    }
}

/// Cold tier: compact archive. Retention is unbounded; evict is a no-op.
pub struct ColdTier;

impl MemoryTier for ColdTier {
    fn put(&self, store: &mut StateStore, key: &str, value: &Value) -> Result<()> {
        if let Ok(session_id) = key.parse::<i64>() {
            store.cold_archive_session(session_id, value)
        } else {
            let content = value
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string());
            store.cold_add_knowledge(key, &content, 0, 0.5)?;
            Ok(())
        }
    }

    fn get(&self, store: &StateStore, key: &str) -> Result<Option<Value>> {
        let hits = store.cold_search_knowledge(key)?;
        if hits.is_empty() {
            return Ok(None);
        }
        Ok(Some(json!(
            hits.iter().map(|h| h.content.clone()).collect::<Vec<_>>()
        )))
    }

    fn evict(&self, _store: &mut StateStore) -> Result<Vec<(String, Value)>> {
        Ok(Vec::new())
    }
}

/// Context assembled for the next session's prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrimingContext {
    pub recent_summaries: Vec<SessionSummary>,
    pub unresolved_issues: Vec<UnresolvedIssue>,
    pub proven_patterns: Vec<ProvenPattern>,
}

pub struct MemoryManager {
    warm: WarmTier,
    cold: ColdTier,
}

impl MemoryManager {
    pub fn new(warm_max_sessions: usize) -> Self {
        Self {
            warm: WarmTier {
                max_sessions: warm_max_sessions,
            },
            cold: ColdTier,
        }
    }

    pub fn hot(&self, session_id: i64) -> HotTier {
        HotTier { session_id }
    }

    /// SESSION_END processing: write the summary into warm, clear hot,
    /// and demote anything beyond the warm window into cold. Issues the
    /// evicted summaries still flagged are compressed against proven
    /// patterns before archiving.
    pub fn on_session_end(
        &self,
        store: &mut StateStore,
        summary: &SessionSummary,
    ) -> Result<()> {
        let key = summary.session_id.to_string();
        self.warm.put(store, &key, &serde_json::to_value(summary)?)?;
        self.hot(summary.session_id).evict(store)?;

        let solutions: Vec<ProvenPattern> = store.warm_patterns()?;
        for (session_key, evicted) in self.warm.evict(store)? {
            let archived = compress_for_archive(&evicted, &solutions);
            self.cold.put(store, &session_key, &archived)?;

            // Distill durable notes into searchable knowledge.
            if let Some(notes) = evicted.get("notes").and_then(Value::as_str) {
                if !notes.is_empty() {
                    let session_id: i64 = session_key.parse().unwrap_or(0);
                    store.cold_add_knowledge("session notes", notes, session_id, 0.5)?;
                }
            }
        }
        Ok(())
    }

    /// Assemble warm context for the next session's prompt.
    pub fn priming_context(&self, store: &StateStore) -> Result<PrimingContext> {
        let recent_summaries = store
            .warm_summaries()?
            .into_iter()
            .filter_map(|(_, v)| serde_json::from_value(v).ok())
            .collect();
        Ok(PrimingContext {
            recent_summaries,
            unresolved_issues: store.warm_unresolved_issues()?,
            proven_patterns: store.warm_patterns()?,
        })
    }

    pub fn search_knowledge(&self, store: &StateStore, query: &str) -> Result<Option<Value>> {
        self.cold.get(store, query)
    }
}

/// Drop issues that already have a matching proven solution, then strip
/// the summary down to the fields worth archiving.
fn compress_for_archive(summary: &Value, solutions: &[ProvenPattern]) -> Value {
    let issues: Vec<String> = summary
        .get("issues_found")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .filter(|issue| {
                    let issue_lower = issue.to_lowercase();
                    !solutions
                        .iter()
                        .any(|s| issue_lower.contains(&s.problem.to_lowercase()))
                })
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    json!({
        "status": summary.get("status").cloned().unwrap_or(Value::Null),
        "accomplished": summary.get("accomplished").cloned().unwrap_or(json!([])),
        "tests_completed": summary.get("tests_completed").cloned().unwrap_or(json!([])),
        "open_issues": issues,
        "tool_calls": summary.get("tool_calls").cloned().unwrap_or(json!(0)),
        "duration_seconds": summary.get("duration_seconds").cloned().unwrap_or(json!(0.0)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    fn summary(session_id: i64) -> SessionSummary {
        SessionSummary {
            session_id,
            accomplished: vec![format!("work in session {session_id}")],
            tests_completed: vec![session_id],
            status: "success".into(),
            next_steps: vec!["continue".into()],
            issues_found: vec!["port conflict on 5173".into()],
            issues_fixed: vec![],
            notes: "vite needs --port".into(),
            tool_calls: 12,
            duration_seconds: 90.0,
        }
    }

    #[test]
    fn hot_clears_on_session_end() {
        let (mut store, _dir) = test_store();
        let manager = MemoryManager::new(5);
        let hot = manager.hot(1);
        hot.put(&mut store, "focus", &json!({"feature": 3}))
            .unwrap();
        assert!(hot.get(&store, "focus").unwrap().is_some());

        manager.on_session_end(&mut store, &summary(1)).unwrap();
        assert!(hot.get(&store, "focus").unwrap().is_none());
    }

    #[test]
    fn warm_window_bounded_and_overflow_reaches_cold() {
        let (mut store, _dir) = test_store();
        let manager = MemoryManager::new(5);
        for session in 1..=7 {
            manager
                .on_session_end(&mut store, &summary(session))
                .unwrap();
        }

        assert_eq!(store.warm_summaries().unwrap().len(), 5);
        assert_eq!(store.cold_session_count().unwrap(), 2);

        // Notes from evicted sessions become searchable knowledge.
        let hits = manager.search_knowledge(&store, "vite").unwrap();
        assert!(hits.is_some());
    }

    #[test]
    fn priming_context_carries_issues_and_patterns() {
        let (mut store, _dir) = test_store();
        let manager = MemoryManager::new(5);
        store
            .warm_add_issue("login test flaky", "error", &[5], 1, 2)
            .unwrap();
        store
            .warm_add_pattern("fix", "port conflict", "use --port 3001", &["vite".into()])
            .unwrap();
        manager.on_session_end(&mut store, &summary(1)).unwrap();

        let context = manager.priming_context(&store).unwrap();
        assert_eq!(context.recent_summaries.len(), 1);
        assert_eq!(context.unresolved_issues.len(), 1);
        assert_eq!(context.proven_patterns.len(), 1);
    }

    #[test]
    fn archive_compresses_solved_issues() {
        let solutions = vec![ProvenPattern {
            id: 1,
            pattern_type: "fix".into(),
            problem: "port conflict".into(),
            solution: "use another port".into(),
            keywords: vec![],
            success_count: 2,
            confidence: 0.7,
        }];
        let raw = json!({
            "status": "success",
            "issues_found": ["port conflict on 5173", "missing favicon"],
        });
        let archived = compress_for_archive(&raw, &solutions);
        let open = archived["open_issues"].as_array().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0], "missing favicon");
    }
}
