//! Row operations for the three memory tiers.
//!
//! Hot rows are keyed per session and deleted wholesale at session end.
//! Warm holds the last N session summaries plus unresolved issues and
//! proven patterns. Cold is the compact archive with a keyword index.
//! Tier orchestration (promotion, decay) lives in `crate::memory`.

use anyhow::Result;
use rusqlite::{OptionalExtension, params};
use serde_json::Value;

use super::{StateStore, now_iso};

/// An unresolved issue carried across sessions until someone fixes it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UnresolvedIssue {
    pub id: i64,
    pub description: String,
    pub issue_type: String,
    pub related_features: Vec<i64>,
    pub sessions_seen: Vec<i64>,
    pub priority: i64,
    pub resolved: bool,
}

/// A fix or approach that worked, with a running success count.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProvenPattern {
    pub id: i64,
    pub pattern_type: String,
    pub problem: String,
    pub solution: String,
    pub keywords: Vec<String>,
    pub success_count: i64,
    pub confidence: f64,
}

/// A knowledge entry distilled into cold storage.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct KnowledgeEntry {
    pub id: i64,
    pub keywords: String,
    pub content: String,
    pub source_session: i64,
    pub confidence: f64,
}

impl StateStore {
    // ── Hot ───────────────────────────────────────────────────────────

    pub fn hot_put(&mut self, session_id: i64, key: &str, value: &Value) -> Result<()> {
        self.conn.execute(
            "INSERT INTO hot_memory (session_id, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(session_id, key) DO UPDATE SET value = ?3, updated_at = ?4",
            params![session_id, key, value.to_string(), now_iso()],
        )?;
        Ok(())
    }

    pub fn hot_get(&self, session_id: i64, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM hot_memory WHERE session_id = ?1 AND key = ?2",
                params![session_id, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    pub fn hot_all(&self, session_id: i64) -> Result<Vec<(String, Value)>> {
        let mut stmt = self.conn.prepare(
            "SELECT key, value FROM hot_memory WHERE session_id = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (key, raw) = row?;
            out.push((key, serde_json::from_str(&raw)?));
        }
        Ok(out)
    }

    pub fn hot_clear(&mut self, session_id: i64) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM hot_memory WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(deleted)
    }

    // ── Warm ──────────────────────────────────────────────────────────

    pub fn warm_insert_summary(&mut self, session_id: i64, summary: &Value) -> Result<()> {
        self.conn.execute(
            "INSERT INTO warm_summaries (session_id, summary, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id) DO UPDATE SET summary = ?2",
            params![session_id, summary.to_string(), now_iso()],
        )?;
        Ok(())
    }

    /// Summaries newest-first.
    pub fn warm_summaries(&self) -> Result<Vec<(i64, Value)>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, summary FROM warm_summaries ORDER BY session_id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, raw) = row?;
            out.push((id, serde_json::from_str(&raw)?));
        }
        Ok(out)
    }

    /// Remove the oldest summaries beyond `max`, returning the evicted
    /// rows so the caller can archive them into cold.
    pub fn warm_evict_beyond(&mut self, max: usize) -> Result<Vec<(i64, Value)>> {
        let all = self.warm_summaries()?;
        if all.len() <= max {
            return Ok(Vec::new());
        }
        // `all` is newest-first; everything past `max` is evicted,
        // oldest last — reverse so the caller archives oldest first.
        let mut evicted: Vec<(i64, Value)> = all.into_iter().skip(max).collect();
        evicted.reverse();
        for (session_id, _) in &evicted {
            self.conn.execute(
                "DELETE FROM warm_summaries WHERE session_id = ?1",
                params![session_id],
            )?;
        }
        Ok(evicted)
    }

    pub fn warm_add_issue(
        &mut self,
        description: &str,
        issue_type: &str,
        related_features: &[i64],
        session_id: i64,
        priority: i64,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO warm_issues
                (description, issue_type, related_features, sessions_seen, priority,
                 created_at, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                description,
                issue_type,
                serde_json::to_string(related_features)?,
                serde_json::to_string(&[session_id])?,
                priority,
                now_iso(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn warm_resolve_issue(&mut self, id: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE warm_issues SET resolved = 1, last_updated = ?1 WHERE id = ?2",
            params![now_iso(), id],
        )?;
        Ok(changed > 0)
    }

    pub fn warm_unresolved_issues(&self) -> Result<Vec<UnresolvedIssue>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, description, issue_type, related_features, sessions_seen, priority, resolved
             FROM warm_issues WHERE resolved = 0 ORDER BY priority, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)? != 0,
            ))
        })?;
        let mut issues = Vec::new();
        for row in rows {
            let (id, description, issue_type, related, seen, priority, resolved) = row?;
            issues.push(UnresolvedIssue {
                id,
                description,
                issue_type,
                related_features: serde_json::from_str(&related)?,
                sessions_seen: serde_json::from_str(&seen)?,
                priority,
                resolved,
            });
        }
        Ok(issues)
    }

    pub fn warm_add_pattern(
        &mut self,
        pattern_type: &str,
        problem: &str,
        solution: &str,
        keywords: &[String],
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO warm_patterns (pattern_type, problem, solution, keywords, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                pattern_type,
                problem,
                solution,
                serde_json::to_string(keywords)?,
                now_iso(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn warm_record_pattern_success(&mut self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE warm_patterns
             SET success_count = success_count + 1,
                 confidence = MIN(1.0, confidence + 0.1)
             WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn warm_patterns(&self) -> Result<Vec<ProvenPattern>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, pattern_type, problem, solution, keywords, success_count, confidence
             FROM warm_patterns ORDER BY success_count DESC, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, f64>(6)?,
            ))
        })?;
        let mut patterns = Vec::new();
        for row in rows {
            let (id, pattern_type, problem, solution, keywords, success_count, confidence) = row?;
            patterns.push(ProvenPattern {
                id,
                pattern_type,
                problem,
                solution,
                keywords: serde_json::from_str(&keywords)?,
                success_count,
                confidence,
            });
        }
        Ok(patterns)
    }

    // ── Cold ──────────────────────────────────────────────────────────

    pub fn cold_archive_session(&mut self, session_id: i64, stats: &Value) -> Result<()> {
        self.conn.execute(
            "INSERT INTO cold_sessions (session_id, stats, archived_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id) DO UPDATE SET stats = ?2",
            params![session_id, stats.to_string(), now_iso()],
        )?;
        Ok(())
    }

    pub fn cold_session_count(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM cold_sessions", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn cold_add_knowledge(
        &mut self,
        keywords: &str,
        content: &str,
        source_session: i64,
        confidence: f64,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO cold_knowledge (keywords, content, source_session, confidence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![keywords, content, source_session, confidence, now_iso()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Keyword search: every whitespace-separated term must match either
    /// the keyword index or the content.
    pub fn cold_search_knowledge(&self, query: &str) -> Result<Vec<KnowledgeEntry>> {
        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let mut stmt = self.conn.prepare(
            "SELECT id, keywords, content, source_session, confidence
             FROM cold_knowledge ORDER BY confidence DESC, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, f64>(4)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (id, keywords, content, source_session, confidence) = row?;
            let haystack = format!("{} {}", keywords.to_lowercase(), content.to_lowercase());
            if terms.iter().all(|t| haystack.contains(t.as_str())) {
                entries.push(KnowledgeEntry {
                    id,
                    keywords,
                    content,
                    source_session,
                    confidence,
                });
            }
        }
        Ok(entries)
    }
}
