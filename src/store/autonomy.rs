//! Row operations for autonomy state and the risk rule table.
//!
//! Config and metrics are single-row tables (id = 1); per-check decisions
//! and assessments append.

use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use super::models::RiskPatternRow;
use super::{StateStore, now_iso};

/// Persisted autonomy configuration (single row).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AutonomyConfigRow {
    pub level: i64,
    pub min_level: i64,
    pub max_level: i64,
    pub action_levels: std::collections::HashMap<String, i64>,
    pub confidence_threshold: f64,
    pub error_demotion_count: i64,
    pub success_promotion_count: i64,
    pub auto_adjust: bool,
}

impl Default for AutonomyConfigRow {
    fn default() -> Self {
        Self {
            level: 3,
            min_level: 1,
            max_level: 4,
            action_levels: Default::default(),
            confidence_threshold: 0.5,
            error_demotion_count: 3,
            success_promotion_count: 10,
            auto_adjust: true,
        }
    }
}

/// Persisted autonomy performance metrics (single row).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct AutonomyMetricsRow {
    pub consecutive_successes: i64,
    pub consecutive_errors: i64,
    pub total_actions: i64,
    pub total_errors: i64,
    pub recent_outcomes: Vec<bool>,
    pub level_changes: Vec<serde_json::Value>,
}

impl StateStore {
    pub fn load_autonomy_config(&self) -> Result<AutonomyConfigRow> {
        let row = self
            .conn
            .query_row(
                "SELECT level, min_level, max_level, action_levels, confidence_threshold,
                        error_demotion_count, success_promotion_count, auto_adjust
                 FROM autonomy_config WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)? != 0,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((
                level,
                min_level,
                max_level,
                action_levels,
                confidence_threshold,
                error_demotion_count,
                success_promotion_count,
                auto_adjust,
            )) => Ok(AutonomyConfigRow {
                level,
                min_level,
                max_level,
                action_levels: serde_json::from_str(&action_levels)?,
                confidence_threshold,
                error_demotion_count,
                success_promotion_count,
                auto_adjust,
            }),
            None => Ok(AutonomyConfigRow::default()),
        }
    }

    pub fn save_autonomy_config(&mut self, config: &AutonomyConfigRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO autonomy_config
                (id, level, min_level, max_level, action_levels, confidence_threshold,
                 error_demotion_count, success_promotion_count, auto_adjust)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                level = ?1, min_level = ?2, max_level = ?3, action_levels = ?4,
                confidence_threshold = ?5, error_demotion_count = ?6,
                success_promotion_count = ?7, auto_adjust = ?8",
            params![
                config.level,
                config.min_level,
                config.max_level,
                serde_json::to_string(&config.action_levels)?,
                config.confidence_threshold,
                config.error_demotion_count,
                config.success_promotion_count,
                config.auto_adjust,
            ],
        )?;
        Ok(())
    }

    pub fn load_autonomy_metrics(&self) -> Result<AutonomyMetricsRow> {
        let row = self
            .conn
            .query_row(
                "SELECT consecutive_successes, consecutive_errors, total_actions, total_errors,
                        recent_outcomes, level_changes
                 FROM autonomy_metrics WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((
                consecutive_successes,
                consecutive_errors,
                total_actions,
                total_errors,
                recent_outcomes,
                level_changes,
            )) => Ok(AutonomyMetricsRow {
                consecutive_successes,
                consecutive_errors,
                total_actions,
                total_errors,
                recent_outcomes: serde_json::from_str(&recent_outcomes)?,
                level_changes: serde_json::from_str(&level_changes)?,
            }),
            None => Ok(AutonomyMetricsRow::default()),
        }
    }

    pub fn save_autonomy_metrics(&mut self, metrics: &AutonomyMetricsRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO autonomy_metrics
                (id, consecutive_successes, consecutive_errors, total_actions, total_errors,
                 recent_outcomes, level_changes)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                consecutive_successes = ?1, consecutive_errors = ?2, total_actions = ?3,
                total_errors = ?4, recent_outcomes = ?5, level_changes = ?6",
            params![
                metrics.consecutive_successes,
                metrics.consecutive_errors,
                metrics.total_actions,
                metrics.total_errors,
                serde_json::to_string(&metrics.recent_outcomes)?,
                serde_json::to_string(&metrics.level_changes)?,
            ],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_autonomy_decision(
        &mut self,
        session_id: i64,
        tool: &str,
        allowed: bool,
        required_level: i64,
        current_level: i64,
        effective_level: i64,
        reason: &str,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO autonomy_decisions
                (session_id, tool, allowed, required_level, current_level, effective_level,
                 reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session_id,
                tool,
                allowed,
                required_level,
                current_level,
                effective_level,
                reason,
                now_iso(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    // ── Risk rows ─────────────────────────────────────────────────────

    pub fn save_risk_pattern(&mut self, pattern: &RiskPatternRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO risk_patterns
                (pattern_id, description, tool, input_field, input_pattern, risk_level,
                 reversible, affects_source_of_truth, external_side_effects,
                 requires_approval, requires_checkpoint, mitigation, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(pattern_id) DO UPDATE SET
                description = ?2, tool = ?3, input_field = ?4, input_pattern = ?5,
                risk_level = ?6, reversible = ?7, affects_source_of_truth = ?8,
                external_side_effects = ?9, requires_approval = ?10,
                requires_checkpoint = ?11, mitigation = ?12, enabled = ?13",
            params![
                pattern.pattern_id,
                pattern.description,
                pattern.tool,
                pattern.input_field,
                pattern.input_pattern,
                pattern.risk_level,
                pattern.reversible,
                pattern.affects_source_of_truth,
                pattern.external_side_effects,
                pattern.requires_approval,
                pattern.requires_checkpoint,
                pattern.mitigation,
                pattern.enabled,
            ],
        )?;
        Ok(())
    }

    pub fn enabled_risk_patterns(&self) -> Result<Vec<RiskPatternRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, pattern_id, description, tool, input_field, input_pattern, risk_level,
                    reversible, affects_source_of_truth, external_side_effects,
                    requires_approval, requires_checkpoint, mitigation, enabled
             FROM risk_patterns WHERE enabled = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RiskPatternRow {
                id: row.get(0)?,
                pattern_id: row.get(1)?,
                description: row.get(2)?,
                tool: row.get(3)?,
                input_field: row.get(4)?,
                input_pattern: row.get(5)?,
                risk_level: row.get(6)?,
                reversible: row.get::<_, i64>(7)? != 0,
                affects_source_of_truth: row.get::<_, i64>(8)? != 0,
                external_side_effects: row.get::<_, i64>(9)? != 0,
                requires_approval: row.get::<_, i64>(10)? != 0,
                requires_checkpoint: row.get::<_, i64>(11)? != 0,
                mitigation: row.get(12)?,
                enabled: row.get::<_, i64>(13)? != 0,
            })
        })?;
        let mut patterns = Vec::new();
        for row in rows {
            patterns.push(row?);
        }
        Ok(patterns)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_risk_assessment(
        &mut self,
        session_id: i64,
        tool: &str,
        input_summary: &str,
        risk_level: i64,
        reversible: bool,
        affects_source_of_truth: bool,
        external_side_effects: bool,
        requires_approval: bool,
        requires_checkpoint: bool,
        requires_review: bool,
        mitigation: Option<&str>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO risk_assessments
                (session_id, tool, input_summary, risk_level, reversible,
                 affects_source_of_truth, external_side_effects, requires_approval,
                 requires_checkpoint, requires_review, mitigation, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                session_id,
                tool,
                input_summary,
                risk_level,
                reversible,
                affects_source_of_truth,
                external_side_effects,
                requires_approval,
                requires_checkpoint,
                requires_review,
                mitigation,
                now_iso(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }
}
