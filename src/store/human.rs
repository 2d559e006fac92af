//! Row operations for the human-in-the-loop channel: injection points,
//! interventions, learned intervention patterns, and escalation rules.

use anyhow::Result;
use rusqlite::{OptionalExtension, params};
use serde_json::Value;

use super::models::{
    EscalationRuleRow, InjectionPoint, InjectionStatus, InjectionType, Intervention,
    InterventionPattern,
};
use super::{StateStore, now_iso};
use crate::errors::StoreError;

impl StateStore {
    // ── Injection points ──────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_injection_point(
        &mut self,
        session_id: i64,
        injection_type: InjectionType,
        context: &str,
        options: &[String],
        recommendation: Option<&str>,
        timeout_s: i64,
        default_on_timeout: Option<&str>,
    ) -> Result<InjectionPoint> {
        self.conn.execute(
            "INSERT INTO injection_points
                (session_id, type, context, options, recommendation, timeout_s,
                 default_on_timeout, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session_id,
                injection_type.as_str(),
                context,
                serde_json::to_string(options)?,
                recommendation,
                timeout_s,
                default_on_timeout,
                now_iso(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_injection_point(id)?
            .ok_or_else(|| StoreError::InjectionNotPending { id }.into())
    }

    pub fn get_injection_point(&self, id: i64) -> Result<Option<InjectionPoint>> {
        self.conn
            .query_row(
                "SELECT id, session_id, type, context, options, recommendation, timeout_s,
                        default_on_timeout, status, response, responded_by, created_at,
                        responded_at
                 FROM injection_points WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, Option<String>>(10)?,
                        row.get::<_, String>(11)?,
                        row.get::<_, Option<String>>(12)?,
                    ))
                },
            )
            .optional()?
            .map(|row| {
                let (
                    id,
                    session_id,
                    ty,
                    context,
                    options,
                    recommendation,
                    timeout_s,
                    default_on_timeout,
                    status,
                    response,
                    responded_by,
                    created_at,
                    responded_at,
                ) = row;
                Ok(InjectionPoint {
                    id,
                    session_id,
                    injection_type: ty.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                    context,
                    options: serde_json::from_str(&options)?,
                    recommendation,
                    timeout_s,
                    default_on_timeout,
                    status: status.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                    response,
                    responded_by,
                    created_at,
                    responded_at,
                })
            })
            .transpose()
    }

    pub fn pending_injection_points(&self) -> Result<Vec<InjectionPoint>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM injection_points WHERE status = 'pending' ORDER BY id",
        )?;
        let ids: Vec<i64> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);
        let mut points = Vec::new();
        for id in ids {
            if let Some(point) = self.get_injection_point(id)? {
                points.push(point);
            }
        }
        Ok(points)
    }

    /// Record a human (or out-of-process channel) response. Fails if the
    /// point is no longer pending, so late responses cannot clobber a
    /// timeout resolution.
    pub fn respond_injection_point(
        &mut self,
        id: i64,
        response: &str,
        responded_by: &str,
    ) -> Result<InjectionPoint> {
        let changed = self.conn.execute(
            "UPDATE injection_points
             SET status = 'responded', response = ?1, responded_by = ?2, responded_at = ?3
             WHERE id = ?4 AND status = 'pending'",
            params![response, responded_by, now_iso(), id],
        )?;
        if changed == 0 {
            return Err(StoreError::InjectionNotPending { id }.into());
        }
        Ok(self
            .get_injection_point(id)?
            .expect("injection exists after update"))
    }

    /// Resolve a pending point by timeout, applying the configured
    /// default response if any.
    pub fn timeout_injection_point(&mut self, id: i64) -> Result<InjectionPoint> {
        let point = self
            .get_injection_point(id)?
            .ok_or(StoreError::InjectionNotPending { id })?;
        let changed = self.conn.execute(
            "UPDATE injection_points
             SET status = 'timeout', response = ?1, responded_at = ?2
             WHERE id = ?3 AND status = 'pending'",
            params![point.default_on_timeout, now_iso(), id],
        )?;
        if changed == 0 {
            return Err(StoreError::InjectionNotPending { id }.into());
        }
        Ok(self
            .get_injection_point(id)?
            .expect("injection exists after update"))
    }

    pub fn cancel_injection_point(&mut self, id: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE injection_points SET status = 'cancelled', responded_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![now_iso(), id],
        )?;
        Ok(changed > 0)
    }

    // ── Interventions & patterns ──────────────────────────────────────

    pub fn record_intervention(
        &mut self,
        session_id: i64,
        injection_id: i64,
        signature: &str,
        agent_recommendation: Option<&str>,
        human_response: &str,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO interventions
                (session_id, injection_id, signature, agent_recommendation, human_response,
                 created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id,
                injection_id,
                signature,
                agent_recommendation,
                human_response,
                now_iso(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn interventions_by_signature(&self, signature: &str) -> Result<Vec<Intervention>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, injection_id, signature, agent_recommendation,
                    human_response, created_at
             FROM interventions WHERE signature = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![signature], |row| {
            Ok(Intervention {
                id: row.get(0)?,
                session_id: row.get(1)?,
                injection_id: row.get(2)?,
                signature: row.get(3)?,
                agent_recommendation: row.get(4)?,
                human_response: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        let mut interventions = Vec::new();
        for row in rows {
            interventions.push(row?);
        }
        Ok(interventions)
    }

    pub fn upsert_intervention_pattern(
        &mut self,
        signature: &str,
        learned_response: &str,
    ) -> Result<InterventionPattern> {
        self.conn.execute(
            "INSERT INTO intervention_patterns (signature, learned_response, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(signature) DO UPDATE SET learned_response = ?2, updated_at = ?3",
            params![signature, learned_response, now_iso()],
        )?;
        Ok(self
            .get_intervention_pattern(signature)?
            .expect("pattern exists after upsert"))
    }

    pub fn get_intervention_pattern(
        &self,
        signature: &str,
    ) -> Result<Option<InterventionPattern>> {
        self.conn
            .query_row(
                "SELECT id, signature, learned_response, times_applied, times_succeeded,
                        confidence, auto_apply, min_confidence_for_auto, updated_at
                 FROM intervention_patterns WHERE signature = ?1",
                params![signature],
                |row| {
                    Ok(InterventionPattern {
                        id: row.get(0)?,
                        signature: row.get(1)?,
                        learned_response: row.get(2)?,
                        times_applied: row.get(3)?,
                        times_succeeded: row.get(4)?,
                        confidence: row.get(5)?,
                        auto_apply: row.get::<_, i64>(6)? != 0,
                        min_confidence_for_auto: row.get(7)?,
                        updated_at: row.get(8)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    /// Record an application outcome and recompute confidence/auto_apply.
    pub fn record_pattern_outcome(&mut self, signature: &str, success: bool) -> Result<()> {
        let Some(mut pattern) = self.get_intervention_pattern(signature)? else {
            return Ok(());
        };
        pattern.times_applied += 1;
        if success {
            pattern.times_succeeded += 1;
        }
        pattern.update_confidence();
        self.conn.execute(
            "UPDATE intervention_patterns
             SET times_applied = ?1, times_succeeded = ?2, confidence = ?3, auto_apply = ?4,
                 updated_at = ?5
             WHERE signature = ?6",
            params![
                pattern.times_applied,
                pattern.times_succeeded,
                pattern.confidence,
                pattern.auto_apply,
                now_iso(),
                signature,
            ],
        )?;
        Ok(())
    }

    // ── Escalation rules ──────────────────────────────────────────────

    pub fn save_escalation_rule(&mut self, rule: &EscalationRuleRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO escalation_rules
                (rule_id, name, condition_type, condition_params, severity, injection_type,
                 message_template, suggested_actions, auto_pause, timeout_seconds,
                 default_action, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(rule_id) DO UPDATE SET
                name = ?2, condition_type = ?3, condition_params = ?4, severity = ?5,
                injection_type = ?6, message_template = ?7, suggested_actions = ?8,
                auto_pause = ?9, timeout_seconds = ?10, default_action = ?11, enabled = ?12",
            params![
                rule.rule_id,
                rule.name,
                rule.condition_type,
                rule.condition_params.to_string(),
                rule.severity,
                rule.injection_type.as_str(),
                rule.message_template,
                serde_json::to_string(&rule.suggested_actions)?,
                rule.auto_pause,
                rule.timeout_seconds,
                rule.default_action,
                rule.enabled,
            ],
        )?;
        Ok(())
    }

    pub fn enabled_escalation_rules(&self) -> Result<Vec<EscalationRuleRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, rule_id, name, condition_type, condition_params, severity,
                    injection_type, message_template, suggested_actions, auto_pause,
                    timeout_seconds, default_action, enabled
             FROM escalation_rules WHERE enabled = 1 ORDER BY severity DESC, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, i64>(9)? != 0,
                row.get::<_, i64>(10)?,
                row.get::<_, Option<String>>(11)?,
                row.get::<_, i64>(12)? != 0,
            ))
        })?;
        let mut rules = Vec::new();
        for row in rows {
            let (
                id,
                rule_id,
                name,
                condition_type,
                condition_params,
                severity,
                injection_type,
                message_template,
                suggested_actions,
                auto_pause,
                timeout_seconds,
                default_action,
                enabled,
            ) = row?;
            rules.push(EscalationRuleRow {
                id,
                rule_id,
                name,
                condition_type,
                condition_params: serde_json::from_str::<Value>(&condition_params)?,
                severity,
                injection_type: injection_type
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!(e))?,
                message_template,
                suggested_actions: serde_json::from_str(&suggested_actions)?,
                auto_pause,
                timeout_seconds,
                default_action,
                enabled,
            });
        }
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_store;
    use super::*;

    #[test]
    fn injection_point_lifecycle_pending_to_responded() {
        let (mut store, _dir) = test_store();
        let point = store
            .create_injection_point(
                1,
                InjectionType::Approval,
                "risky git push",
                &["Approve".into(), "Deny".into()],
                Some("Deny"),
                300,
                Some("Deny"),
            )
            .unwrap();
        assert_eq!(point.status, InjectionStatus::Pending);
        assert!(point.responded_at.is_none());

        let responded = store
            .respond_injection_point(point.id, "Approve", "operator")
            .unwrap();
        assert_eq!(responded.status, InjectionStatus::Responded);
        assert_eq!(responded.response.as_deref(), Some("Approve"));
        assert!(responded.responded_at.is_some());

        // A second response is rejected.
        assert!(store
            .respond_injection_point(point.id, "Deny", "operator")
            .is_err());
    }

    #[test]
    fn timeout_applies_default_response() {
        let (mut store, _dir) = test_store();
        let point = store
            .create_injection_point(
                1,
                InjectionType::Decision,
                "low confidence",
                &["Approve agent choice".into()],
                Some("Approve agent choice"),
                1,
                Some("Approve agent choice"),
            )
            .unwrap();
        let timed_out = store.timeout_injection_point(point.id).unwrap();
        assert_eq!(timed_out.status, InjectionStatus::Timeout);
        assert_eq!(
            timed_out.response.as_deref(),
            Some("Approve agent choice")
        );
        assert!(timed_out.responded_at.is_some());
    }

    #[test]
    fn pattern_outcome_recording_flips_auto_apply() {
        let (mut store, _dir) = test_store();
        store
            .upsert_intervention_pattern("sig-1", "Skip feature")
            .unwrap();
        for _ in 0..3 {
            store.record_pattern_outcome("sig-1", true).unwrap();
        }
        let pattern = store.get_intervention_pattern("sig-1").unwrap().unwrap();
        assert!(pattern.auto_apply);
        assert_eq!(pattern.times_applied, 3);

        store.record_pattern_outcome("sig-1", false).unwrap();
        let pattern = store.get_intervention_pattern("sig-1").unwrap().unwrap();
        assert!(pattern.confidence < 0.8);
        assert!(!pattern.auto_apply);
    }

    #[test]
    fn escalation_rules_ordered_by_severity() {
        let (mut store, _dir) = test_store();
        let mut rule = EscalationRuleRow {
            id: 0,
            rule_id: "custom_low".into(),
            name: "Custom low".into(),
            condition_type: "threshold_below".into(),
            condition_params: serde_json::json!({"field": "confidence", "threshold": 0.4}),
            severity: 2,
            injection_type: InjectionType::Guidance,
            message_template: "low".into(),
            suggested_actions: vec!["look".into()],
            auto_pause: false,
            timeout_seconds: 300,
            default_action: None,
            enabled: true,
        };
        store.save_escalation_rule(&rule).unwrap();
        rule.rule_id = "custom_high".into();
        rule.severity = 5;
        store.save_escalation_rule(&rule).unwrap();

        let rules = store.enabled_escalation_rules().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].rule_id, "custom_high");
    }
}
