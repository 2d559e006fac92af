//! Feature registry: the ordered catalogue of test cases.
//!
//! Features are created during initialization (or explicit add-requirement
//! flows) and never deleted. Only status fields mutate. Completion claims
//! must be backed by evidence artifacts unless `skip_verification` was set
//! explicitly, and dependency edges always form a DAG.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::models::{Feature, FeatureCategory};
use super::{StateStore, now_iso};
use crate::errors::StoreError;

/// Priority weights for salience: critical, high, medium, low.
const PRIORITY_WEIGHTS: [(i64, f64); 4] = [(1, 0.40), (2, 0.30), (3, 0.20), (4, 0.10)];

/// Context for salience scoring.
#[derive(Debug, Clone, Default)]
pub struct SalienceContext {
    /// Features related to recent work; membership earns a boost.
    pub related_features: Vec<i64>,
}

/// Outcome of `mark_passing`; the second call with the same evidence is a
/// no-op that reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkOutcome {
    Marked,
    AlreadyPassing,
}

/// Dynamic salience score for one feature.
///
/// Base priority weight, minus a failure penalty (capped at 3), plus a
/// bonus per dependent feature, minus a staleness penalty (capped at 5
/// days), plus a context boost, clamped to [0, 1].
pub fn calculate_salience(feature: &Feature, context: &SalienceContext) -> f64 {
    let mut score = PRIORITY_WEIGHTS
        .iter()
        .find(|(p, _)| *p == feature.priority)
        .map(|(_, w)| *w)
        .unwrap_or(0.20);

    score -= 0.10 * feature.failure_count.min(3) as f64;
    score += 0.05 * feature.blocks.len() as f64;

    if let Some(last_worked) = &feature.last_worked {
        if let Ok(ts) = DateTime::parse_from_rfc3339(last_worked) {
            let days = (Utc::now() - ts.with_timezone(&Utc)).num_days().max(0);
            score -= 0.02 * days.min(5) as f64;
        }
    }

    if context.related_features.contains(&feature.index) {
        score += 0.20;
    }

    score.clamp(0.0, 1.0)
}

impl StateStore {
    /// Insert a new feature. Dependencies are validated for acyclicity.
    pub fn add_feature(
        &mut self,
        index: i64,
        category: FeatureCategory,
        description: &str,
        steps: &[String],
        priority: i64,
        blocked_by: &[i64],
    ) -> Result<Feature> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO features (idx, category, description, steps, priority)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                index,
                category.as_str(),
                description,
                serde_json::to_string(steps)?,
                priority,
            ],
        )?;
        tx.commit()?;
        for dep in blocked_by {
            self.add_feature_dependency(index, *dep)?;
        }
        self.get_feature(index)?
            .ok_or_else(|| StoreError::FeatureNotFound { index }.into())
    }

    pub fn get_feature(&self, index: i64) -> Result<Option<Feature>> {
        let base = self
            .conn
            .query_row(
                "SELECT idx, category, description, steps, passes, priority, failure_count,
                        last_worked, verified_at, skip_verification, blocked_reason
                 FROM features WHERE idx = ?1",
                params![index],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)? != 0,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, i64>(9)? != 0,
                        row.get::<_, Option<String>>(10)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            idx,
            category,
            description,
            steps,
            passes,
            priority,
            failure_count,
            last_worked,
            verified_at,
            skip_verification,
            blocked_reason,
        )) = base
        else {
            return Ok(None);
        };

        let blocked_by = self.feature_deps_of(idx)?;
        let blocks = self.feature_dependents_of(idx)?;
        let verification_artifacts = self.feature_artifact_ids(idx)?;

        Ok(Some(Feature {
            index: idx,
            category: category.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            description,
            steps: serde_json::from_str(&steps)?,
            passes,
            priority,
            failure_count,
            last_worked,
            blocked_by,
            blocks,
            verified_at,
            verification_artifacts,
            skip_verification,
            blocked_reason,
        }))
    }

    pub fn list_features(&self) -> Result<Vec<Feature>> {
        let mut stmt = self.conn.prepare("SELECT idx FROM features ORDER BY idx")?;
        let indices: Vec<i64> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);
        let mut features = Vec::with_capacity(indices.len());
        for idx in indices {
            if let Some(feature) = self.get_feature(idx)? {
                features.push(feature);
            }
        }
        Ok(features)
    }

    pub fn search_features(&self, query: &str) -> Result<Vec<Feature>> {
        let needle = query.to_lowercase();
        Ok(self
            .list_features()?
            .into_iter()
            .filter(|f| f.description.to_lowercase().contains(&needle))
            .collect())
    }

    /// Map of feature index -> passes, used by checkpoints and blocking
    /// checks.
    pub fn feature_status_map(&self) -> Result<HashMap<i64, bool>> {
        let mut stmt = self.conn.prepare("SELECT idx, passes FROM features")?;
        let map = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? != 0))
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(map)
    }

    /// Mark a feature passing. Enforces the evidence invariant: at least
    /// one verification artifact, or an explicit skip. Idempotent.
    pub fn mark_feature_passing(
        &mut self,
        index: i64,
        artifact_ids: &[i64],
        skip_verification: bool,
    ) -> Result<MarkOutcome> {
        let feature = self
            .get_feature(index)?
            .ok_or(StoreError::FeatureNotFound { index })?;

        if feature.passes {
            return Ok(MarkOutcome::AlreadyPassing);
        }

        if artifact_ids.is_empty() && !skip_verification {
            return Err(StoreError::MissingEvidence { index }.into());
        }

        // A feature cannot pass while any dependency is unfinished.
        let status = self.feature_status_map()?;
        if feature.is_blocked(&status) {
            return Err(StoreError::FeatureBlocked { index }.into());
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE features SET passes = 1, verified_at = ?1, skip_verification = ?2
             WHERE idx = ?3",
            params![now_iso(), skip_verification, index],
        )?;
        for artifact_id in artifact_ids {
            tx.execute(
                "INSERT INTO feature_artifacts (feature_idx, artifact_id) VALUES (?1, ?2)
                 ON CONFLICT DO NOTHING",
                params![index, artifact_id],
            )?;
        }
        tx.commit()?;
        Ok(MarkOutcome::Marked)
    }

    /// Write back a feature's pass flag from a checkpoint snapshot.
    /// Bypasses the evidence check: the snapshot was taken in a valid
    /// state and artifact links are append-only. Rollback-only.
    pub fn restore_feature_status(&mut self, index: i64, passes: bool) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE features SET passes = ?1 WHERE idx = ?2",
            params![passes, index],
        )?;
        if changed == 0 {
            return Err(StoreError::FeatureNotFound { index }.into());
        }
        Ok(())
    }

    /// Mark a previously passing feature as failing (regression path).
    pub fn mark_feature_failing(&mut self, index: i64, reason: Option<&str>) -> Result<bool> {
        let feature = self
            .get_feature(index)?
            .ok_or(StoreError::FeatureNotFound { index })?;
        if !feature.passes {
            return Ok(false);
        }
        self.conn.execute(
            "UPDATE features SET passes = 0, verified_at = NULL, blocked_reason = ?1
             WHERE idx = ?2",
            params![reason, index],
        )?;
        Ok(true)
    }

    /// Record a work attempt: stamps `last_worked`, bumps `failure_count`
    /// on failure, resets it on success.
    pub fn record_attempt(&mut self, index: i64, success: bool) -> Result<()> {
        let changed = if success {
            self.conn.execute(
                "UPDATE features SET last_worked = ?1, failure_count = 0 WHERE idx = ?2",
                params![now_iso(), index],
            )?
        } else {
            self.conn.execute(
                "UPDATE features SET last_worked = ?1, failure_count = failure_count + 1
                 WHERE idx = ?2",
                params![now_iso(), index],
            )?
        };
        if changed == 0 {
            return Err(StoreError::FeatureNotFound { index }.into());
        }
        Ok(())
    }

    /// Add a dependency edge (`feature` is blocked by `depends_on`).
    /// Rejects edges that would close a cycle, and edges onto a feature
    /// that already passes (a passing feature is never blocked).
    pub fn add_feature_dependency(&mut self, feature: i64, depends_on: i64) -> Result<()> {
        if feature == depends_on || self.dependency_path_exists(feature, depends_on)? {
            return Err(StoreError::DependencyCycle {
                feature,
                depends_on,
            }
            .into());
        }
        let target = self
            .get_feature(feature)?
            .ok_or(StoreError::FeatureNotFound { index: feature })?;
        if target.passes {
            return Err(StoreError::FeatureBlocked { index: feature }.into());
        }
        self.conn.execute(
            "INSERT INTO feature_deps (feature_idx, depends_on_idx) VALUES (?1, ?2)
             ON CONFLICT DO NOTHING",
            params![feature, depends_on],
        )?;
        Ok(())
    }

    pub fn remove_feature_dependency(&mut self, feature: i64, depends_on: i64) -> Result<()> {
        self.conn.execute(
            "DELETE FROM feature_deps WHERE feature_idx = ?1 AND depends_on_idx = ?2",
            params![feature, depends_on],
        )?;
        Ok(())
    }

    /// True when `to` is reachable from `from` along dependency edges,
    /// i.e. `from` (transitively) depends on `to` ... with edges read as
    /// depends-on. Used to reject cycles before insert.
    fn dependency_path_exists(&self, from: i64, to: i64) -> Result<bool> {
        let mut stack = vec![from];
        let mut seen = std::collections::HashSet::new();
        while let Some(node) = stack.pop() {
            if node == to {
                return Ok(true);
            }
            if !seen.insert(node) {
                continue;
            }
            // Walk edges in reverse: who depends on `node`.
            for dependent in self.feature_dependents_of(node)? {
                stack.push(dependent);
            }
        }
        Ok(false)
    }

    fn feature_deps_of(&self, index: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT depends_on_idx FROM feature_deps WHERE feature_idx = ?1 ORDER BY depends_on_idx",
        )?;
        let deps = stmt
            .query_map(params![index], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(deps)
    }

    fn feature_dependents_of(&self, index: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT feature_idx FROM feature_deps WHERE depends_on_idx = ?1 ORDER BY feature_idx",
        )?;
        let deps = stmt
            .query_map(params![index], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(deps)
    }

    fn feature_artifact_ids(&self, index: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT artifact_id FROM feature_artifacts WHERE feature_idx = ?1 ORDER BY artifact_id",
        )?;
        let ids = stmt
            .query_map(params![index], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(ids)
    }

    /// Highest-salience incomplete feature whose dependencies all pass.
    /// Ties break toward the lower index. With `skip_blocked = false`,
    /// blocked features may be returned so the caller can surface them.
    pub fn next_feature_by_salience(
        &self,
        context: &SalienceContext,
        skip_blocked: bool,
    ) -> Result<Option<Feature>> {
        let status = self.feature_status_map()?;
        let mut best: Option<(f64, Feature)> = None;

        for feature in self.list_features()? {
            if feature.passes {
                continue;
            }
            if skip_blocked && feature.is_blocked(&status) {
                continue;
            }
            let score = calculate_salience(&feature, context);
            let better = match &best {
                None => true,
                Some((best_score, best_feature)) => {
                    score > *best_score
                        || (score == *best_score && feature.index < best_feature.index)
                }
            };
            if better {
                best = Some((score, feature));
            }
        }

        Ok(best.map(|(_, f)| f))
    }

    /// All incomplete features ranked by salience, highest first.
    pub fn features_by_salience(
        &self,
        context: &SalienceContext,
    ) -> Result<Vec<(Feature, f64)>> {
        let mut ranked: Vec<(Feature, f64)> = self
            .list_features()?
            .into_iter()
            .filter(|f| !f.passes)
            .map(|f| {
                let score = calculate_salience(&f, context);
                (f, score)
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.index.cmp(&b.0.index))
        });
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_store;
    use super::*;
    use chrono::Duration;

    fn seed(store: &mut StateStore, index: i64, priority: i64) {
        store
            .add_feature(
                index,
                FeatureCategory::Functional,
                &format!("feature {index}"),
                &["step one".into()],
                priority,
                &[],
            )
            .unwrap();
    }

    #[test]
    fn fresh_priority_one_feature_scores_exactly_point_four() {
        let feature = Feature {
            index: 9,
            category: FeatureCategory::Functional,
            description: "login".into(),
            steps: vec![],
            passes: false,
            priority: 1,
            failure_count: 0,
            last_worked: None,
            blocked_by: vec![],
            blocks: vec![],
            verified_at: None,
            verification_artifacts: vec![],
            skip_verification: false,
            blocked_reason: None,
        };
        let score = calculate_salience(&feature, &SalienceContext::default());
        assert_eq!(score, 0.40);
    }

    #[test]
    fn salience_penalties_and_boosts() {
        let mut feature = Feature {
            index: 2,
            category: FeatureCategory::Functional,
            description: "cart".into(),
            steps: vec![],
            passes: false,
            priority: 1,
            failure_count: 5, // capped at 3 -> -0.30
            last_worked: Some((Utc::now() - Duration::days(10)).to_rfc3339()), // capped 5 -> -0.10
            blocked_by: vec![],
            blocks: vec![7, 8], // +0.10
            verified_at: None,
            verification_artifacts: vec![],
            skip_verification: false,
            blocked_reason: None,
        };
        let ctx = SalienceContext {
            related_features: vec![2], // +0.20
        };
        let score = calculate_salience(&feature, &ctx);
        assert!((score - 0.30).abs() < 1e-9, "got {score}");

        // Clamp at zero.
        feature.priority = 4;
        feature.blocks = vec![];
        let score = calculate_salience(&feature, &SalienceContext::default());
        assert_eq!(score, 0.0);
    }

    #[test]
    fn mark_passing_requires_evidence() {
        let (mut store, _dir) = test_store();
        seed(&mut store, 5, 2);

        let err = store.mark_feature_passing(5, &[], false).unwrap_err();
        assert!(
            matches!(
                err.downcast_ref::<StoreError>(),
                Some(StoreError::MissingEvidence { index: 5 })
            ),
            "got {err}"
        );
        assert!(!store.get_feature(5).unwrap().unwrap().passes);
    }

    #[test]
    fn mark_passing_with_evidence_then_idempotent() {
        let (mut store, _dir) = test_store();
        seed(&mut store, 5, 2);
        let session = store.create_session().unwrap();
        let artifact = store
            .record_artifact(
                session.id,
                super::super::models::ArtifactType::Screenshot,
                "verification/feature_5_login.png",
                "cafebabe",
                serde_json::json!({}),
            )
            .unwrap();

        let outcome = store
            .mark_feature_passing(5, &[artifact.id], false)
            .unwrap();
        assert_eq!(outcome, MarkOutcome::Marked);

        let feature = store.get_feature(5).unwrap().unwrap();
        assert!(feature.passes);
        assert_eq!(feature.verification_artifacts, vec![artifact.id]);
        assert!(feature.verified_at.is_some());

        let again = store
            .mark_feature_passing(5, &[artifact.id], false)
            .unwrap();
        assert_eq!(again, MarkOutcome::AlreadyPassing);
    }

    #[test]
    fn skip_verification_allows_empty_evidence() {
        let (mut store, _dir) = test_store();
        seed(&mut store, 1, 3);
        let outcome = store.mark_feature_passing(1, &[], true).unwrap();
        assert_eq!(outcome, MarkOutcome::Marked);
        assert!(store.get_feature(1).unwrap().unwrap().skip_verification);
    }

    #[test]
    fn record_attempt_tracks_failures_and_resets() {
        let (mut store, _dir) = test_store();
        seed(&mut store, 1, 3);

        store.record_attempt(1, false).unwrap();
        store.record_attempt(1, false).unwrap();
        let feature = store.get_feature(1).unwrap().unwrap();
        assert_eq!(feature.failure_count, 2);
        assert!(feature.last_worked.is_some());

        store.record_attempt(1, true).unwrap();
        assert_eq!(store.get_feature(1).unwrap().unwrap().failure_count, 0);
    }

    #[test]
    fn dependency_cycles_are_rejected() {
        let (mut store, _dir) = test_store();
        seed(&mut store, 1, 3);
        seed(&mut store, 2, 3);
        seed(&mut store, 3, 3);

        store.add_feature_dependency(2, 1).unwrap();
        store.add_feature_dependency(3, 2).unwrap();

        // 1 -> 3 would close the loop 1 <- 2 <- 3 <- 1.
        let err = store.add_feature_dependency(1, 3).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::DependencyCycle { .. })
        ));

        // Self-dependency is a degenerate cycle.
        assert!(store.add_feature_dependency(1, 1).is_err());
    }

    #[test]
    fn next_by_salience_skips_passing_and_blocked() {
        let (mut store, _dir) = test_store();
        seed(&mut store, 1, 1);
        seed(&mut store, 2, 1);
        seed(&mut store, 3, 4);
        store.add_feature_dependency(2, 1).unwrap();

        // Feature 2 is blocked by 1; both have priority 1. Only 1 and 3
        // are eligible, and 1 outranks 3.
        let next = store
            .next_feature_by_salience(&SalienceContext::default(), true)
            .unwrap()
            .unwrap();
        assert_eq!(next.index, 1);

        store.mark_feature_passing(1, &[], true).unwrap();
        let next = store
            .next_feature_by_salience(&SalienceContext::default(), true)
            .unwrap()
            .unwrap();
        assert_eq!(next.index, 2, "unblocked once dependency passes");
    }

    #[test]
    fn ties_break_toward_lower_index() {
        let (mut store, _dir) = test_store();
        seed(&mut store, 7, 2);
        seed(&mut store, 3, 2);
        let next = store
            .next_feature_by_salience(&SalienceContext::default(), true)
            .unwrap()
            .unwrap();
        assert_eq!(next.index, 3);
    }

    #[test]
    fn blocked_feature_cannot_be_marked_passing() {
        let (mut store, _dir) = test_store();
        seed(&mut store, 1, 2);
        seed(&mut store, 2, 2);
        store.add_feature_dependency(2, 1).unwrap();

        let err = store.mark_feature_passing(2, &[], true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::FeatureBlocked { index: 2 })
        ));

        store.mark_feature_passing(1, &[], true).unwrap();
        assert_eq!(
            store.mark_feature_passing(2, &[], true).unwrap(),
            MarkOutcome::Marked
        );

        // A passing feature cannot acquire new blockers.
        seed(&mut store, 3, 2);
        assert!(store.add_feature_dependency(2, 3).is_err());
    }

    #[test]
    fn regression_marks_feature_failing() {
        let (mut store, _dir) = test_store();
        seed(&mut store, 4, 2);
        store.mark_feature_passing(4, &[], true).unwrap();
        assert!(store.mark_feature_failing(4, Some("broke at checkout")).unwrap());
        let feature = store.get_feature(4).unwrap().unwrap();
        assert!(!feature.passes);
        assert_eq!(feature.blocked_reason.as_deref(), Some("broke at checkout"));
        // A second call reports nothing to do.
        assert!(!store.mark_feature_failing(4, None).unwrap());
    }
}
