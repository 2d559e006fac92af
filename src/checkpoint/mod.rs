//! Semantic checkpointing.
//!
//! A checkpoint pairs a VCS commit with the full feature-status map, taken
//! at meaningful points: feature completion, before risky operations,
//! session boundaries, error recovery, human request, and pause. Rollback
//! restores both the working tree and the feature snapshot; the event
//! history is append-only and survives rollbacks untouched.

pub mod git;

use anyhow::{Context, Result};
use serde_json::json;

use crate::events::EventType;
use crate::store::StateStore;
use crate::store::models::{Checkpoint, CheckpointTrigger};
use git::GitWorkspace;

pub struct CheckpointManager {
    workspace: GitWorkspace,
}

/// Result of a rollback.
#[derive(Debug, Clone)]
pub struct RollbackResult {
    pub checkpoint_id: i64,
    pub commit: String,
    pub features_restored: usize,
}

impl CheckpointManager {
    pub fn new(workspace: GitWorkspace) -> Self {
        Self { workspace }
    }

    pub fn workspace(&self) -> &GitWorkspace {
        &self.workspace
    }

    /// Create a checkpoint at the next sequence number for this session.
    /// The commit message is deterministic over (trigger, session, seq),
    /// and the store insert is idempotent per that triple.
    pub fn create(
        &self,
        store: &mut StateStore,
        session_id: i64,
        trigger: CheckpointTrigger,
        pending_work: &[String],
        notes: Option<&str>,
    ) -> Result<Checkpoint> {
        let seq = store.max_checkpoint_seq(session_id)? + 1;
        self.create_with_seq(store, session_id, seq, trigger, pending_work, notes)
    }

    /// Create (or return) the checkpoint at an explicit sequence number.
    pub fn create_with_seq(
        &self,
        store: &mut StateStore,
        session_id: i64,
        seq: i64,
        trigger: CheckpointTrigger,
        pending_work: &[String],
        notes: Option<&str>,
    ) -> Result<Checkpoint> {
        let message = format!(
            "[arcadia] {} checkpoint (session {}, seq {})",
            trigger.as_str(),
            session_id,
            seq
        );
        let commit = self
            .workspace
            .snapshot_commit(&message)
            .context("Failed to create snapshot commit")?;
        let branch = self.workspace.branch_name();

        let checkpoint = store.insert_checkpoint(
            session_id,
            seq,
            trigger,
            &commit,
            &branch,
            pending_work,
            notes,
        )?;

        store.append_event(
            session_id,
            EventType::Checkpoint,
            json!({
                "checkpoint_id": checkpoint.id,
                "trigger": trigger.as_str(),
                "commit": checkpoint.vcs_commit_hash,
                "features_passing": checkpoint
                    .feature_status
                    .values()
                    .filter(|passes| **passes)
                    .count(),
            }),
        )?;

        Ok(checkpoint)
    }

    /// Restore the working tree to a checkpoint's commit and write back
    /// its feature-status snapshot. Emits a CHECKPOINT event; intervening
    /// events are never deleted.
    pub fn rollback_to(
        &self,
        store: &mut StateStore,
        checkpoint_id: i64,
    ) -> Result<RollbackResult> {
        let checkpoint = store
            .get_checkpoint(checkpoint_id)?
            .ok_or_else(|| anyhow::anyhow!("Checkpoint {checkpoint_id} not found"))?;

        if !self.workspace.commit_exists(&checkpoint.vcs_commit_hash) {
            anyhow::bail!(
                "Checkpoint {checkpoint_id} references commit {} which does not resolve",
                checkpoint.vcs_commit_hash
            );
        }

        self.workspace.hard_reset(&checkpoint.vcs_commit_hash)?;

        let mut restored = 0usize;
        let current = store.feature_status_map()?;
        for (index, passes) in &checkpoint.feature_status {
            if current.get(index) != Some(passes) {
                store.restore_feature_status(*index, *passes)?;
                restored += 1;
            }
        }

        store.append_event(
            checkpoint.session_id,
            EventType::Checkpoint,
            json!({
                "rollback_to": checkpoint_id,
                "commit": checkpoint.vcs_commit_hash,
                "features_restored": restored,
            }),
        )?;

        Ok(RollbackResult {
            checkpoint_id,
            commit: checkpoint.vcs_commit_hash,
            features_restored: restored,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::FeatureCategory;
    use std::fs;
    use tempfile::tempdir;

    fn setup() -> (CheckpointManager, StateStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let workspace = GitWorkspace::open_or_init(dir.path()).unwrap();
        let store = StateStore::open_in_memory(&dir.path().join("events.jsonl")).unwrap();
        (CheckpointManager::new(workspace), store, dir)
    }

    #[test]
    fn create_records_commit_and_snapshot() {
        let (manager, mut store, dir) = setup();
        fs::write(dir.path().join("app.js"), "console.log('hi')").unwrap();
        store
            .add_feature(5, FeatureCategory::Functional, "login", &[], 1, &[])
            .unwrap();
        store.mark_feature_passing(5, &[], true).unwrap();
        let session = store.create_session().unwrap();

        let checkpoint = manager
            .create(
                &mut store,
                session.id,
                CheckpointTrigger::FeatureComplete,
                &[],
                None,
            )
            .unwrap();

        assert_eq!(checkpoint.trigger, CheckpointTrigger::FeatureComplete);
        assert_eq!(checkpoint.feature_status.get(&5), Some(&true));
        assert!(manager.workspace().commit_exists(&checkpoint.vcs_commit_hash));

        let events = store.events_for_session(session.id).unwrap();
        assert!(
            events
                .iter()
                .any(|e| e.event_type == crate::events::EventType::Checkpoint)
        );
    }

    #[test]
    fn sequence_numbers_advance_per_session() {
        let (manager, mut store, dir) = setup();
        fs::write(dir.path().join("f.txt"), "x").unwrap();
        let session = store.create_session().unwrap();

        let a = manager
            .create(&mut store, session.id, CheckpointTrigger::SessionStart, &[], None)
            .unwrap();
        let b = manager
            .create(&mut store, session.id, CheckpointTrigger::SessionEnd, &[], None)
            .unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
    }

    #[test]
    fn rollback_restores_tree_and_feature_snapshot() {
        let (manager, mut store, dir) = setup();
        let file = dir.path().join("state.txt");
        fs::write(&file, "v1").unwrap();
        store
            .add_feature(1, FeatureCategory::Functional, "one", &[], 2, &[])
            .unwrap();
        let session = store.create_session().unwrap();

        // Baseline: feature 1 not passing, file at v1.
        let baseline = manager
            .create(&mut store, session.id, CheckpointTrigger::SessionStart, &[], None)
            .unwrap();

        // Progress: file changes and the feature passes.
        fs::write(&file, "v2").unwrap();
        store.mark_feature_passing(1, &[], true).unwrap();
        manager
            .create(
                &mut store,
                session.id,
                CheckpointTrigger::FeatureComplete,
                &[],
                None,
            )
            .unwrap();

        let result = manager.rollback_to(&mut store, baseline.id).unwrap();
        assert_eq!(result.features_restored, 1);
        assert_eq!(fs::read_to_string(&file).unwrap(), "v1");
        assert!(!store.get_feature(1).unwrap().unwrap().passes);

        // Rollback matches the snapshot exactly.
        let snapshot_now = store.feature_status_map().unwrap();
        assert_eq!(snapshot_now, baseline.feature_status);
    }

    #[test]
    fn rollback_keeps_event_history() {
        let (manager, mut store, dir) = setup();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        let session = store.create_session().unwrap();
        let checkpoint = manager
            .create(&mut store, session.id, CheckpointTrigger::SessionStart, &[], None)
            .unwrap();
        let before = store.events_for_session(session.id).unwrap().len();

        manager.rollback_to(&mut store, checkpoint.id).unwrap();
        let after = store.events_for_session(session.id).unwrap().len();
        assert_eq!(after, before + 1, "rollback appends, never deletes");
    }
}
