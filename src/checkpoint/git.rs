//! Thin git2 wrapper for checkpoint snapshots and rollback.

use anyhow::{Context, Result};
use git2::{Repository, Signature};
use std::path::Path;

pub struct GitWorkspace {
    repo: Repository,
}

impl GitWorkspace {
    pub fn open(project_dir: &Path) -> Result<Self> {
        let repo = Repository::open(project_dir).context("Failed to open git repository")?;
        Ok(Self { repo })
    }

    /// Open the repository, initializing one on first use.
    pub fn open_or_init(project_dir: &Path) -> Result<Self> {
        let repo = match Repository::open(project_dir) {
            Ok(repo) => repo,
            Err(_) => Repository::init(project_dir).context("Failed to init git repository")?,
        };
        Ok(Self { repo })
    }

    /// Stage everything and commit. Handles the unborn branch on a fresh
    /// repository. Returns the new commit hash.
    pub fn snapshot_commit(&self, message: &str) -> Result<String> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = Signature::now("arcadia", "arcadia@localhost")?;

        let commit_id = if let Some(parent) = self.head_commit() {
            self.repo
                .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?
        } else {
            self.repo
                .commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?
        };

        Ok(commit_id.to_string())
    }

    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    pub fn head_sha(&self) -> Option<String> {
        self.head_commit().map(|c| c.id().to_string())
    }

    pub fn branch_name(&self) -> String {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.shorthand().map(str::to_string))
            .unwrap_or_else(|| "main".to_string())
    }

    /// Whether a commit hash resolves in this repository.
    pub fn commit_exists(&self, hash: &str) -> bool {
        git2::Oid::from_str(hash)
            .ok()
            .and_then(|oid| self.repo.find_commit(oid).ok())
            .is_some()
    }

    /// Hard-reset the working tree to the given commit.
    pub fn hard_reset(&self, hash: &str) -> Result<()> {
        let oid = git2::Oid::from_str(hash).context("Invalid commit hash")?;
        let commit = self.repo.find_commit(oid).context("Commit not found")?;
        self.repo
            .reset(commit.as_object(), git2::ResetType::Hard, None)
            .context("Hard reset failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn setup() -> (GitWorkspace, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let ws = GitWorkspace::open_or_init(dir.path()).unwrap();
        (ws, dir)
    }

    #[test]
    fn snapshot_on_fresh_repo_creates_initial_commit() {
        let (ws, dir) = setup();
        assert!(ws.head_sha().is_none());
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let sha = ws.snapshot_commit("first snapshot").unwrap();
        assert_eq!(sha.len(), 40);
        assert_eq!(ws.head_sha().unwrap(), sha);
        assert!(ws.commit_exists(&sha));
    }

    #[test]
    fn hard_reset_restores_working_tree() {
        let (ws, dir) = setup();
        let file = dir.path().join("state.txt");
        fs::write(&file, "before").unwrap();
        let sha = ws.snapshot_commit("baseline").unwrap();

        fs::write(&file, "after").unwrap();
        ws.snapshot_commit("changed").unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "after");

        ws.hard_reset(&sha).unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "before");
    }

    #[test]
    fn commit_exists_rejects_unknown_hash() {
        let (ws, _dir) = setup();
        assert!(!ws.commit_exists("0000000000000000000000000000000000000000"));
        assert!(!ws.commit_exists("not-a-hash"));
    }
}
