// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Serialized merges of worker branches into trunk.
//!
//! An entry is ready once every task it is blocked by has merged. Ready
//! entries merge in creation order, one at a time: the queue's lock is held
//! for the whole of [`MergeQueue::process`], so at most one merge touches
//! trunk at any moment.

use std::collections::HashSet;
use std::path::PathBuf;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::GitError;
use crate::git::Git;

/// A worker branch waiting to merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeRequest {
    pub task_id: String,
    pub worker_id: String,
    pub branch: String,
    pub worktree_path: PathBuf,
    /// Tasks that must merge first.
    pub blocked_by: Vec<String>,
    /// Commit message for pending changes and the merge commit.
    pub message: String,
}

/// How one merge ended.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Merged { commit: String },
    /// Conflicting merge, already aborted.
    Conflict { detail: String },
    Failed(String),
}

impl MergeOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, Self::Merged { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub task_id: String,
    pub worker_id: String,
    pub branch: String,
    pub outcome: MergeOutcome,
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    request: MergeRequest,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: Vec<Entry>,
    merged: HashSet<String>,
    next_seq: u64,
}

impl QueueState {
    /// Index of the oldest entry whose dependencies have all merged.
    fn next_ready(&self) -> Option<usize> {
        self.pending
            .iter()
            .enumerate()
            .filter(|(_, e)| e.request.blocked_by.iter().all(|d| self.merged.contains(d)))
            .min_by_key(|(_, e)| e.seq)
            .map(|(idx, _)| idx)
    }
}

/// Merge queue for one repository.
pub struct MergeQueue {
    git: Git,
    repo: PathBuf,
    trunk: String,
    rebase_siblings: bool,
    state: Mutex<QueueState>,
}

impl MergeQueue {
    pub fn new(git: Git, repo: impl Into<PathBuf>, trunk: impl Into<String>) -> Self {
        Self {
            git,
            repo: repo.into(),
            trunk: trunk.into(),
            rebase_siblings: false,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Rebase waiting branches onto trunk after each merge.
    pub fn with_rebase_siblings(mut self, enabled: bool) -> Self {
        self.rebase_siblings = enabled;
        self
    }

    pub fn trunk(&self) -> &str {
        &self.trunk
    }

    /// Queue a branch.
    pub async fn enqueue(&self, request: MergeRequest) {
        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        debug!(task_id = %request.task_id, branch = %request.branch, seq, "Merge queued");
        state.pending.push(Entry { seq, request });
    }

    /// Count a task as merged without a branch, unblocking its dependents.
    pub async fn mark_merged(&self, task_id: &str) {
        self.state.lock().await.merged.insert(task_id.to_string());
    }

    /// Drop a queued entry. Returns whether one was removed.
    pub async fn remove(&self, task_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let before = state.pending.len();
        state.pending.retain(|e| e.request.task_id != task_id);
        state.pending.len() != before
    }

    /// Task ids waiting to merge, in creation order.
    pub async fn pending(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut entries: Vec<&Entry> = state.pending.iter().collect();
        entries.sort_by_key(|e| e.seq);
        entries.iter().map(|e| e.request.task_id.clone()).collect()
    }

    pub async fn is_merged(&self, task_id: &str) -> bool {
        self.state.lock().await.merged.contains(task_id)
    }

    /// Merge every ready entry, one at a time, until none is ready.
    #[instrument(skip(self), fields(repo = %self.repo.display(), trunk = %self.trunk))]
    pub async fn process(&self) -> Vec<MergeResult> {
        let mut state = self.state.lock().await;
        let mut results = Vec::new();

        while let Some(idx) = state.next_ready() {
            let entry = state.pending.remove(idx);
            let request = entry.request;
            let outcome = self.merge_one(&request).await;

            match &outcome {
                MergeOutcome::Merged { commit } => {
                    info!(task_id = %request.task_id, branch = %request.branch, commit = %commit, "Merged into trunk");
                    state.merged.insert(request.task_id.clone());
                    if self.rebase_siblings {
                        self.rebase_waiting(&state.pending).await;
                    }
                }
                MergeOutcome::Conflict { detail } => {
                    warn!(task_id = %request.task_id, branch = %request.branch, "Merge conflict: {}", detail);
                }
                MergeOutcome::Failed(e) => {
                    warn!(task_id = %request.task_id, branch = %request.branch, "Merge failed: {}", e);
                }
            }

            results.push(MergeResult {
                task_id: request.task_id,
                worker_id: request.worker_id,
                branch: request.branch,
                outcome,
            });
        }
        results
    }

    async fn merge_one(&self, request: &MergeRequest) -> MergeOutcome {
        if request.worktree_path.exists() {
            if let Err(e) = self
                .git
                .commit_all(&request.worktree_path, &request.message)
                .await
            {
                return MergeOutcome::Failed(format!("commit pending changes: {}", e));
            }
        }
        if let Err(e) = self.git.run(&self.repo, &["checkout", &self.trunk]).await {
            return MergeOutcome::Failed(format!("checkout {}: {}", self.trunk, e));
        }
        match self
            .git
            .merge_no_ff(&self.repo, &request.branch, &request.message)
            .await
        {
            Ok(commit) => MergeOutcome::Merged { commit },
            Err(GitError::MergeConflict { detail, .. }) => MergeOutcome::Conflict { detail },
            Err(e) => MergeOutcome::Failed(e.to_string()),
        }
    }

    async fn rebase_waiting(&self, waiting: &[Entry]) {
        for entry in waiting {
            let path = &entry.request.worktree_path;
            if !path.exists() {
                continue;
            }
            let rebased = match self.git.commit_all(path, &entry.request.message).await {
                Ok(_) => self.git.rebase_onto(path, &self.trunk).await,
                Err(e) => Err(e),
            };
            match rebased {
                Ok(()) => debug!(branch = %entry.request.branch, "Rebased onto trunk"),
                Err(e) => warn!(branch = %entry.request.branch, "Sibling rebase skipped: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::{worker_branch, WorktreeManager};
    use std::path::Path;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Git, PathBuf, WorktreeManager) {
        let temp = TempDir::new().unwrap();
        let git = Git::default();
        let repo = temp.path().join("repo");
        git.init_git_repo(&repo).await.unwrap();
        std::fs::write(repo.join("shared.txt"), "base\n").unwrap();
        git.commit_all(&repo, "base").await.unwrap();
        let manager = WorktreeManager::new(git.clone(), Some(temp.path().join("trees")));
        (temp, git, repo, manager)
    }

    async fn request(
        manager: &WorktreeManager,
        repo: &Path,
        task: &str,
        file: &str,
        content: &str,
        blocked_by: &[&str],
    ) -> MergeRequest {
        let worker = format!("w-{}", task);
        let binding = manager.ensure(&worker, repo).await.unwrap();
        std::fs::write(binding.worktree_path.join(file), content).unwrap();
        MergeRequest {
            task_id: task.to_string(),
            worker_id: worker.clone(),
            branch: worker_branch(&worker),
            worktree_path: binding.worktree_path,
            blocked_by: blocked_by.iter().map(|s| s.to_string()).collect(),
            message: format!("Task {}", task),
        }
    }

    #[tokio::test]
    async fn test_merges_in_dependency_then_creation_order() {
        let (_temp, git, repo, manager) = setup().await;
        let queue = MergeQueue::new(git.clone(), &repo, "main");

        queue
            .enqueue(request(&manager, &repo, "b", "b.txt", "b\n", &["a"]).await)
            .await;
        queue
            .enqueue(request(&manager, &repo, "c", "c.txt", "c\n", &[]).await)
            .await;
        queue
            .enqueue(request(&manager, &repo, "a", "a.txt", "a\n", &[]).await)
            .await;
        assert_eq!(queue.pending().await, vec!["b", "c", "a"]);

        let results = queue.process().await;
        let order: Vec<&str> = results.iter().map(|r| r.task_id.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
        assert!(results.iter().all(|r| r.outcome.is_merged()));
        assert!(queue.pending().await.is_empty());

        for file in ["a.txt", "b.txt", "c.txt"] {
            assert!(repo.join(file).exists(), "{} missing on trunk", file);
        }
        let log = git.run(&repo, &["log", "--merges", "--format=%s"]).await.unwrap();
        assert_eq!(log.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_blocked_entry_waits_for_dependency() {
        let (_temp, git, repo, manager) = setup().await;
        let queue = MergeQueue::new(git, &repo, "main");
        queue
            .enqueue(request(&manager, &repo, "b", "b.txt", "b\n", &["a"]).await)
            .await;

        assert!(queue.process().await.is_empty());
        assert_eq!(queue.pending().await, vec!["b"]);

        queue.mark_merged("a").await;
        let results = queue.process().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].outcome.is_merged());
    }

    #[tokio::test]
    async fn test_conflict_is_reported_and_trunk_left_clean() {
        let (_temp, git, repo, manager) = setup().await;
        let queue = MergeQueue::new(git.clone(), &repo, "main");
        queue
            .enqueue(request(&manager, &repo, "a", "shared.txt", "from a\n", &[]).await)
            .await;
        queue
            .enqueue(request(&manager, &repo, "b", "shared.txt", "from b\n", &[]).await)
            .await;

        let results = queue.process().await;
        assert!(results[0].outcome.is_merged());
        assert!(matches!(results[1].outcome, MergeOutcome::Conflict { .. }));
        assert!(!queue.is_merged("b").await);

        let status = git.run(&repo, &["status", "--porcelain"]).await.unwrap();
        assert!(status.is_empty());
        assert_eq!(std::fs::read_to_string(repo.join("shared.txt")).unwrap(), "from a\n");
    }

    #[tokio::test]
    async fn test_sibling_rebase_after_merge() {
        let (_temp, git, repo, manager) = setup().await;
        let queue = MergeQueue::new(git, &repo, "main").with_rebase_siblings(true);
        queue
            .enqueue(request(&manager, &repo, "a", "a.txt", "a\n", &[]).await)
            .await;
        let waiting = request(&manager, &repo, "b", "b.txt", "b\n", &["c"]).await;
        let waiting_path = waiting.worktree_path.clone();
        queue.enqueue(waiting).await;

        let results = queue.process().await;
        assert_eq!(results.len(), 1);
        assert_eq!(queue.pending().await, vec!["b"]);
        assert!(waiting_path.join("a.txt").exists());
        assert!(waiting_path.join("b.txt").exists());

        assert!(queue.remove("b").await);
        assert!(!queue.remove("b").await);
    }
}
