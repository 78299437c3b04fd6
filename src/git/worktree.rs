// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git worktree isolation for workers.
//!
//! Every active worker owns one worktree checked out to `worker/{id}`, in a
//! sibling directory of the main repository:
//!
//! ```text
//! /project/                      # Main repo (trunk checked out)
//! ├── .git/
//! └── src/
//!
//! /foreman-worker-w1/            # Worker worktree
//! ├── .git                       # Worktree link file
//! └── src/
//! ```
//!
//! Worktrees share the repository object database, so the only cross-worker
//! shared state is the trunk branch, which is mutated by the merge queue.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::error::GitError;

use super::repo::Git;

/// Default prefix for worktree directories.
const WORKTREE_PREFIX: &str = "foreman-";

/// Binding between a worker, its repository and its isolated worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeBinding {
    /// Worker agent id.
    pub agent_id: String,
    /// Path to the main repository.
    pub repo_path: PathBuf,
    /// Path to the worker's worktree.
    pub worktree_path: PathBuf,
    /// Branch checked out in the worktree.
    pub branch: String,
}

/// Branch name owned by a worker.
pub fn worker_branch(agent_id: &str) -> String {
    format!("worker/{}", agent_id)
}

/// Sanitize a branch name for use as a directory name.
///
/// Converts slashes to dashes and removes other problematic characters.
pub fn sanitize_branch_name(branch: &str) -> String {
    branch
        .replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|', ' '], "-")
        .trim_matches('-')
        .to_string()
}

/// Generate a worktree directory path for a branch.
///
/// With no explicit root, the worktree becomes a sibling of the repository.
pub fn worktree_path_for_branch(repo: &Path, branch: &str, root: Option<&Path>) -> PathBuf {
    let dir_name = format!("{}{}", WORKTREE_PREFIX, sanitize_branch_name(branch));
    match root {
        Some(root) => root.join(dir_name),
        None => repo.parent().unwrap_or(repo).join(dir_name),
    }
}

impl Git {
    /// Create (or force-reset) `branch` at the repository's current HEAD and
    /// check it out in its own working directory at `path`.
    ///
    /// Re-invoking with the same branch discards any worker-local commits and
    /// changes, so a retried worker always starts from a clean tree.
    #[instrument(skip(self), fields(repo = %repo.display(), path = %path.display()))]
    pub async fn create_worktree(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
    ) -> Result<PathBuf, GitError> {
        let head = self.head(repo).await?;

        if path.exists() {
            debug!("Worktree path exists, removing before reset");
            self.remove_worktree(repo, path).await?;
        } else {
            // A directory deleted behind git's back leaves a stale registration
            // that would make `worktree add` refuse the path.
            let _ = self.run(repo, &["worktree", "prune"]).await;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path_str = path.to_string_lossy().to_string();
        self.run(
            repo,
            &["worktree", "add", "-B", branch, &path_str, &head],
        )
        .await?;

        info!("Created worktree for {} at {:?}", branch, path);
        Ok(path.to_path_buf())
    }

    /// Remove a worktree and prune its registration.
    pub async fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<(), GitError> {
        let path_str = path.to_string_lossy().to_string();
        if let Err(e) = self
            .run(repo, &["worktree", "remove", "--force", &path_str])
            .await
        {
            warn!("Failed to remove worktree via git: {}", e);
            if path.exists() {
                std::fs::remove_dir_all(path)?;
            }
        }
        self.run(repo, &["worktree", "prune"]).await?;
        Ok(())
    }

    /// List branches checked out in worktrees of `repo`.
    pub async fn worktree_branches(&self, repo: &Path) -> Result<Vec<(PathBuf, String)>, GitError> {
        let output = self
            .run_raw(repo, &["worktree", "list", "--porcelain"])
            .await?;
        let mut result = Vec::new();
        let mut current_path: Option<PathBuf> = None;

        for line in output.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                current_path = Some(PathBuf::from(path));
            } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
                if let Some(path) = current_path.take() {
                    result.push((path, branch.to_string()));
                }
            }
        }
        Ok(result)
    }
}

/// Tracks the worktree bound to each active worker.
///
/// [`WorktreeManager::ensure`] is idempotent: the first dispatch creates the
/// worktree, later dispatches reuse it until it is released.
pub struct WorktreeManager {
    git: Git,
    /// Directory that holds worktrees; `None` places them next to the repo.
    root: Option<PathBuf>,
    bindings: Arc<RwLock<HashMap<String, WorktreeBinding>>>,
}

impl WorktreeManager {
    /// Create a manager.
    pub fn new(git: Git, root: Option<PathBuf>) -> Self {
        Self {
            git,
            root,
            bindings: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Git runner used by this manager.
    pub fn git(&self) -> &Git {
        &self.git
    }

    /// Create or reuse the worktree for a worker.
    pub async fn ensure(&self, agent_id: &str, repo: &Path) -> Result<WorktreeBinding, GitError> {
        {
            let bindings = self.bindings.read().await;
            if let Some(binding) = bindings.get(agent_id) {
                if binding.repo_path == repo && binding.worktree_path.exists() {
                    debug!(agent_id, "Reusing worktree {:?}", binding.worktree_path);
                    return Ok(binding.clone());
                }
            }
        }

        let branch = worker_branch(agent_id);
        let path = worktree_path_for_branch(repo, &branch, self.root.as_deref());
        self.git.create_worktree(repo, &path, &branch).await?;

        let binding = WorktreeBinding {
            agent_id: agent_id.to_string(),
            repo_path: repo.to_path_buf(),
            worktree_path: path,
            branch,
        };
        self.bindings
            .write()
            .await
            .insert(agent_id.to_string(), binding.clone());
        Ok(binding)
    }

    /// Look up the binding for a worker.
    pub async fn get(&self, agent_id: &str) -> Option<WorktreeBinding> {
        self.bindings.read().await.get(agent_id).cloned()
    }

    /// All active bindings.
    pub async fn list(&self) -> Vec<WorktreeBinding> {
        self.bindings.read().await.values().cloned().collect()
    }

    /// Discard a worker's worktree, optionally deleting its branch.
    pub async fn release(&self, agent_id: &str, delete_branch: bool) -> Result<(), GitError> {
        let binding = self.bindings.write().await.remove(agent_id);
        if let Some(binding) = binding {
            self.git
                .remove_worktree(&binding.repo_path, &binding.worktree_path)
                .await?;
            if delete_branch {
                let _ = self
                    .git
                    .run(&binding.repo_path, &["branch", "-D", &binding.branch])
                    .await;
            }
            info!(agent_id, "Released worktree {:?}", binding.worktree_path);
        }
        Ok(())
    }

    /// Release every tracked worktree.
    pub async fn cleanup(&self) {
        let ids: Vec<String> = self.bindings.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.release(&id, true).await {
                warn!("Failed to cleanup worktree for {}: {}", id, e);
            }
        }
    }
}
