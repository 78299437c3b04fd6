// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git subprocess runner and idempotent repository bootstrap.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::GitError;

/// Default timeout applied to every git subprocess call.
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Branch name used when initializing a fresh repository.
pub const DEFAULT_TRUNK: &str = "main";

/// Identity used for commits made by foreman when the repo has none configured.
const FALLBACK_NAME: &str = "foreman";
const FALLBACK_EMAIL: &str = "foreman@localhost";

/// Handle for running git commands with an explicit timeout.
///
/// Every git invocation in the crate goes through [`Git::run`], so a hung
/// subprocess (credential prompt, lock contention) never stalls a worker.
#[derive(Debug, Clone)]
pub struct Git {
    timeout: Duration,
}

impl Default for Git {
    fn default() -> Self {
        Self::new(DEFAULT_GIT_TIMEOUT)
    }
}

impl Git {
    /// Create a runner with the given per-command timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Per-command timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run a git command in `dir` and return trimmed stdout.
    pub async fn run(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = self.output(dir, args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(GitError::Command {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Run a git command and return stdout without trimming.
    ///
    /// Used for porcelain output where leading whitespace is significant.
    pub async fn run_raw(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = self.output(dir, args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(GitError::Command {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn output(&self, dir: &Path, args: &[&str]) -> Result<std::process::Output, GitError> {
        debug!(dir = %dir.display(), "git {}", args.join(" "));
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(GitError::Timeout {
                command: args.join(" "),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    /// Check whether `path` is inside a git working tree.
    pub async fn is_git_repo(&self, path: &Path) -> bool {
        if !path.is_dir() {
            return false;
        }
        matches!(
            self.run(path, &["rev-parse", "--is-inside-work-tree"]).await.as_deref(),
            Ok("true")
        )
    }

    /// Initialize a repository at `path` with `main` as its trunk.
    ///
    /// Returns `false` if the path was already a repository.
    pub async fn init_git_repo(&self, path: &Path) -> Result<bool, GitError> {
        if self.is_git_repo(path).await {
            return Ok(false);
        }
        std::fs::create_dir_all(path)?;
        self.run(path, &["init"]).await?;
        let head_ref = format!("refs/heads/{}", DEFAULT_TRUNK);
        self.run(path, &["symbolic-ref", "HEAD", &head_ref]).await?;
        info!("Initialized git repository at {:?}", path);
        Ok(true)
    }

    /// Check whether the repository has at least one commit.
    pub async fn has_commits(&self, path: &Path) -> bool {
        self.run(path, &["rev-parse", "--verify", "--quiet", "HEAD"])
            .await
            .is_ok()
    }

    /// Create an empty initial commit if the repository has none.
    ///
    /// Returns `false` if the repository already had commits.
    pub async fn create_initial_commit(&self, path: &Path) -> Result<bool, GitError> {
        if self.has_commits(path).await {
            return Ok(false);
        }
        self.commit(path, &["--allow-empty", "-m", "Initial commit"])
            .await?;
        info!("Created initial commit in {:?}", path);
        Ok(true)
    }

    /// Current HEAD commit id.
    pub async fn head(&self, path: &Path) -> Result<String, GitError> {
        self.run(path, &["rev-parse", "HEAD"]).await
    }

    /// Run `git commit` with the given arguments, supplying a fallback identity
    /// when the repository has none configured.
    pub async fn commit(&self, path: &Path, commit_args: &[&str]) -> Result<String, GitError> {
        self.run_with_identity(path, "commit", commit_args).await
    }

    /// Run a committing subcommand, adding a fallback identity if needed.
    async fn run_with_identity(
        &self,
        path: &Path,
        subcommand: &str,
        sub_args: &[&str],
    ) -> Result<String, GitError> {
        let mut args: Vec<String> = Vec::new();
        if self.run(path, &["config", "user.email"]).await.is_err() {
            args.extend([
                "-c".to_string(),
                format!("user.name={}", FALLBACK_NAME),
                "-c".to_string(),
                format!("user.email={}", FALLBACK_EMAIL),
            ]);
        }
        args.push(subcommand.to_string());
        args.extend(sub_args.iter().map(|s| s.to_string()));
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(path, &refs).await
    }

    /// Merge `branch` into the checked-out branch with a merge commit.
    ///
    /// A conflicted merge is aborted, leaving the tree as it was.
    pub async fn merge_no_ff(
        &self,
        path: &Path,
        branch: &str,
        message: &str,
    ) -> Result<String, GitError> {
        match self
            .run_with_identity(path, "merge", &["--no-ff", "-m", message, branch])
            .await
        {
            Ok(_) => self.head(path).await,
            Err(e) => {
                let _ = self.run(path, &["merge", "--abort"]).await;
                Err(GitError::MergeConflict {
                    branch: branch.to_string(),
                    detail: e.to_string(),
                })
            }
        }
    }

    /// Rebase the checked-out branch onto `upstream`, aborting on conflict.
    pub async fn rebase_onto(&self, path: &Path, upstream: &str) -> Result<(), GitError> {
        if let Err(e) = self.run_with_identity(path, "rebase", &[upstream]).await {
            let _ = self.run(path, &["rebase", "--abort"]).await;
            return Err(e);
        }
        debug!("Rebased {:?} onto {}", path, upstream);
        Ok(())
    }

    /// Stage everything and commit if the working tree is dirty.
    ///
    /// Returns `true` if a commit was created.
    pub async fn commit_all(&self, path: &Path, message: &str) -> Result<bool, GitError> {
        let status = self.run(path, &["status", "--porcelain"]).await?;
        if status.is_empty() {
            return Ok(false);
        }
        self.run(path, &["add", "-A"]).await?;
        self.commit(path, &["-m", message]).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let git = Git::default();

        assert!(!git.is_git_repo(temp.path()).await);
        assert!(git.init_git_repo(temp.path()).await.unwrap());
        assert!(git.is_git_repo(temp.path()).await);
        assert!(!git.init_git_repo(temp.path()).await.unwrap());

        assert!(!git.has_commits(temp.path()).await);
        assert!(git.create_initial_commit(temp.path()).await.unwrap());
        assert!(git.has_commits(temp.path()).await);
        assert!(!git.create_initial_commit(temp.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_init_uses_main_trunk() {
        let temp = TempDir::new().unwrap();
        let git = Git::default();
        git.init_git_repo(temp.path()).await.unwrap();
        git.create_initial_commit(temp.path()).await.unwrap();

        let branch = git.run(temp.path(), &["branch", "--show-current"]).await.unwrap();
        assert_eq!(branch, "main");
    }

    #[tokio::test]
    async fn test_commit_all_skips_clean_tree() {
        let temp = TempDir::new().unwrap();
        let git = Git::default();
        git.init_git_repo(temp.path()).await.unwrap();
        git.create_initial_commit(temp.path()).await.unwrap();

        assert!(!git.commit_all(temp.path(), "nothing").await.unwrap());

        std::fs::write(temp.path().join("a.txt"), "hello\n").unwrap();
        assert!(git.commit_all(temp.path(), "add a").await.unwrap());
        let status = git.run(temp.path(), &["status", "--porcelain"]).await.unwrap();
        assert!(status.is_empty());
    }

    #[tokio::test]
    async fn test_failed_command_reports_stderr() {
        let temp = TempDir::new().unwrap();
        let git = Git::default();
        git.init_git_repo(temp.path()).await.unwrap();

        let err = git.run(temp.path(), &["rev-parse", "no-such-ref"]).await.unwrap_err();
        assert!(matches!(err, GitError::Command { .. }));
    }

    #[tokio::test]
    async fn test_merge_conflict_is_aborted() {
        let temp = TempDir::new().unwrap();
        let git = Git::default();
        let repo = temp.path();
        git.init_git_repo(repo).await.unwrap();
        std::fs::write(repo.join("shared.txt"), "base\n").unwrap();
        git.commit_all(repo, "base").await.unwrap();

        git.run(repo, &["checkout", "-b", "feature"]).await.unwrap();
        std::fs::write(repo.join("shared.txt"), "feature\n").unwrap();
        git.commit_all(repo, "feature edit").await.unwrap();

        git.run(repo, &["checkout", "main"]).await.unwrap();
        std::fs::write(repo.join("shared.txt"), "trunk\n").unwrap();
        git.commit_all(repo, "trunk edit").await.unwrap();
        let before = git.head(repo).await.unwrap();

        let err = git.merge_no_ff(repo, "feature", "merge feature").await.unwrap_err();
        assert!(matches!(err, GitError::MergeConflict { ref branch, .. } if branch == "feature"));
        assert_eq!(git.head(repo).await.unwrap(), before);
        let status = git.run(repo, &["status", "--porcelain"]).await.unwrap();
        assert!(status.is_empty());
    }
}
