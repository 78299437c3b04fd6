// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Diff computation for worker results.
//!
//! A worker's diff is the union of two numstat diffs:
//!
//! 1. committed work: merge-base with the tracking ref → `HEAD`
//! 2. uncommitted work: `HEAD` → working tree (plus untracked files)
//!
//! Missing tracking refs and failing subcommands degrade to a partial diff
//! instead of an error.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::repo::Git;

/// Refs tried, in order, when the current branch has no upstream.
const FALLBACK_TRACKING_REFS: &[&str] = &["origin/HEAD", "origin/main", "origin/master"];

/// Per-file change statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiff {
    pub path: String,
    pub additions: u64,
    pub deletions: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

impl FileDiff {
    /// Create a diff entry without a patch.
    pub fn new(path: impl Into<String>, additions: u64, deletions: u64) -> Self {
        Self {
            path: path.into(),
            additions,
            deletions,
            patch: None,
        }
    }
}

/// Aggregate statistics over a set of file diffs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub files: usize,
    pub additions: u64,
    pub deletions: u64,
}

impl DiffStats {
    /// Summarize a diff.
    pub fn from_diff(diff: &[FileDiff]) -> Self {
        Self {
            files: diff.len(),
            additions: diff.iter().map(|d| d.additions).sum(),
            deletions: diff.iter().map(|d| d.deletions).sum(),
        }
    }
}

impl std::fmt::Display for DiffStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} file{} changed, +{} -{}",
            self.files,
            if self.files == 1 { "" } else { "s" },
            self.additions,
            self.deletions
        )
    }
}

/// Parse `git diff --numstat` output.
///
/// Each line is `additions\tdeletions\tpath`. Binary files report `-` for
/// both counts and map to 0/0. Lines with fewer than three fields or
/// non-numeric counts are skipped.
pub fn parse_numstat(output: &str) -> Vec<FileDiff> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(3, '\t');
            let additions = parse_count(fields.next()?)?;
            let deletions = parse_count(fields.next()?)?;
            let path = fields.next()?.trim();
            if path.is_empty() {
                return None;
            }
            Some(FileDiff::new(path, additions, deletions))
        })
        .collect()
}

fn parse_count(field: &str) -> Option<u64> {
    let field = field.trim();
    if field == "-" {
        Some(0)
    } else {
        field.parse().ok()
    }
}

/// Merge diffs by path, summing counts and keeping first-seen order.
pub fn merge_diffs(parts: impl IntoIterator<Item = Vec<FileDiff>>) -> Vec<FileDiff> {
    let mut merged: Vec<FileDiff> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for diff in parts.into_iter().flatten() {
        match index.get(&diff.path) {
            Some(&i) => {
                let entry = &mut merged[i];
                entry.additions += diff.additions;
                entry.deletions += diff.deletions;
                if entry.patch.is_none() {
                    entry.patch = diff.patch;
                }
            }
            None => {
                index.insert(diff.path.clone(), merged.len());
                merged.push(diff);
            }
        }
    }
    merged
}

impl Git {
    /// Merge-base of `HEAD` against the remote tracking ref, if one exists.
    pub async fn find_merge_base(&self, repo: &Path) -> Option<String> {
        let tracking = match self
            .run(
                repo,
                &["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{upstream}"],
            )
            .await
        {
            Ok(upstream) if !upstream.is_empty() => Some(upstream),
            _ => {
                let mut found = None;
                for candidate in FALLBACK_TRACKING_REFS {
                    if self
                        .run(repo, &["rev-parse", "--verify", "--quiet", candidate])
                        .await
                        .is_ok()
                    {
                        found = Some(candidate.to_string());
                        break;
                    }
                }
                found
            }
        }?;

        match self.run(repo, &["merge-base", "HEAD", &tracking]).await {
            Ok(base) if !base.is_empty() => Some(base),
            Ok(_) => None,
            Err(e) => {
                debug!("No merge-base against {}: {}", tracking, e);
                None
            }
        }
    }

    /// Compute the combined committed + uncommitted diff of a repository.
    ///
    /// Returns `None` only when both halves are empty.
    #[instrument(skip(self), fields(repo = %repo.display()))]
    pub async fn compute_git_diff(&self, repo: &Path) -> Option<Vec<FileDiff>> {
        let committed = match self.find_merge_base(repo).await {
            Some(base) => match self.run(repo, &["diff", "--numstat", &base, "HEAD"]).await {
                Ok(out) => parse_numstat(&out),
                Err(e) => {
                    warn!("Committed diff failed: {}", e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let uncommitted = if self.has_commits(repo).await {
            match self.run(repo, &["diff", "--numstat", "HEAD"]).await {
                Ok(out) => parse_numstat(&out),
                Err(e) => {
                    warn!("Uncommitted diff failed: {}", e);
                    Vec::new()
                }
            }
        } else {
            match self.run(repo, &["diff", "--numstat", "--cached"]).await {
                Ok(out) => parse_numstat(&out),
                Err(_) => Vec::new(),
            }
        };

        let untracked = self.untracked_files(repo).await;

        let merged = merge_diffs([committed, uncommitted, untracked]);
        if merged.is_empty() {
            None
        } else {
            Some(merged)
        }
    }

    /// Untracked, non-ignored files reported as pure additions.
    async fn untracked_files(&self, repo: &Path) -> Vec<FileDiff> {
        let output = match self
            .run(repo, &["ls-files", "--others", "--exclude-standard"])
            .await
        {
            Ok(out) => out,
            Err(e) => {
                debug!("Listing untracked files failed: {}", e);
                return Vec::new();
            }
        };

        output
            .lines()
            .filter(|l| !l.is_empty())
            .map(|path| {
                let additions = std::fs::read(repo.join(path))
                    .ok()
                    .filter(|bytes| !bytes.contains(&0))
                    .map(|bytes| count_lines(&bytes))
                    .unwrap_or(0);
                FileDiff::new(path, additions, 0)
            })
            .collect()
    }
}

fn count_lines(bytes: &[u8]) -> u64 {
    let newlines = bytes.iter().filter(|&&b| b == b'\n').count() as u64;
    if bytes.last().is_some_and(|&b| b != b'\n') {
        newlines + 1
    } else {
        newlines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_numstat() {
        let diff = parse_numstat("10\t5\tsrc/index.ts\n3\t1\tREADME.md");
        assert_eq!(
            diff,
            vec![
                FileDiff::new("src/index.ts", 10, 5),
                FileDiff::new("README.md", 3, 1),
            ]
        );
    }

    #[test]
    fn test_parse_numstat_binary_and_malformed() {
        let diff = parse_numstat("-\t-\tlogo.png\ngarbage\n1\t2\n\nx\ty\tz.txt\n4\t0\tok.rs\n");
        assert_eq!(
            diff,
            vec![FileDiff::new("logo.png", 0, 0), FileDiff::new("ok.rs", 4, 0)]
        );
    }

    #[test]
    fn test_merge_diffs_sums_by_path() {
        let merged = merge_diffs([
            vec![FileDiff::new("a.rs", 1, 1), FileDiff::new("b.rs", 2, 0)],
            vec![FileDiff::new("a.rs", 3, 0)],
        ]);
        assert_eq!(
            merged,
            vec![FileDiff::new("a.rs", 4, 1), FileDiff::new("b.rs", 2, 0)]
        );
    }

    #[test]
    fn test_diff_stats_display() {
        let stats = DiffStats::from_diff(&[FileDiff::new("a", 3, 1), FileDiff::new("b", 2, 2)]);
        assert_eq!(stats.to_string(), "2 files changed, +5 -3");
    }

    #[tokio::test]
    async fn test_compute_git_diff_clean_repo_is_none() {
        let temp = TempDir::new().unwrap();
        let git = Git::default();
        git.init_git_repo(temp.path()).await.unwrap();
        git.create_initial_commit(temp.path()).await.unwrap();

        assert!(git.find_merge_base(temp.path()).await.is_none());
        assert!(git.compute_git_diff(temp.path()).await.is_none());
    }

    #[tokio::test]
    async fn test_compute_git_diff_staged_file() {
        let temp = TempDir::new().unwrap();
        let git = Git::default();
        git.init_git_repo(temp.path()).await.unwrap();
        git.create_initial_commit(temp.path()).await.unwrap();

        std::fs::write(temp.path().join("notes.md"), "one\ntwo\n").unwrap();
        git.run(temp.path(), &["add", "notes.md"]).await.unwrap();

        let diff = git.compute_git_diff(temp.path()).await.unwrap();
        assert_eq!(diff, vec![FileDiff::new("notes.md", 2, 0)]);
    }

    #[tokio::test]
    async fn test_compute_git_diff_includes_untracked() {
        let temp = TempDir::new().unwrap();
        let git = Git::default();
        git.init_git_repo(temp.path()).await.unwrap();
        git.create_initial_commit(temp.path()).await.unwrap();

        std::fs::write(temp.path().join("new.rs"), "fn main() {}").unwrap();

        let diff = git.compute_git_diff(temp.path()).await.unwrap();
        assert_eq!(diff, vec![FileDiff::new("new.rs", 1, 0)]);
    }

    #[tokio::test]
    async fn test_compute_git_diff_with_tracking_ref() {
        let temp = TempDir::new().unwrap();
        let git = Git::default();
        let origin = temp.path().join("origin");
        git.init_git_repo(&origin).await.unwrap();
        git.create_initial_commit(&origin).await.unwrap();

        let clone = temp.path().join("clone");
        git.run(
            temp.path(),
            &["clone", "-q", &origin.to_string_lossy(), &clone.to_string_lossy()],
        )
        .await
        .unwrap();

        std::fs::write(clone.join("feature.txt"), "a\nb\nc\n").unwrap();
        git.commit_all(&clone, "feature").await.unwrap();

        assert!(git.find_merge_base(&clone).await.is_some());
        let diff = git.compute_git_diff(&clone).await.unwrap();
        assert_eq!(diff, vec![FileDiff::new("feature.txt", 3, 0)]);
    }
}
