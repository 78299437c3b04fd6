// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git workspace isolation and diff computation.
//!
//! Many workers edit one repository concurrently. Each worker gets its own
//! worktree on a stable `worker/{id}` branch, so working trees are never
//! shared; only the object database and trunk are, and trunk is written by
//! the serialized merge queue alone.
//!
//! All git operations shell out through [`Git`], which applies an explicit
//! timeout to every subprocess.

pub mod diff;
pub mod repo;
pub mod worktree;

pub use diff::{merge_diffs, parse_numstat, DiffStats, FileDiff};
pub use repo::{Git, DEFAULT_GIT_TIMEOUT, DEFAULT_TRUNK};
pub use worktree::{
    sanitize_branch_name, worker_branch, worktree_path_for_branch, WorktreeBinding,
    WorktreeManager,
};
