// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! Defines the structure of workspace and resolved configuration,
//! supporting JSON and YAML formats.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::CircuitBreakerConfig;
use crate::coding::activity::ActivityConfig;

/// Workspace configuration for foreman.
/// Can be defined in .foreman.json or .foreman/config.json in the project root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    /// Provider used by the direct LLM fallback
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Model name to use
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Default coding-agent backend for workers (opencode, claude-code, codex, gemini)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coding_agent: Option<String>,

    /// SQLite database for messages and agents
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,

    /// Directory that holds worker worktrees
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_root: Option<PathBuf>,

    /// Branch merges land on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trunk_branch: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hard_cap_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_timeout_ms: Option<u64>,

    /// Wait between SIGTERM and SIGKILL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kill_grace_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_buffer_bytes: Option<usize>,

    /// Upper bound on human-in-the-loop turns per task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker: Option<BreakerConfigPartial>,

    /// Remote coding-agent server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteServerConfig>,

    /// Local CLI coding agents, keyed by agent type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pty_backends: Option<HashMap<String, PtyBackendConfig>>,

    /// Rebase other worker branches onto trunk after each merge
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebase_siblings: Option<bool>,

    /// Organization charter injected into the coordinator's system prompt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charter: Option<String>,

    /// Base system prompt for the coordinator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerConfigPartial {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_timeout_ms: Option<u64>,
}

/// Remote coding-agent server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteServerConfig {
    pub base_url: String,

    /// HTTP Basic auth user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Never written back out (`config show` prints the resolved config)
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Command that starts a local server, supervised and restarted on exit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serve_command: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<u32>,
}

impl Default for RemoteServerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_REMOTE_URL.to_string(),
            username: None,
            password: None,
            serve_command: None,
            max_restarts: None,
        }
    }
}

/// Default remote server address.
pub const DEFAULT_REMOTE_URL: &str = "http://127.0.0.1:4096";

/// A local CLI coding agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PtyBackendConfig {
    pub program: String,

    /// Arguments placed before everything else
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Flag that precedes the model name, e.g. `--model`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_flag: Option<String>,

    /// Flags selecting the non-interactive approval mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_args: Option<Vec<String>>,

    /// Flag that precedes the task; the task is positional when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_flag: Option<String>,

    /// Extra environment variables
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

/// Resolved configuration with all values set.
/// This is the merged result of global, workspace, local, and CLI configs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub coding_agent: Option<String>,
    pub database_path: Option<PathBuf>,
    pub worktree_root: Option<PathBuf>,
    pub trunk_branch: String,
    pub idle_timeout_ms: u64,
    pub hard_cap_ms: u64,
    pub poll_interval_ms: u64,
    pub git_timeout_ms: u64,
    pub kill_grace_ms: u64,
    pub replay_buffer_bytes: usize,
    pub max_turns: u32,
    pub breaker_failure_threshold: u32,
    pub breaker_reset_timeout_ms: u64,
    pub remote: RemoteServerConfig,
    pub pty_backends: HashMap<String, PtyBackendConfig>,
    pub rebase_siblings: bool,
    pub charter: Option<String>,
    pub system_prompt: Option<String>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            coding_agent: None,
            database_path: None,
            worktree_root: None,
            trunk_branch: "main".to_string(),
            idle_timeout_ms: 5 * 60 * 1000,
            hard_cap_ms: 30 * 60 * 1000,
            poll_interval_ms: 5_000,
            git_timeout_ms: 30_000,
            kill_grace_ms: 5_000,
            replay_buffer_bytes: 256 * 1024,
            max_turns: 10,
            breaker_failure_threshold: 3,
            breaker_reset_timeout_ms: 60_000,
            remote: RemoteServerConfig::default(),
            pty_backends: HashMap::new(),
            rebase_siblings: false,
            charter: None,
            system_prompt: None,
        }
    }
}

impl ResolvedConfig {
    pub fn activity_config(&self) -> ActivityConfig {
        ActivityConfig {
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            hard_cap: Duration::from_millis(self.hard_cap_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            reset_timeout: Duration::from_millis(self.breaker_reset_timeout_ms),
        }
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_millis(self.git_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_config_default() {
        let config = WorkspaceConfig::default();
        assert!(config.coding_agent.is_none());
        assert!(config.remote.is_none());
    }

    #[test]
    fn test_workspace_config_json() {
        let json = r#"{
            "codingAgent": "codex",
            "idleTimeoutMs": 1000,
            "remote": {"baseUrl": "http://localhost:9000", "username": "opencode"},
            "ptyBackends": {
                "codex": {"program": "codex", "modelFlag": "--model", "approvalArgs": ["--full-auto"]}
            }
        }"#;
        let config: WorkspaceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.coding_agent.as_deref(), Some("codex"));
        assert_eq!(config.idle_timeout_ms, Some(1000));
        assert_eq!(config.remote.unwrap().username.as_deref(), Some("opencode"));
        let codex = &config.pty_backends.unwrap()["codex"];
        assert_eq!(codex.approval_args, Some(vec!["--full-auto".to_string()]));
        assert!(codex.args.is_empty());
    }

    #[test]
    fn test_workspace_config_yaml() {
        let yaml = "trunkBranch: develop\nrebaseSiblings: true\n";
        let config: WorkspaceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.trunk_branch.as_deref(), Some("develop"));
        assert_eq!(config.rebase_siblings, Some(true));
    }

    #[test]
    fn test_resolved_defaults() {
        let config = ResolvedConfig::default();
        assert_eq!(config.trunk_branch, "main");
        assert_eq!(config.activity_config().idle_timeout, Duration::from_secs(300));
        assert_eq!(config.activity_config().hard_cap, Duration::from_secs(1800));
        assert_eq!(config.breaker_config().failure_threshold, 3);
        assert_eq!(config.remote.base_url, DEFAULT_REMOTE_URL);
    }
}
