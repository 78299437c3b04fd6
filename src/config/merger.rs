// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Handles merging configurations from different sources with proper precedence.

use std::path::PathBuf;

use super::types::{ResolvedConfig, WorkspaceConfig};

/// CLI options that can override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub coding_agent: Option<String>,
    pub database_path: Option<PathBuf>,
    pub trunk_branch: Option<String>,
    pub idle_timeout_ms: Option<u64>,
    pub hard_cap_ms: Option<u64>,
    pub remote_url: Option<String>,
}

/// Default configuration values.
pub fn default_config() -> ResolvedConfig {
    ResolvedConfig::default()
}

/// Merge multiple configurations with precedence.
///
/// Precedence (highest to lowest):
/// 1. CLI options
/// 2. Local config (.foreman.local.json)
/// 3. Workspace config (.foreman.json)
/// 4. Global config (~/.foreman/config.json)
/// 5. Default values
pub fn merge_config(
    global: Option<WorkspaceConfig>,
    workspace: Option<WorkspaceConfig>,
    local: Option<WorkspaceConfig>,
    cli: CliOptions,
) -> ResolvedConfig {
    let mut result = default_config();

    for config in [global, workspace, local].into_iter().flatten() {
        apply_workspace_config(&mut result, config);
    }

    apply_cli_options(&mut result, cli);

    result
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn set_opt<T>(target: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *target = value;
    }
}

fn apply_workspace_config(result: &mut ResolvedConfig, config: WorkspaceConfig) {
    set_opt(&mut result.provider, config.provider);
    set_opt(&mut result.model, config.model);
    set_opt(&mut result.coding_agent, config.coding_agent);
    set_opt(&mut result.database_path, config.database_path);
    set_opt(&mut result.worktree_root, config.worktree_root);
    set(&mut result.trunk_branch, config.trunk_branch);
    set(&mut result.idle_timeout_ms, config.idle_timeout_ms);
    set(&mut result.hard_cap_ms, config.hard_cap_ms);
    set(&mut result.poll_interval_ms, config.poll_interval_ms);
    set(&mut result.git_timeout_ms, config.git_timeout_ms);
    set(&mut result.kill_grace_ms, config.kill_grace_ms);
    set(&mut result.replay_buffer_bytes, config.replay_buffer_bytes);
    set(&mut result.max_turns, config.max_turns);
    set(&mut result.rebase_siblings, config.rebase_siblings);
    set_opt(&mut result.charter, config.charter);
    set_opt(&mut result.system_prompt, config.system_prompt);

    if let Some(breaker) = config.breaker {
        set(&mut result.breaker_failure_threshold, breaker.failure_threshold);
        set(&mut result.breaker_reset_timeout_ms, breaker.reset_timeout_ms);
    }

    if let Some(remote) = config.remote {
        result.remote = remote;
    }

    if let Some(backends) = config.pty_backends {
        // Later sources override per agent type.
        result.pty_backends.extend(backends);
    }
}

fn apply_cli_options(result: &mut ResolvedConfig, cli: CliOptions) {
    set_opt(&mut result.provider, cli.provider);
    set_opt(&mut result.model, cli.model);
    set_opt(&mut result.coding_agent, cli.coding_agent);
    set_opt(&mut result.database_path, cli.database_path);
    set(&mut result.trunk_branch, cli.trunk_branch);
    set(&mut result.idle_timeout_ms, cli.idle_timeout_ms);
    set(&mut result.hard_cap_ms, cli.hard_cap_ms);
    set(&mut result.remote.base_url, cli.remote_url);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{BreakerConfigPartial, PtyBackendConfig};
    use std::collections::HashMap;

    #[test]
    fn test_precedence() {
        let global = WorkspaceConfig {
            coding_agent: Some("codex".into()),
            idle_timeout_ms: Some(1_000),
            max_turns: Some(2),
            ..Default::default()
        };
        let workspace = WorkspaceConfig {
            coding_agent: Some("opencode".into()),
            ..Default::default()
        };
        let local = WorkspaceConfig {
            idle_timeout_ms: Some(2_000),
            ..Default::default()
        };
        let cli = CliOptions {
            hard_cap_ms: Some(9_000),
            ..Default::default()
        };

        let config = merge_config(Some(global), Some(workspace), Some(local), cli);
        assert_eq!(config.coding_agent.as_deref(), Some("opencode"));
        assert_eq!(config.idle_timeout_ms, 2_000);
        assert_eq!(config.hard_cap_ms, 9_000);
        assert_eq!(config.max_turns, 2);
        assert_eq!(config.trunk_branch, "main");
    }

    #[test]
    fn test_breaker_partial_merge() {
        let workspace = WorkspaceConfig {
            breaker: Some(BreakerConfigPartial {
                failure_threshold: Some(5),
                reset_timeout_ms: None,
            }),
            ..Default::default()
        };
        let config = merge_config(None, Some(workspace), None, CliOptions::default());
        assert_eq!(config.breaker_failure_threshold, 5);
        assert_eq!(config.breaker_reset_timeout_ms, 60_000);
    }

    #[test]
    fn test_pty_backends_merge_by_key() {
        let backend = |program: &str| PtyBackendConfig {
            program: program.into(),
            ..Default::default()
        };
        let global = WorkspaceConfig {
            pty_backends: Some(HashMap::from([
                ("codex".to_string(), backend("codex")),
                ("gemini".to_string(), backend("gemini")),
            ])),
            ..Default::default()
        };
        let local = WorkspaceConfig {
            pty_backends: Some(HashMap::from([(
                "codex".to_string(),
                backend("/opt/codex/bin/codex"),
            )])),
            ..Default::default()
        };
        let config = merge_config(Some(global), None, Some(local), CliOptions::default());
        assert_eq!(config.pty_backends["codex"].program, "/opt/codex/bin/codex");
        assert_eq!(config.pty_backends["gemini"].program, "gemini");
    }

    #[test]
    fn test_cli_remote_url() {
        let cli = CliOptions {
            remote_url: Some("http://10.0.0.2:4096".into()),
            ..Default::default()
        };
        let config = merge_config(None, None, None, cli);
        assert_eq!(config.remote.base_url, "http://10.0.0.2:4096");
    }
}
