// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for foreman.
//!
//! Handles loading, merging, and validation of configuration from multiple sources:
//! - Global config: ~/.foreman/config.json
//! - Workspace config: .foreman.json, .foreman/config.json, or foreman.config.json
//! - Local config: .foreman.local.json (gitignored, for personal overrides)
//! - CLI options: command-line arguments
//!
//! Configuration is merged with precedence (CLI > local > workspace > global > defaults).

mod loader;
mod merger;
mod types;

pub use loader::{
    find_workspace_root, get_global_config_dir, get_global_config_path, load_config_file,
    load_global_config, load_local_config, load_workspace_config, CONFIG_FILES, GLOBAL_CONFIG_DIR,
    GLOBAL_CONFIG_FILE, LOCAL_CONFIG_FILE,
};

pub use merger::{default_config, merge_config, CliOptions};

pub use types::{
    BreakerConfigPartial, PtyBackendConfig, RemoteServerConfig, ResolvedConfig, WorkspaceConfig,
    DEFAULT_REMOTE_URL,
};

use crate::error::ConfigError;
use std::path::Path;

/// Load and merge all configuration sources for a workspace.
///
/// This is the main entry point for configuration loading.
pub fn load_config(
    workspace_root: &Path,
    cli_options: CliOptions,
) -> Result<ResolvedConfig, ConfigError> {
    let global = load_global_config()?;
    let workspace = load_workspace_config(workspace_root)?;
    let local = load_local_config(workspace_root)?;

    let config = merge_config(global, workspace, local, cli_options);
    validate(&config)?;
    Ok(config)
}

/// Reject values that would make the runtime misbehave.
pub fn validate(config: &ResolvedConfig) -> Result<(), ConfigError> {
    let invalid = |field: &str, message: &str| ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    };
    if config.idle_timeout_ms == 0 {
        return Err(invalid("idleTimeoutMs", "must be greater than zero"));
    }
    if config.hard_cap_ms < config.idle_timeout_ms {
        return Err(invalid("hardCapMs", "must not be shorter than idleTimeoutMs"));
    }
    if config.poll_interval_ms == 0 {
        return Err(invalid("pollIntervalMs", "must be greater than zero"));
    }
    if config.breaker_failure_threshold == 0 {
        return Err(invalid("breaker.failureThreshold", "must be at least 1"));
    }
    if config.trunk_branch.trim().is_empty() {
        return Err(invalid("trunkBranch", "must not be empty"));
    }
    for (agent_type, backend) in &config.pty_backends {
        if backend.program.trim().is_empty() {
            return Err(invalid(
                &format!("ptyBackends.{}.program", agent_type),
                "must not be empty",
            ));
        }
    }
    Ok(())
}
