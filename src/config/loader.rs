// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Reading config layers from disk.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

use super::types::WorkspaceConfig;

/// Workspace config file names, first match wins.
pub const CONFIG_FILES: &[&str] = &[
    ".foreman.json",
    ".foreman/config.json",
    ".foreman/config.yaml",
    "foreman.config.json",
    "foreman.config.yaml",
];

pub const LOCAL_CONFIG_FILE: &str = ".foreman.local.json";

pub const GLOBAL_CONFIG_DIR: &str = ".foreman";

pub const GLOBAL_CONFIG_FILE: &str = "config.json";

/// `~/.foreman`, where the global config lives.
pub fn get_global_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(GLOBAL_CONFIG_DIR))
}

pub fn get_global_config_path() -> Option<PathBuf> {
    get_global_config_dir().map(|dir| dir.join(GLOBAL_CONFIG_FILE))
}

/// Parse `path` if it exists.
fn load_if_present(path: &Path) -> Result<Option<WorkspaceConfig>, ConfigError> {
    if path.is_file() {
        load_config_file(path).map(Some)
    } else {
        Ok(None)
    }
}

/// Global layer, shared by every workspace on this machine.
pub fn load_global_config() -> Result<Option<WorkspaceConfig>, ConfigError> {
    match get_global_config_path() {
        Some(path) => load_if_present(&path),
        None => Ok(None),
    }
}

/// Workspace layer: the first of [`CONFIG_FILES`] present under the root.
pub fn load_workspace_config(workspace_root: &Path) -> Result<Option<WorkspaceConfig>, ConfigError> {
    CONFIG_FILES
        .iter()
        .map(|name| workspace_root.join(name))
        .find(|path| path.is_file())
        .map_or(Ok(None), |path| load_config_file(&path).map(Some))
}

/// Uncommitted per-checkout overrides.
pub fn load_local_config(workspace_root: &Path) -> Result<Option<WorkspaceConfig>, ConfigError> {
    load_if_present(&workspace_root.join(LOCAL_CONFIG_FILE))
}

/// Parse one config file; `.yaml`/`.yml` as YAML, anything else as JSON.
pub fn load_config_file(path: &Path) -> Result<WorkspaceConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("yaml" | "yml")
    );
    if is_yaml {
        Ok(serde_yaml::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(&content)?)
    }
}

/// Find the workspace root by searching for config files or a `.git` entry.
///
/// Walks up the directory tree from `start`.
pub fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| {
            dir.join(".git").exists() || CONFIG_FILES.iter().any(|name| dir.join(name).exists())
        })
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_global_config_dir() {
        let dir = get_global_config_dir();
        assert!(dir.is_some());
        assert!(dir.unwrap().ends_with(".foreman"));
    }

    #[test]
    fn test_load_workspace_config_not_found() {
        let temp = TempDir::new().unwrap();
        let result = load_workspace_config(temp.path()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_load_workspace_config_json() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".foreman.json"),
            r#"{"codingAgent": "opencode", "maxTurns": 3}"#,
        )
        .unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(config.coding_agent.as_deref(), Some("opencode"));
        assert_eq!(config.max_turns, Some(3));
    }

    #[test]
    fn test_load_workspace_config_yaml() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join(".foreman")).unwrap();
        std::fs::write(
            temp.path().join(".foreman").join("config.yaml"),
            "codingAgent: gemini\ntrunkBranch: develop\n",
        )
        .unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(config.coding_agent.as_deref(), Some("gemini"));
        assert_eq!(config.trunk_branch.as_deref(), Some("develop"));
    }

    #[test]
    fn test_invalid_json_is_error() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(".foreman.json"), "{not json").unwrap();
        assert!(matches!(
            load_workspace_config(temp.path()),
            Err(ConfigError::JsonError(_))
        ));
    }

    #[test]
    fn test_find_workspace_root() {
        let temp = TempDir::new().unwrap();
        let subdir = temp.path().join("a").join("b");
        std::fs::create_dir_all(&subdir).unwrap();
        std::fs::write(temp.path().join(".foreman.json"), "{}").unwrap();

        assert_eq!(find_workspace_root(&subdir).unwrap(), temp.path());
    }
}
