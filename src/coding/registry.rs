// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Backend selection by agent type.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::ResolvedConfig;
use crate::error::BackendError;
use crate::git::Git;

use super::pty::{flavour_defaults, PtyBackend, PtySettings};
use super::remote::{RemoteBackend, RemoteSettings, REMOTE_AGENT_TYPE};
use super::types::CodingBackend;

/// Agent types with built-in PTY invocations.
pub const PTY_FLAVOURS: &[&str] = &["claude-code", "codex", "gemini"];

/// How a backend talks to its agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Remote,
    Pty,
}

/// Static mapping from agent type to backend kind.
pub fn backend_kind_for(agent_type: &str) -> Option<BackendKind> {
    match agent_type {
        REMOTE_AGENT_TYPE => Some(BackendKind::Remote),
        t if PTY_FLAVOURS.contains(&t) => Some(BackendKind::Pty),
        _ => None,
    }
}

/// Coding backends keyed by agent type.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn CodingBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every backend the configuration describes.
    pub fn from_config(config: &ResolvedConfig) -> Result<Self, BackendError> {
        let git = Git::new(config.git_timeout());
        let mut registry = Self::new();

        registry.register(Arc::new(RemoteBackend::new(
            &config.remote,
            RemoteSettings {
                activity: config.activity_config(),
                max_turns: config.max_turns,
                git: git.clone(),
            },
        )?));

        let pty_settings = PtySettings {
            activity: config.activity_config(),
            kill_grace: config.kill_grace(),
            replay_bytes: config.replay_buffer_bytes,
            git,
        };
        for flavour in PTY_FLAVOURS {
            let backend_config = config
                .pty_backends
                .get(*flavour)
                .cloned()
                .or_else(|| flavour_defaults(flavour));
            if let Some(backend_config) = backend_config {
                registry.register(Arc::new(PtyBackend::new(
                    *flavour,
                    backend_config,
                    pty_settings.clone(),
                )));
            }
        }
        // Extra CLIs declared in config run as PTY backends too.
        for (agent_type, backend_config) in &config.pty_backends {
            if !registry.backends.contains_key(agent_type) {
                registry.register(Arc::new(PtyBackend::new(
                    agent_type.clone(),
                    backend_config.clone(),
                    pty_settings.clone(),
                )));
            }
        }
        Ok(registry)
    }

    /// Add or replace the backend for its agent type.
    pub fn register(&mut self, backend: Arc<dyn CodingBackend>) {
        let agent_type = backend.agent_type().to_string();
        debug!(agent_type = %agent_type, "Registered coding backend");
        self.backends.insert(agent_type, backend);
    }

    pub fn get(&self, agent_type: &str) -> Option<Arc<dyn CodingBackend>> {
        self.backends.get(agent_type).cloned()
    }

    /// Registered agent types, sorted.
    pub fn agent_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.backends.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("agent_types", &self.agent_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PtyBackendConfig;

    #[test]
    fn test_static_mapping() {
        assert_eq!(backend_kind_for("opencode"), Some(BackendKind::Remote));
        assert_eq!(backend_kind_for("claude-code"), Some(BackendKind::Pty));
        assert_eq!(backend_kind_for("codex"), Some(BackendKind::Pty));
        assert_eq!(backend_kind_for("gemini"), Some(BackendKind::Pty));
        assert_eq!(backend_kind_for("aider"), None);
    }

    #[test]
    fn test_from_default_config() {
        let registry = BackendRegistry::from_config(&ResolvedConfig::default()).unwrap();
        assert_eq!(
            registry.agent_types(),
            vec!["claude-code", "codex", "gemini", "opencode"]
        );
        assert!(registry.get("opencode").is_some());
        assert!(registry.get("aider").is_none());
    }

    #[test]
    fn test_config_overrides_and_extends() {
        let mut config = ResolvedConfig::default();
        config.pty_backends.insert(
            "codex".into(),
            PtyBackendConfig {
                program: "/opt/codex".into(),
                ..Default::default()
            },
        );
        config.pty_backends.insert(
            "aider".into(),
            PtyBackendConfig {
                program: "aider".into(),
                ..Default::default()
            },
        );
        let registry = BackendRegistry::from_config(&config).unwrap();
        assert_eq!(registry.len(), 5);
        assert_eq!(registry.get("aider").unwrap().agent_type(), "aider");
    }

    #[test]
    fn test_empty_serve_command_rejected() {
        let mut config = ResolvedConfig::default();
        config.remote.serve_command = Some(vec![]);
        assert!(BackendRegistry::from_config(&config).is_err());
    }
}
