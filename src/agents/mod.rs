// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent hierarchy.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────┐
//!   Chat ───────▶ │     COO      │  one ConversationContext per conversation
//!                 └──────┬───────┘
//!                        │ Directive          ▲ Report
//!                 ┌──────▼───────┐            │
//!                 │  Team lead   │ ── kanban ─┘   (one per project)
//!                 │ merge queue  │
//!                 └──────┬───────┘
//!                        │ Directive          ▲ Report (exactly one)
//!                 ┌──────▼───────┐            │
//!                 │    Worker    │ ───────────┘   (one per task)
//!                 └──────┬───────┘
//!                        │
//!          coding backend (remote / PTY) or direct LLM
//! ```
//!
//! Every agent is addressed through the [`MessageBus`]; records live in the
//! [`AgentRegistry`] and are persisted in the store.

pub mod coo;
pub mod fallback;
pub mod merge_queue;
pub mod registry;
pub mod team_lead;
pub mod types;
pub mod worker;

use std::sync::Arc;

use crate::breaker::CircuitBreakerRegistry;
use crate::bus::MessageBus;
use crate::coding::{BackendRegistry, HumanResponder, PermissionHandler, SessionEventSink};
use crate::config::ResolvedConfig;
use crate::error::BackendError;
use crate::git::{Git, WorktreeManager, DEFAULT_TRUNK};

pub use coo::{ConversationContext, Coo};
pub use fallback::{DirectLlm, DirectTaskOutcome, DirectTaskRequest, UnconfiguredLlm};
pub use merge_queue::{MergeOutcome, MergeQueue, MergeRequest, MergeResult};
pub use registry::AgentRegistry;
pub use team_lead::{KanbanTask, ProjectSpec, TaskState, TeamLead};
pub use types::{AgentRecord, AgentRole, AgentStatus};
pub use worker::{Worker, WORKER_ERROR_MARKER};

/// Behaviour knobs shared by every agent.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub trunk_branch: String,
    /// Agent type used when a worker record names none.
    pub default_coding_agent: Option<String>,
    pub rebase_siblings: bool,
    /// Organisation charter injected into COO prompts.
    pub charter: Option<String>,
    pub system_prompt: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            trunk_branch: DEFAULT_TRUNK.to_string(),
            default_coding_agent: None,
            rebase_siblings: false,
            charter: None,
            system_prompt: None,
        }
    }
}

/// Everything an agent needs to do its work.
pub struct AgentServices {
    pub bus: MessageBus,
    pub registry: Arc<AgentRegistry>,
    pub backends: BackendRegistry,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub fallback: Arc<dyn DirectLlm>,
    pub worktrees: Arc<WorktreeManager>,
    pub settings: AgentSettings,
    pub human: Option<Arc<dyn HumanResponder>>,
    pub permission: Option<Arc<dyn PermissionHandler>>,
    pub event_sink: Option<SessionEventSink>,
}

impl AgentServices {
    /// Services with no backends, default settings and no direct LLM.
    pub fn new(bus: MessageBus) -> Self {
        Self {
            registry: Arc::new(AgentRegistry::new(bus.clone())),
            bus,
            backends: BackendRegistry::new(),
            breakers: Arc::new(CircuitBreakerRegistry::default()),
            fallback: Arc::new(UnconfiguredLlm),
            worktrees: Arc::new(WorktreeManager::new(Git::default(), None)),
            settings: AgentSettings::default(),
            human: None,
            permission: None,
            event_sink: None,
        }
    }

    /// Services wired from resolved configuration.
    pub fn from_config(bus: MessageBus, config: &ResolvedConfig) -> Result<Self, BackendError> {
        let git = Git::new(config.git_timeout());
        Ok(Self {
            backends: BackendRegistry::from_config(config)?,
            breakers: Arc::new(CircuitBreakerRegistry::new(config.breaker_config())),
            worktrees: Arc::new(WorktreeManager::new(git, config.worktree_root.clone())),
            settings: AgentSettings {
                trunk_branch: config.trunk_branch.clone(),
                default_coding_agent: config.coding_agent.clone(),
                rebase_siblings: config.rebase_siblings,
                charter: config.charter.clone(),
                system_prompt: config.system_prompt.clone(),
            },
            ..Self::new(bus)
        })
    }

    pub fn with_backends(mut self, backends: BackendRegistry) -> Self {
        self.backends = backends;
        self
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn DirectLlm>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_worktrees(mut self, worktrees: WorktreeManager) -> Self {
        self.worktrees = Arc::new(worktrees);
        self
    }

    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_human(mut self, human: Arc<dyn HumanResponder>) -> Self {
        self.human = Some(human);
        self
    }

    pub fn with_permission(mut self, permission: Arc<dyn PermissionHandler>) -> Self {
        self.permission = Some(permission);
        self
    }

    pub fn with_event_sink(mut self, sink: SessionEventSink) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Git runner shared with the worktree manager.
    pub fn git(&self) -> &Git {
        self.worktrees.git()
    }
}
