// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Direct-LLM execution path.
//!
//! Workers use this when no coding agent can take the task: the role is not a
//! coding role, the backend is unconfigured or not ready, or its circuit is
//! open. The tool-use loop itself lives behind [`DirectLlm`].

use std::path::PathBuf;

use async_trait::async_trait;

use crate::coding::TokenUsage;
use crate::error::AgentError;

/// Task handed to the direct-LLM loop.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectTaskRequest {
    pub agent_id: String,
    pub task: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub workspace: Option<PathBuf>,
}

/// Result of a direct-LLM run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectTaskOutcome {
    pub summary: String,
    pub usage: Option<TokenUsage>,
}

/// Generic tool-use loop against an LLM provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectLlm: Send + Sync {
    async fn run_task(&self, request: DirectTaskRequest) -> Result<DirectTaskOutcome, AgentError>;
}

/// Stand-in used when no provider is wired up; every task fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredLlm;

#[async_trait]
impl DirectLlm for UnconfiguredLlm {
    async fn run_task(&self, request: DirectTaskRequest) -> Result<DirectTaskOutcome, AgentError> {
        Err(AgentError::Fallback(format!(
            "no coding agent available for {} and no direct LLM provider is configured",
            request.agent_id
        )))
    }
}
