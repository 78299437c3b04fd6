// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent records and lifecycle states.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position of an agent in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Coo,
    TeamLead,
    Worker,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coo => "coo",
            Self::TeamLead => "team_lead",
            Self::Worker => "worker",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "coo" => Some(Self::Coo),
            "team_lead" => Some(Self::TeamLead),
            "worker" => Some(Self::Worker),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an agent.
///
/// ```text
/// Idle ──▶ Busy ──▶ Done ──┐
///  ▲        │              │
///  │        └──▶ Error ────┤
///  └───────────────────────┘   (any) ──▶ Destroyed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Done,
    Error,
    Destroyed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Done => "done",
            Self::Error => "error",
            Self::Destroyed => "destroyed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            "destroyed" => Some(Self::Destroyed),
            _ => None,
        }
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// A finished agent (done or error) may be handed a new directive, which
    /// moves it straight back to busy.
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        match (self, next) {
            (Destroyed, _) => false,
            (_, Destroyed) => true,
            (Idle, Busy) => true,
            (Busy, Done) | (Busy, Error) => true,
            (Done, Idle) | (Error, Idle) => true,
            (Done, Busy) | (Error, Busy) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker specialties that edit code and therefore use a coding agent.
pub const CODING_SPECIALTIES: &[&str] = &[
    "developer",
    "engineer",
    "coder",
    "frontend",
    "backend",
    "fullstack",
    "devops",
    "qa",
    "tester",
];

/// A persisted agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    pub role: AgentRole,
    pub parent_id: Option<String>,
    pub status: AgentStatus,
    pub name: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    /// Repository or directory the agent works in.
    pub workspace_path: Option<PathBuf>,
    pub project_id: Option<String>,
    /// Coding-agent backend type (e.g. `opencode`, `claude-code`).
    pub coding_agent: Option<String>,
    /// Worker specialty; `None` is treated as a general coding worker.
    pub specialty: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    /// New idle agent with a fresh id.
    pub fn new(role: AgentRole, parent_id: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            parent_id: parent_id.map(str::to_string),
            status: AgentStatus::Idle,
            name: None,
            model: None,
            provider: None,
            workspace_path: None,
            project_id: None,
            coding_agent: None,
            specialty: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_workspace(mut self, path: impl Into<PathBuf>) -> Self {
        self.workspace_path = Some(path.into());
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_coding_agent(mut self, agent_type: Option<String>) -> Self {
        self.coding_agent = agent_type;
        self
    }

    pub fn with_specialty(mut self, specialty: impl Into<String>) -> Self {
        self.specialty = Some(specialty.into());
        self
    }

    /// Whether this agent's work is code editing.
    pub fn is_coding_role(&self) -> bool {
        self.role == AgentRole::Worker
            && self
                .specialty
                .as_deref()
                .map(|s| CODING_SPECIALTIES.contains(&s.to_ascii_lowercase().as_str()))
                .unwrap_or(true)
    }

    /// Whether this agent drives a coding-agent backend.
    pub fn is_coding_worker(&self) -> bool {
        self.is_coding_role() && self.coding_agent.is_some()
    }

    /// Display label: the name if set, otherwise the id.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use AgentStatus::*;
        assert!(Idle.can_transition_to(Busy));
        assert!(Busy.can_transition_to(Done));
        assert!(Busy.can_transition_to(Error));
        assert!(Done.can_transition_to(Busy));
        assert!(Error.can_transition_to(Idle));
        assert!(Busy.can_transition_to(Destroyed));

        assert!(!Idle.can_transition_to(Done));
        assert!(!Busy.can_transition_to(Busy));
        assert!(!Destroyed.can_transition_to(Idle));
        assert!(!Destroyed.can_transition_to(Destroyed));
    }

    #[test]
    fn test_coding_role() {
        let worker = AgentRecord::new(AgentRole::Worker, Some("lead"));
        assert!(worker.is_coding_role());
        assert!(!worker.is_coding_worker());

        let coder = worker.clone().with_coding_agent(Some("opencode".into()));
        assert!(coder.is_coding_worker());

        let researcher = coder.with_specialty("researcher");
        assert!(!researcher.is_coding_role());
        assert!(!researcher.is_coding_worker());

        let lead = AgentRecord::new(AgentRole::TeamLead, None);
        assert!(!lead.is_coding_role());
    }

    #[test]
    fn test_role_strings() {
        assert_eq!(AgentRole::parse("team_lead"), Some(AgentRole::TeamLead));
        assert_eq!(AgentStatus::parse("busy"), Some(AgentStatus::Busy));
        assert_eq!(AgentStatus::Destroyed.to_string(), "destroyed");
    }
}
