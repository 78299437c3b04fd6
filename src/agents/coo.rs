// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Root agent.
//!
//! The COO keeps one [`ConversationContext`] per conversation, routes work to
//! per-project team leads and relays their reports back to the conversation.
//! After a restart it can rebuild a team lead from persisted history with
//! [`Coo::build_recovery_directive`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::bus::{BusMessage, HistoryFilter, MessageHandler, MessageType};
use crate::error::AgentError;

use super::team_lead::{ProjectSpec, TeamLead};
use super::types::{AgentRecord, AgentRole};
use super::AgentServices;

/// Prompt used when no system prompt is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are the COO of a software organisation. \
Break the user's goals into project tasks, delegate them to team leads and report results back concisely.";

const HISTORY_PAGE: usize = 100;

/// Per-conversation state.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationContext {
    pub conversation_id: String,
    pub system_prompt: String,
    /// Messages of the conversation, oldest first.
    pub history: Vec<BusMessage>,
}

impl ConversationContext {
    /// Add a message unless it is already recorded.
    pub fn observe(&mut self, message: &BusMessage) {
        if !self.history.iter().any(|m| m.id == message.id) {
            self.history.push(message.clone());
        }
    }

    /// Plain-text transcript of the conversation.
    pub fn transcript(&self) -> String {
        self.history
            .iter()
            .map(|m| {
                let speaker = m.from_agent_id.as_deref().unwrap_or("user");
                format!("[{}] {}: {}", m.message_type, speaker, m.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// System prompt with the charter appended.
pub fn compose_system_prompt(base: Option<&str>, charter: Option<&str>) -> String {
    let mut prompt = base.unwrap_or(DEFAULT_SYSTEM_PROMPT).trim().to_string();
    if let Some(charter) = charter.map(str::trim).filter(|c| !c.is_empty()) {
        prompt.push_str("\n\n## Organisation charter\n");
        prompt.push_str(charter);
    }
    prompt
}

/// The root agent.
pub struct Coo {
    id: String,
    services: Arc<AgentServices>,
    contexts: Mutex<HashMap<String, ConversationContext>>,
    projects: RwLock<HashMap<String, ProjectSpec>>,
    leads: RwLock<HashMap<String, Arc<TeamLead>>>,
}

impl Coo {
    pub fn new(services: Arc<AgentServices>, record: &AgentRecord) -> Self {
        Self {
            id: record.id.clone(),
            services,
            contexts: Mutex::new(HashMap::new()),
            projects: RwLock::new(HashMap::new()),
            leads: RwLock::new(HashMap::new()),
        }
    }

    /// Create the COO and start its inbox loop. Must run inside a tokio
    /// runtime.
    pub fn spawn(services: Arc<AgentServices>, record: &AgentRecord) -> Arc<Self> {
        let coo = Arc::new(Self::new(services, record));
        let (tx, mut rx) = mpsc::unbounded_channel::<BusMessage>();
        let handler: MessageHandler = Arc::new(move |message: BusMessage| {
            let _ = tx.send(message);
        });
        coo.services.bus.subscribe(&coo.id, handler);

        let inbox = coo.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = inbox.handle_message(message).await {
                    warn!(coo = %inbox.id, "Message handling failed: {}", e);
                }
            }
        });
        coo
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn leads(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<TeamLead>>> {
        self.leads.read().unwrap_or_else(|e| e.into_inner())
    }

    fn leads_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<TeamLead>>> {
        self.leads.write().unwrap_or_else(|e| e.into_inner())
    }

    fn projects(&self) -> RwLockReadGuard<'_, HashMap<String, ProjectSpec>> {
        self.projects.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Team lead for a project.
    pub fn team_lead(&self, project_id: &str) -> Option<Arc<TeamLead>> {
        self.leads().get(project_id).cloned()
    }

    /// Registered project ids, sorted.
    pub fn project_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.projects().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Context for a conversation, built from history on first use.
    pub async fn context(&self, conversation_id: &str) -> Result<ConversationContext, AgentError> {
        let mut contexts = self.contexts.lock().await;
        if let Some(context) = contexts.get(conversation_id) {
            return Ok(context.clone());
        }
        let context = self.load_context(conversation_id)?;
        contexts.insert(conversation_id.to_string(), context.clone());
        Ok(context)
    }

    fn load_context(&self, conversation_id: &str) -> Result<ConversationContext, AgentError> {
        let mut history = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.services.bus.get_history(
                &HistoryFilter::conversation(conversation_id)
                    .with_limit(HISTORY_PAGE)
                    .with_offset(offset),
            )?;
            offset += page.messages.len();
            history.extend(page.messages);
            if !page.has_more {
                break;
            }
        }
        debug!(conversation_id, replayed = history.len(), "Conversation context loaded");

        let settings = &self.services.settings;
        Ok(ConversationContext {
            conversation_id: conversation_id.to_string(),
            system_prompt: compose_system_prompt(
                settings.system_prompt.as_deref(),
                settings.charter.as_deref(),
            ),
            history,
        })
    }

    async fn observe(&self, message: &BusMessage) -> Result<(), AgentError> {
        let Some(conversation_id) = message.conversation_id.as_deref() else {
            return Ok(());
        };
        let mut contexts = self.contexts.lock().await;
        match contexts.get_mut(conversation_id) {
            Some(context) => context.observe(message),
            None => {
                // Persisted before delivery, so the replay already has it.
                let context = self.load_context(conversation_id)?;
                contexts.insert(conversation_id.to_string(), context);
            }
        }
        Ok(())
    }

    /// Create a team lead for a project.
    pub fn register_project(&self, project: ProjectSpec) -> Result<Arc<TeamLead>, AgentError> {
        if let Some(lead) = self.team_lead(&project.project_id) {
            return Ok(lead);
        }
        let record = self.services.registry.create(
            AgentRecord::new(AgentRole::TeamLead, Some(&self.id))
                .with_name(format!("{}-lead", project.project_id))
                .with_project(project.project_id.clone())
                .with_workspace(project.repo_path.clone())
                .with_model(project.model.clone())
                .with_coding_agent(project.coding_agent.clone()),
        )?;
        info!(project_id = %project.project_id, team_lead = %record.id, "Project registered");

        let lead = TeamLead::spawn(self.services.clone(), &record, project.clone());
        self.projects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(project.project_id.clone(), project.clone());
        self.leads_mut().insert(project.project_id, lead.clone());
        Ok(lead)
    }

    /// Send a task to a project's team lead. `blocked_by` names earlier
    /// directive ids of the same project.
    pub async fn route_directive(
        &self,
        project_id: &str,
        content: &str,
        conversation_id: Option<&str>,
        blocked_by: &[String],
    ) -> Result<BusMessage, AgentError> {
        let lead = self
            .team_lead(project_id)
            .ok_or_else(|| AgentError::NotFound(format!("project {}", project_id)))?;
        let mut directive = BusMessage::directive(Some(&self.id), lead.id(), content)
            .with_conversation(conversation_id)
            .with_metadata("projectId", json!(project_id));
        if !blocked_by.is_empty() {
            directive = directive.with_metadata("blockedBy", json!(blocked_by));
        }
        let sent = self.services.bus.send(directive)?;
        self.observe(&sent).await?;
        debug!(project_id, directive_id = %sent.id, "Directive routed");
        Ok(sent)
    }

    /// Handle one inbox message.
    pub async fn handle_message(&self, message: BusMessage) -> Result<(), AgentError> {
        self.observe(&message).await?;
        match message.message_type {
            MessageType::Chat => self.on_chat(&message).await,
            MessageType::Report => self.on_report(&message).await,
            _ => Ok(()),
        }
    }

    async fn on_chat(&self, message: &BusMessage) -> Result<(), AgentError> {
        let project_id = match message.metadata_str("projectId") {
            Some(id) => Some(id.to_string()),
            None => {
                let ids = self.project_ids();
                (ids.len() == 1).then(|| ids[0].clone())
            }
        };
        match project_id {
            Some(project_id) => {
                let blocked_by: Vec<String> = message
                    .metadata
                    .get("blockedBy")
                    .and_then(Value::as_array)
                    .map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
                    .unwrap_or_default();
                self.route_directive(
                    &project_id,
                    &message.content,
                    message.conversation_id.as_deref(),
                    &blocked_by,
                )
                .await?;
            }
            None => {
                let reply = format!(
                    "Which project should handle this? Known projects: {}",
                    if self.project_ids().is_empty() {
                        "none".to_string()
                    } else {
                        self.project_ids().join(", ")
                    }
                );
                self.reply(message, reply, None).await?;
            }
        }
        Ok(())
    }

    async fn on_report(&self, report: &BusMessage) -> Result<(), AgentError> {
        let Some(from) = report.from_agent_id.as_deref() else {
            return Ok(());
        };
        let project_id = self
            .leads()
            .iter()
            .find(|(_, lead)| lead.id() == from)
            .map(|(project, _)| project.clone());
        let Some(project_id) = project_id else {
            debug!(from, "Report from unknown agent");
            return Ok(());
        };
        self.reply(report, report.content.clone(), Some(&project_id))
            .await
    }

    /// Broadcast a chat into the message's conversation.
    async fn reply(
        &self,
        cause: &BusMessage,
        content: String,
        project_id: Option<&str>,
    ) -> Result<(), AgentError> {
        let mut chat = BusMessage::chat(Some(&self.id), None, content)
            .with_conversation(cause.conversation_id.as_deref());
        if let Some(project_id) = project_id {
            chat = chat.with_metadata("projectId", json!(project_id));
        }
        for key in ["taskId", "success"] {
            if let Some(value) = cause.metadata.get(key) {
                chat = chat.with_metadata(key, value.clone());
            }
        }
        let sent = self.services.bus.send(chat)?;
        self.observe(&sent).await
    }

    /// Directives sent to a team lead that it has not yet reported on.
    fn open_directives(&self, team_lead_id: &str) -> Result<Vec<BusMessage>, AgentError> {
        let mut messages = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.services.bus.get_history(
                &HistoryFilter::agent(team_lead_id)
                    .with_limit(HISTORY_PAGE)
                    .with_offset(offset),
            )?;
            offset += page.messages.len();
            messages.extend(page.messages);
            if !page.has_more {
                break;
            }
        }

        let answered: HashSet<&str> = messages
            .iter()
            .filter(|m| {
                m.message_type == MessageType::Report
                    && m.from_agent_id.as_deref() == Some(team_lead_id)
            })
            .filter_map(|m| m.correlation_id.as_deref())
            .collect();
        Ok(messages
            .iter()
            .filter(|m| {
                m.message_type == MessageType::Directive
                    && m.to_agent_id.as_deref() == Some(team_lead_id)
                    && m.metadata_bool("recovery") != Some(true)
                    && !answered.contains(m.id.as_str())
            })
            .cloned()
            .collect())
    }

    /// Instructions that rebuild a team lead's context: project, repository,
    /// trunk, rules and charter, and the tasks still open.
    pub fn build_recovery_directive(&self, team_lead_id: &str) -> Result<String, AgentError> {
        let record = self
            .services
            .registry
            .get(team_lead_id)
            .ok_or_else(|| AgentError::NotFound(team_lead_id.to_string()))?;
        let project_id = record.project_id.clone().unwrap_or_default();
        let project = self.projects().get(&project_id).cloned();

        let repo = project
            .as_ref()
            .map(|p| p.repo_path.clone())
            .or(record.workspace_path.clone());
        let trunk = project
            .as_ref()
            .map(|p| p.trunk_branch.clone())
            .unwrap_or_else(|| self.services.settings.trunk_branch.clone());

        let mut out = String::from("# Recovery\n\nYou are resuming as team lead after a restart.\n\n");
        out.push_str(&format!("Project: {}\n", project_id));
        out.push_str(&format!(
            "Repository: {}\n",
            repo.map(|r| r.display().to_string())
                .unwrap_or_else(|| "(none)".to_string())
        ));
        out.push_str(&format!("Trunk branch: {}\n", trunk));
        if let Some(agent) = record.coding_agent.as_deref() {
            out.push_str(&format!("Coding agent: {}\n", agent));
        }

        if let Some(rules) = project.as_ref().and_then(|p| p.rules.as_deref()) {
            out.push_str("\n## Project rules\n");
            out.push_str(rules.trim());
            out.push('\n');
        }
        if let Some(charter) = self.services.settings.charter.as_deref() {
            out.push_str("\n## Organisation charter\n");
            out.push_str(charter.trim());
            out.push('\n');
        }

        let open = self.open_directives(team_lead_id)?;
        out.push_str("\n## Open tasks\n");
        if open.is_empty() {
            out.push_str("(none)\n");
        }
        for directive in &open {
            out.push_str(&format!("- [{}] {}\n", directive.id, first_line(&directive.content)));
        }
        Ok(out)
    }

    /// Send the recovery directive, carrying the open tasks as metadata so
    /// the team lead can put them back on its board.
    pub fn recover_team_lead(&self, team_lead_id: &str) -> Result<BusMessage, AgentError> {
        let content = self.build_recovery_directive(team_lead_id)?;
        let open: Vec<Value> = self
            .open_directives(team_lead_id)?
            .into_iter()
            .map(|d| {
                json!({
                    "id": d.id,
                    "description": d.content,
                    "blockedBy": d.metadata.get("blockedBy").cloned().unwrap_or(json!([])),
                })
            })
            .collect();
        info!(team_lead = team_lead_id, open = open.len(), "Recovering team lead");
        Ok(self.services.bus.send(
            BusMessage::directive(Some(&self.id), team_lead_id, content)
                .with_metadata("recovery", json!(true))
                .with_metadata("openTasks", Value::Array(open)),
        )?)
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default().trim()
}
