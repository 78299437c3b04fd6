// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Live agent records, persisted through the bus store.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::bus::{BusMessage, MessageBus};
use crate::error::AgentError;

use super::types::{AgentRecord, AgentStatus};

/// Owns the agent hierarchy: creation, status transitions and destruction.
pub struct AgentRegistry {
    bus: MessageBus,
    agents: RwLock<HashMap<String, AgentRecord>>,
}

impl AgentRegistry {
    pub fn new(bus: MessageBus) -> Self {
        Self {
            bus,
            agents: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, AgentRecord>> {
        self.agents.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, AgentRecord>> {
        self.agents.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Load persisted agents that were not destroyed. Returns how many.
    pub fn load_from_store(&self) -> Result<usize, AgentError> {
        let records = self.bus.store().list_agents()?;
        let mut agents = self.write();
        let mut loaded = 0;
        for record in records {
            if record.status != AgentStatus::Destroyed {
                agents.insert(record.id.clone(), record);
                loaded += 1;
            }
        }
        debug!(loaded, "Loaded agents from store");
        Ok(loaded)
    }

    /// Register and persist a new agent.
    pub fn create(&self, record: AgentRecord) -> Result<AgentRecord, AgentError> {
        self.bus.store().upsert_agent(&record)?;
        info!(
            agent_id = %record.id,
            role = %record.role,
            parent = ?record.parent_id,
            "Agent created"
        );
        self.write().insert(record.id.clone(), record.clone());
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Option<AgentRecord> {
        self.read().get(id).cloned()
    }

    /// Direct children, oldest first.
    pub fn children(&self, id: &str) -> Vec<AgentRecord> {
        let mut children: Vec<AgentRecord> = self
            .read()
            .values()
            .filter(|a| a.parent_id.as_deref() == Some(id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        children
    }

    pub fn list(&self) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self.read().values().cloned().collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        agents
    }

    /// Apply a validated status transition.
    pub fn set_status(&self, id: &str, next: AgentStatus) -> Result<AgentRecord, AgentError> {
        let mut agents = self.write();
        let record = agents
            .get_mut(id)
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
        Self::transition(record, next)?;
        self.bus.store().upsert_agent(record)?;
        Ok(record.clone())
    }

    fn transition(record: &mut AgentRecord, next: AgentStatus) -> Result<(), AgentError> {
        if !record.status.can_transition_to(next) {
            return Err(AgentError::InvalidTransition {
                agent_id: record.id.clone(),
                from: record.status.to_string(),
                to: next.to_string(),
            });
        }
        debug!(agent_id = %record.id, from = %record.status, to = %next, "Status change");
        record.status = next;
        record.updated_at = Utc::now();
        Ok(())
    }

    /// Move an agent to busy for a new task.
    ///
    /// For coding workers the check and the transition happen under one
    /// lock: a second coding worker in the same project is refused with
    /// [`AgentError::ProjectBusy`].
    pub fn begin_task(&self, id: &str) -> Result<AgentRecord, AgentError> {
        let mut agents = self.write();
        let candidate = agents
            .get(id)
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;

        if candidate.is_coding_worker() {
            if let Some(project_id) = candidate.project_id.as_deref() {
                if let Some(busy) = Self::find_busy_coding_worker(&agents, project_id) {
                    if busy.id != id {
                        return Err(AgentError::ProjectBusy {
                            project_id: project_id.to_string(),
                            worker_id: busy.id.clone(),
                        });
                    }
                }
            }
        }

        let record = agents
            .get_mut(id)
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
        Self::transition(record, AgentStatus::Busy)?;
        self.bus.store().upsert_agent(record)?;
        Ok(record.clone())
    }

    fn find_busy_coding_worker<'a>(
        agents: &'a HashMap<String, AgentRecord>,
        project_id: &str,
    ) -> Option<&'a AgentRecord> {
        agents.values().find(|a| {
            a.status == AgentStatus::Busy
                && a.is_coding_worker()
                && a.project_id.as_deref() == Some(project_id)
        })
    }

    /// The busy coding worker of a project, if any.
    pub fn busy_coding_worker(&self, project_id: &str) -> Option<AgentRecord> {
        Self::find_busy_coding_worker(&self.read(), project_id).cloned()
    }

    /// Destroy an agent and all of its descendants, deepest first.
    ///
    /// Each destroyed agent is unsubscribed from the bus and announced with
    /// a broadcast status message. Returns the destroyed ids.
    pub fn destroy(&self, id: &str) -> Result<Vec<String>, AgentError> {
        if self.get(id).is_none() {
            return Err(AgentError::NotFound(id.to_string()));
        }

        let mut destroyed = Vec::new();
        for child in self.children(id) {
            destroyed.extend(self.destroy(&child.id)?);
        }

        let record = {
            let mut agents = self.write();
            let Some(mut record) = agents.remove(id) else {
                return Ok(destroyed);
            };
            Self::transition(&mut record, AgentStatus::Destroyed)?;
            record
        };
        self.bus.store().upsert_agent(&record)?;
        self.bus.unsubscribe(id);

        let announcement = BusMessage::status(id, format!("{} destroyed", record.label()))
            .with_metadata("agentId", json!(id))
            .with_metadata("role", json!(record.role.as_str()))
            .with_metadata("status", json!(AgentStatus::Destroyed.as_str()));
        if let Err(e) = self.bus.send(announcement) {
            warn!(agent_id = id, "Failed to announce destruction: {}", e);
        }
        info!(agent_id = id, "Agent destroyed");

        destroyed.push(id.to_string());
        Ok(destroyed)
    }
}
