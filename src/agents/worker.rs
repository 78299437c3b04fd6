// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Worker agent: runs one directive at a time and answers with one report.
//!
//! A directive is executed by a coding-agent backend when the worker has a
//! coding role and its backend is configured, ready and not circuit-broken;
//! otherwise by the direct-LLM loop. Whatever happens, the parent receives
//! exactly one [`MessageType::Report`] correlated to the directive.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::bus::{BusMessage, MessageHandler, MessageType};
use crate::coding::{
    CodingAgentClient, CodingAgentTaskResult, CodingBackend, SessionEndStatus, SessionEvent,
    TaskCallbacks, TaskErrorCode,
};
use crate::error::AgentError;
use crate::git::DiffStats;

use super::fallback::DirectTaskRequest;
use super::types::{AgentRecord, AgentStatus};
use super::AgentServices;

/// Prefix of every failure report.
pub const WORKER_ERROR_MARKER: &str = "WORKER ERROR";

/// What ran a task.
#[derive(Debug, Clone)]
struct Execution {
    result: CodingAgentTaskResult,
    /// Coding-agent type, `None` for the direct-LLM path.
    agent_type: Option<String>,
}

/// A worker bound to one agent record.
pub struct Worker {
    id: String,
    services: Arc<AgentServices>,
    current: Mutex<Option<Arc<dyn CodingAgentClient>>>,
}

impl Worker {
    /// Create the worker and subscribe it to its directives.
    ///
    /// Each directive is handled on its own task; the parent is expected
    /// not to send a second directive while the worker is busy.
    pub fn spawn(services: Arc<AgentServices>, record: &AgentRecord) -> Arc<Self> {
        let worker = Arc::new(Self {
            id: record.id.clone(),
            services,
            current: Mutex::new(None),
        });

        let handle = worker.clone();
        let handler: MessageHandler = Arc::new(move |message: BusMessage| {
            if message.message_type != MessageType::Directive {
                debug!(worker_id = %handle.id, kind = %message.message_type, "Ignoring message");
                return;
            }
            let worker = handle.clone();
            tokio::spawn(async move {
                if let Err(e) = worker.handle_message(message).await {
                    warn!(worker_id = %worker.id, "Failed to deliver report: {}", e);
                }
            });
        });
        worker.services.bus.subscribe(&worker.id, handler);
        worker
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn current(&self) -> MutexGuard<'_, Option<Arc<dyn CodingAgentClient>>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a coding-agent task is running.
    pub fn is_running(&self) -> bool {
        self.current().is_some()
    }

    /// Abort the running coding-agent task, if any.
    pub async fn cancel_current(&self) {
        let client = self.current().clone();
        if let Some(client) = client {
            info!(worker_id = %self.id, "Aborting coding task");
            client.abort().await;
        }
    }

    /// Execute a directive and send its report. Returns the sent report.
    ///
    /// Task failures, including a panicking backend, become failure reports;
    /// an error is returned only when the report itself could not be sent.
    #[instrument(skip(self, directive), fields(worker_id = %self.id, directive_id = %directive.id))]
    pub async fn handle_message(&self, directive: BusMessage) -> Result<BusMessage, AgentError> {
        let Some(record) = self.services.registry.get(&self.id) else {
            warn!("No agent record, refusing directive");
            let execution = Execution {
                result: CodingAgentTaskResult {
                    error_message: Some(AgentError::NotFound(self.id.clone()).to_string()),
                    ..Default::default()
                },
                agent_type: None,
            };
            return self.send_report(&directive, directive.from_agent_id.as_deref(), &execution);
        };
        let parent = record
            .parent_id
            .clone()
            .or_else(|| directive.from_agent_id.clone());

        if let Err(e) = self.services.registry.begin_task(&self.id) {
            warn!("Refusing directive: {}", e);
            let result = CodingAgentTaskResult {
                error_message: Some(e.to_string()),
                ..Default::default()
            };
            let execution = Execution {
                result,
                agent_type: None,
            };
            return self.send_report(&directive, parent.as_deref(), &execution);
        }
        info!(task = %truncate(&directive.content, 80), "Task started");

        let execution = match AssertUnwindSafe(self.execute(&record, &directive.content))
            .catch_unwind()
            .await
        {
            Ok(execution) => execution,
            Err(panic) => {
                *self.current() = None;
                let message = panic_message(panic.as_ref());
                error!("Task panicked: {}", message);
                Execution {
                    result: CodingAgentTaskResult::failed(
                        TaskErrorCode::BackendError,
                        format!("task panicked: {}", message),
                    ),
                    agent_type: None,
                }
            }
        };
        let next = if execution.result.success {
            AgentStatus::Done
        } else {
            AgentStatus::Error
        };
        if let Err(e) = self.services.registry.set_status(&self.id, next) {
            warn!("Failed to record task outcome: {}", e);
        }
        info!(success = execution.result.success, "Task finished");

        self.send_report(&directive, parent.as_deref(), &execution)
    }

    async fn execute(&self, record: &AgentRecord, task: &str) -> Execution {
        match self.select_backend(record).await {
            Some(backend) => self.execute_coding(record, backend, task).await,
            None => self.execute_direct(record, task).await,
        }
    }

    /// Pick the coding backend, or `None` to use the direct-LLM loop.
    async fn select_backend(&self, record: &AgentRecord) -> Option<Arc<dyn CodingBackend>> {
        if !record.is_coding_role() {
            return None;
        }
        let agent_type = record
            .coding_agent
            .clone()
            .or_else(|| self.services.settings.default_coding_agent.clone())?;
        let Some(backend) = self.services.backends.get(&agent_type) else {
            debug!(agent_type = %agent_type, "No backend registered");
            return None;
        };
        // Readiness first: a half-open breaker admits one attempt, and an
        // unready backend must not consume it.
        if !backend.is_ready().await {
            info!(agent_type = %agent_type, "Backend not ready, using direct LLM");
            return None;
        }
        if !self
            .services
            .breakers
            .is_provider_available(backend.provider_key())
        {
            warn!(provider = backend.provider_key(), "Circuit open, using direct LLM");
            return None;
        }
        Some(backend)
    }

    /// Directory the coding agent works in: the worker's worktree when the
    /// workspace is a git repository, else the workspace itself.
    async fn workdir(&self, record: &AgentRecord) -> PathBuf {
        let Some(repo) = record.workspace_path.clone() else {
            return PathBuf::from(".");
        };
        if !self.services.git().is_git_repo(&repo).await {
            return repo;
        }
        match self.services.worktrees.ensure(&self.id, &repo).await {
            Ok(binding) => binding.worktree_path,
            Err(e) => {
                warn!(repo = %repo.display(), "Worktree unavailable, using repository: {}", e);
                repo
            }
        }
    }

    async fn execute_coding(
        &self,
        record: &AgentRecord,
        backend: Arc<dyn CodingBackend>,
        task: &str,
    ) -> Execution {
        let agent_type = backend.agent_type().to_string();
        let workdir = self.workdir(record).await;
        let client = backend.client(&workdir, record.model.as_deref());
        *self.current() = Some(client.clone());

        self.emit(SessionEvent::SessionStart {
            task: task.to_string(),
            project_id: record.project_id.clone(),
            agent_type: agent_type.clone(),
        });

        let callbacks = TaskCallbacks {
            human: self.services.human.clone(),
            permission: self.services.permission.clone(),
            on_event: None,
        }
        .with_session_sink(self.services.event_sink.clone());
        let result = client.execute_task(task, callbacks).await;
        *self.current() = None;

        let provider = backend.provider_key();
        if result.success {
            self.services.breakers.record_success(provider);
        } else if result
            .error
            .map(|code| code.counts_against_provider())
            .unwrap_or(false)
        {
            self.services.breakers.record_failure(provider);
        } else {
            self.services.breakers.record_neutral(provider);
        }

        self.emit(SessionEvent::SessionEnd {
            status: if result.success {
                SessionEndStatus::Completed
            } else {
                SessionEndStatus::Error
            },
            diff: result.diff.clone(),
            session_id: result.session_id.clone(),
        });

        Execution {
            result,
            agent_type: Some(agent_type),
        }
    }

    async fn execute_direct(&self, record: &AgentRecord, task: &str) -> Execution {
        let request = DirectTaskRequest {
            agent_id: self.id.clone(),
            task: task.to_string(),
            model: record.model.clone(),
            provider: record.provider.clone(),
            workspace: record.workspace_path.clone(),
        };
        let result = match self.services.fallback.run_task(request).await {
            Ok(outcome) => CodingAgentTaskResult::succeeded(outcome.summary).with_usage(outcome.usage),
            Err(e) => CodingAgentTaskResult {
                error_message: Some(e.to_string()),
                ..Default::default()
            },
        };
        Execution {
            result,
            agent_type: None,
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(sink) = &self.services.event_sink {
            sink(event);
        }
    }

    fn send_report(
        &self,
        directive: &BusMessage,
        parent: Option<&str>,
        execution: &Execution,
    ) -> Result<BusMessage, AgentError> {
        let result = &execution.result;
        let mut report = BusMessage::report(
            &self.id,
            parent,
            report_content(result),
            Some(&directive.id),
        )
        .with_conversation(directive.conversation_id.as_deref())
        .with_metadata("success", json!(result.success))
        .with_metadata("agentType", json!(execution.agent_type))
        .with_metadata("sessionId", json!(result.session_id))
        .with_metadata("diff", json!(result.diff));
        if let Some(code) = result.error {
            report = report.with_metadata("errorCode", json!(code.as_str()));
        }
        if let Some(task_id) = directive.metadata.get("taskId") {
            report = report.with_metadata("taskId", task_id.clone());
        }
        Ok(self.services.bus.send(report)?)
    }
}

/// Report text for a task result.
fn report_content(result: &CodingAgentTaskResult) -> String {
    let stats = result
        .diff
        .as_deref()
        .filter(|diff| !diff.is_empty())
        .map(DiffStats::from_diff);

    if result.success {
        let mut content = if result.summary.trim().is_empty() {
            "Task completed.".to_string()
        } else {
            result.summary.trim().to_string()
        };
        if let Some(stats) = stats {
            content.push_str(&format!("\n\nChanges: {}", stats));
        }
        return content;
    }

    let message = result
        .error_message
        .as_deref()
        .unwrap_or("task failed without an error message");
    let mut content = match result.error {
        Some(code) => format!("{}: [{}] {}", WORKER_ERROR_MARKER, code, message),
        None => format!("{}: {}", WORKER_ERROR_MARKER, message),
    };
    if !result.summary.trim().is_empty() {
        content.push_str("\n\nPartial summary:\n");
        content.push_str(result.summary.trim());
    }
    if let Some(stats) = stats {
        content.push_str(&format!("\n\nPartial changes: {}", stats));
    }
    content
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
