// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Remote HTTP/SSE coding-agent backend.
//!
//! A task runs as a remote session. The blocking prompt call races an
//! [`ActivityMonitor`] that shares the task's [`CancelToken`]: the monitor
//! listens on `/event` (or polls message counts when the stream cannot be
//! opened) and cancels on idle timeout, hard cap or a `session.error`.
//! Whatever the outcome, the client salvages a summary and a diff.

mod client;
mod sse;

pub use client::{AssistantTurn, RemoteApi};
pub use sse::{spawn_event_pump, ServerEvent, SseDecoder};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::config::RemoteServerConfig;
use crate::error::BackendError;
use crate::git::{FileDiff, Git};

use super::activity::{ActivityConfig, ActivityMonitor, ActivitySignal, MonitorOutcome};
use super::cancel::CancelToken;
use super::classifier::{QuestionClassifier, TrailingQuestion};
use super::events::from_server_event;
use super::supervisor::{ProcessSupervisor, DEFAULT_MAX_RESTARTS};
use super::types::{
    CodingAgentClient, CodingAgentTaskResult, CodingBackend, PermissionDecision,
    PermissionRequest, TaskCallbacks, TaskErrorCode, TokenUsage,
};

/// Agent type served by the remote backend.
pub const REMOTE_AGENT_TYPE: &str = "opencode";

const SESSION_TITLE_CHARS: usize = 60;

/// Settings shared by every client of one backend.
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub activity: ActivityConfig,
    pub max_turns: u32,
    pub git: Git,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            activity: ActivityConfig::default(),
            max_turns: 10,
            git: Git::default(),
        }
    }
}

/// Factory for remote-session clients.
pub struct RemoteBackend {
    api: RemoteApi,
    supervisor: Option<Arc<ProcessSupervisor>>,
    settings: RemoteSettings,
    classifier: Arc<dyn QuestionClassifier>,
}

impl RemoteBackend {
    pub fn new(config: &RemoteServerConfig, settings: RemoteSettings) -> Result<Self, BackendError> {
        let supervisor = match &config.serve_command {
            Some(command) => Some(Arc::new(ProcessSupervisor::new(
                command,
                None,
                config.max_restarts.unwrap_or(DEFAULT_MAX_RESTARTS),
            )?)),
            None => None,
        };
        Ok(Self {
            api: RemoteApi::new(config.base_url.clone())
                .with_basic_auth(config.username.clone(), config.password.clone()),
            supervisor,
            settings,
            classifier: Arc::new(TrailingQuestion::default()),
        })
    }

    /// Replace the clarifying-question classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn QuestionClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn api(&self) -> &RemoteApi {
        &self.api
    }

    pub fn supervisor(&self) -> Option<&Arc<ProcessSupervisor>> {
        self.supervisor.as_ref()
    }
}

#[async_trait]
impl CodingBackend for RemoteBackend {
    fn agent_type(&self) -> &str {
        REMOTE_AGENT_TYPE
    }

    async fn is_ready(&self) -> bool {
        if let Some(supervisor) = &self.supervisor {
            if let Err(e) = supervisor.ensure_running().await {
                warn!("Remote server unavailable: {}", e);
                return false;
            }
        }
        self.api.health().await
    }

    fn client(&self, workdir: &Path, model: Option<&str>) -> Arc<dyn CodingAgentClient> {
        Arc::new(RemoteClient {
            api: self.api.clone().with_directory(workdir),
            workdir: workdir.to_path_buf(),
            model: model.map(str::to_string),
            settings: self.settings.clone(),
            classifier: self.classifier.clone(),
            active: Mutex::new(None),
        })
    }
}

struct ActiveSession {
    cancel: CancelToken,
    killed: AtomicBool,
}

/// Runs tasks as sessions on the remote server, scoped to one directory.
pub struct RemoteClient {
    api: RemoteApi,
    workdir: PathBuf,
    model: Option<String>,
    settings: RemoteSettings,
    classifier: Arc<dyn QuestionClassifier>,
    active: Mutex<Option<Arc<ActiveSession>>>,
}

impl RemoteClient {
    fn set_active(&self, session: Option<Arc<ActiveSession>>) {
        let mut guard = self.active.lock().unwrap_or_else(|e| e.into_inner());
        *guard = session;
    }

    /// Prompt, then keep answering clarifying questions while a human
    /// responder is attached and the turn budget lasts.
    async fn converse(
        &self,
        session_id: &str,
        task: &str,
        callbacks: &TaskCallbacks,
    ) -> Result<AssistantTurn, BackendError> {
        let mut input = task.to_string();
        let mut usage: Option<TokenUsage> = None;
        let mut turns = 0u32;

        loop {
            turns += 1;
            let turn = self
                .api
                .send_message(session_id, &input, self.model.as_deref())
                .await?;
            if let Some(turn_usage) = turn.usage {
                usage.get_or_insert_with(TokenUsage::default).add(turn_usage);
            }
            let finished = AssistantTurn {
                text: turn.text.clone(),
                usage,
            };

            let Some(human) = callbacks.human.as_ref() else {
                return Ok(finished);
            };
            if turns >= self.settings.max_turns {
                info!(session_id, turns, "Turn budget exhausted");
                return Ok(finished);
            }
            let Some(question) = self.classifier.question(&turn.text) else {
                return Ok(finished);
            };

            debug!(session_id, "Forwarding clarifying question");
            match human.respond(session_id, question).await {
                Some(reply) => input = reply,
                None => return Ok(finished),
            }
        }
    }

    /// Remote diff, falling back to the local git diff of the workdir.
    async fn collect_diff(&self, session_id: &str) -> Option<Vec<FileDiff>> {
        match self.api.diff(session_id).await {
            Ok(diff) if !diff.is_empty() => return Some(diff),
            Ok(_) => {}
            Err(e) => debug!(session_id, "Remote diff unavailable: {}", e),
        }
        self.settings.git.compute_git_diff(&self.workdir).await
    }

    fn spawn_monitor(
        &self,
        session_id: &str,
        events: Result<mpsc::Receiver<ServerEvent>, BackendError>,
        callbacks: &TaskCallbacks,
        cancel: &CancelToken,
    ) -> tokio::task::JoinHandle<MonitorOutcome> {
        let monitor = ActivityMonitor::new(self.settings.activity).for_session(session_id);
        let cancel = cancel.clone();

        match events {
            Ok(events) => {
                let (signal_tx, signal_rx) = mpsc::channel(256);
                tokio::spawn(forward_events(
                    events,
                    session_id.to_string(),
                    signal_tx,
                    callbacks.clone(),
                    self.api.clone(),
                    cancel.clone(),
                ));
                tokio::spawn(async move { monitor.watch(signal_rx, &cancel).await })
            }
            Err(e) => {
                warn!(session_id, "Event stream unavailable, polling instead: {}", e);
                let api = self.api.clone();
                let session_id = session_id.to_string();
                tokio::spawn(async move {
                    monitor
                        .watch_polling(
                            || {
                                let api = api.clone();
                                let session_id = session_id.clone();
                                async move {
                                    api.messages(&session_id).await.ok().map(|m| m.len() as u64)
                                }
                            },
                            &cancel,
                        )
                        .await
                })
            }
        }
    }
}

#[async_trait]
impl CodingAgentClient for RemoteClient {
    fn agent_type(&self) -> &str {
        REMOTE_AGENT_TYPE
    }

    #[instrument(skip(self, task, callbacks), fields(workdir = %self.workdir.display()))]
    async fn execute_task(&self, task: &str, callbacks: TaskCallbacks) -> CodingAgentTaskResult {
        let session_id = match self.api.create_session(&session_title(task)).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Failed to create remote session: {}", e);
                return CodingAgentTaskResult::from_backend_error(&e);
            }
        };
        info!(session_id = %session_id, "Remote session started");

        let active = Arc::new(ActiveSession {
            cancel: CancelToken::new(),
            killed: AtomicBool::new(false),
        });
        self.set_active(Some(active.clone()));
        let cancel = active.cancel.clone();

        let events = self.api.subscribe_events().await;
        let monitor = self.spawn_monitor(&session_id, events, &callbacks, &cancel);

        let finished = tokio::select! {
            result = self.converse(&session_id, task, &callbacks) => Some(result),
            _ = cancel.cancelled() => None,
        };
        cancel.cancel();
        let outcome = monitor.await.unwrap_or_else(|e| {
            warn!("Activity monitor task failed: {}", e);
            MonitorOutcome::Completed
        });
        self.set_active(None);

        let result = match finished {
            Some(Ok(turn)) => CodingAgentTaskResult::succeeded(turn.text)
                .with_usage(turn.usage)
                .with_diff(self.collect_diff(&session_id).await),
            Some(Err(e)) => {
                warn!(session_id = %session_id, "Remote session failed: {}", e);
                let code = match e {
                    BackendError::Session(_) => TaskErrorCode::SessionError,
                    _ => TaskErrorCode::BackendError,
                };
                let summary = self.api.last_assistant_text(&session_id).await;
                CodingAgentTaskResult::failed(code, e.to_string())
                    .with_summary(summary.unwrap_or_default())
                    .with_diff(self.collect_diff(&session_id).await)
            }
            None => {
                if let Err(e) = self.api.abort(&session_id).await {
                    debug!(session_id = %session_id, "Best-effort abort failed: {}", e);
                }
                let (code, message) = if active.killed.load(Ordering::SeqCst) {
                    (TaskErrorCode::Killed, "aborted by caller".to_string())
                } else {
                    (
                        outcome.error_code().unwrap_or(TaskErrorCode::Killed),
                        outcome.describe(&self.settings.activity),
                    )
                };
                info!(session_id = %session_id, outcome = outcome.as_str(), "Salvaging partial results");
                let summary = self.api.last_assistant_text(&session_id).await;
                CodingAgentTaskResult::failed(code, message)
                    .with_summary(summary.unwrap_or_default())
                    .with_diff(self.collect_diff(&session_id).await)
            }
        };
        result.with_session(Some(session_id))
    }

    async fn abort(&self) {
        let active = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(active) = active {
            active.killed.store(true, Ordering::SeqCst);
            active.cancel.cancel();
        }
    }
}

/// Relay session events: native events to the caller, permission requests to
/// the permission handler, everything to the activity monitor.
async fn forward_events(
    mut events: mpsc::Receiver<ServerEvent>,
    session_id: String,
    signals: mpsc::Sender<ActivitySignal>,
    callbacks: TaskCallbacks,
    api: RemoteApi,
    cancel: CancelToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        if event.session_id() != Some(session_id.as_str()) {
            continue;
        }

        callbacks.emit(from_server_event(REMOTE_AGENT_TYPE, &event.raw));

        if event.is_permission_request() {
            if let Some(request) = permission_request(&event, &session_id) {
                let handler = callbacks.permission.clone();
                let api = api.clone();
                tokio::spawn(async move {
                    let decision = match handler {
                        Some(handler) => handler.decide(request.clone()).await,
                        None => PermissionDecision::Once,
                    };
                    if let Err(e) = api
                        .reply_permission(&request.session_id, &request.id, decision)
                        .await
                    {
                        warn!(permission_id = %request.id, "Failed to answer permission request: {}", e);
                    }
                });
            }
        }
        if event.is_idle() {
            debug!(session_id = %session_id, "Session reported idle");
        }

        if signals.send(event.to_signal()).await.is_err() {
            break;
        }
    }
}

fn permission_request(event: &ServerEvent, session_id: &str) -> Option<PermissionRequest> {
    let p = &event.properties;
    let id = p.get("id").and_then(Value::as_str)?;
    Some(PermissionRequest {
        id: id.to_string(),
        session_id: session_id.to_string(),
        title: p
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        tool: p
            .get("type")
            .or_else(|| p.get("permission"))
            .and_then(Value::as_str)
            .map(str::to_string),
        metadata: p.get("metadata").cloned().unwrap_or(Value::Null),
    })
}

fn session_title(task: &str) -> String {
    let first_line = task.lines().next().unwrap_or_default().trim();
    first_line.chars().take(SESSION_TITLE_CHARS).collect()
}
