// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Coding-agent client contract.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BackendError;
use crate::git::FileDiff;

use super::events::{NativeEvent, SessionEventSink};

/// Token usage reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Machine-readable reason a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorCode {
    IdleTimeout,
    HardTimeout,
    SessionError,
    Killed,
    ExitFailure,
    BackendError,
}

impl TaskErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IdleTimeout => "idle_timeout",
            Self::HardTimeout => "hard_timeout",
            Self::SessionError => "session_error",
            Self::Killed => "killed",
            Self::ExitFailure => "exit_failure",
            Self::BackendError => "backend_error",
        }
    }

    /// Whether the failure says something about the provider's health.
    pub fn counts_against_provider(&self) -> bool {
        matches!(self, Self::SessionError | Self::BackendError)
    }
}

impl std::fmt::Display for TaskErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one coding-agent task.
///
/// Backends never return errors for task failures; they fill `error` and
/// whatever summary and diff could be salvaged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodingAgentTaskResult {
    pub success: bool,
    pub session_id: Option<String>,
    pub summary: String,
    pub diff: Option<Vec<FileDiff>>,
    pub usage: Option<TokenUsage>,
    pub error: Option<TaskErrorCode>,
    pub error_message: Option<String>,
}

impl CodingAgentTaskResult {
    /// Successful result.
    pub fn succeeded(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            ..Default::default()
        }
    }

    /// Failed result.
    pub fn failed(code: TaskErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(code),
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Failed result from a backend error.
    pub fn from_backend_error(err: &BackendError) -> Self {
        Self::failed(TaskErrorCode::BackendError, err.to_string())
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_diff(mut self, diff: Option<Vec<FileDiff>>) -> Self {
        self.diff = diff;
        self
    }

    pub fn with_usage(mut self, usage: Option<TokenUsage>) -> Self {
        self.usage = usage;
        self
    }
}

/// Answers questions a coding agent asks mid-task.
#[async_trait]
pub trait HumanResponder: Send + Sync {
    /// Return the reply, or `None` to let the agent finish as-is.
    async fn respond(&self, session_id: &str, question: &str) -> Option<String>;
}

/// A coding agent asking to use a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub title: String,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// Reply to a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Once,
    Always,
    Reject,
}

impl PermissionDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Always => "always",
            Self::Reject => "reject",
        }
    }
}

/// Decides permission requests.
#[async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn decide(&self, request: PermissionRequest) -> PermissionDecision;
}

/// Callback for native backend events.
pub type NativeEventSink = Arc<dyn Fn(NativeEvent) + Send + Sync>;

/// Optional hooks for one task.
#[derive(Clone, Default)]
pub struct TaskCallbacks {
    pub human: Option<Arc<dyn HumanResponder>>,
    pub permission: Option<Arc<dyn PermissionHandler>>,
    pub on_event: Option<NativeEventSink>,
}

impl TaskCallbacks {
    /// Forward a native event, if anyone is listening.
    pub fn emit(&self, event: NativeEvent) {
        if let Some(sink) = &self.on_event {
            sink(event);
        }
    }

    /// Wrap native events into the session envelope for `sink`.
    pub fn with_session_sink(mut self, sink: Option<SessionEventSink>) -> Self {
        self.on_event = sink.map(|sink| {
            let native: NativeEventSink =
                Arc::new(move |event| sink(super::events::SessionEvent::Native(event)));
            native
        });
        self
    }
}

impl std::fmt::Debug for TaskCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCallbacks")
            .field("human", &self.human.is_some())
            .field("permission", &self.permission.is_some())
            .field("on_event", &self.on_event.is_some())
            .finish()
    }
}

/// A client that runs tasks against one coding-agent backend.
#[async_trait]
pub trait CodingAgentClient: Send + Sync {
    /// Backend type, e.g. `opencode` or `claude-code`.
    fn agent_type(&self) -> &str;

    /// Run a task to completion. Never fails; see [`CodingAgentTaskResult`].
    async fn execute_task(&self, task: &str, callbacks: TaskCallbacks) -> CodingAgentTaskResult;

    /// Stop the running task, if any. The pending `execute_task` resolves
    /// with a failed result.
    async fn abort(&self) {}
}

/// Factory for clients of one backend type.
#[async_trait]
pub trait CodingBackend: Send + Sync {
    /// Backend type served by this factory.
    fn agent_type(&self) -> &str;

    /// Key used for circuit breaking.
    fn provider_key(&self) -> &str {
        self.agent_type()
    }

    /// Whether the backend can accept work now.
    async fn is_ready(&self) -> bool;

    /// Client bound to a working directory.
    fn client(&self, workdir: &Path, model: Option<&str>) -> Arc<dyn CodingAgentClient>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_strings() {
        assert_eq!(TaskErrorCode::IdleTimeout.as_str(), "idle_timeout");
        assert_eq!(TaskErrorCode::HardTimeout.to_string(), "hard_timeout");
        assert_eq!(
            serde_json::to_value(TaskErrorCode::ExitFailure).unwrap(),
            "exit_failure"
        );
    }

    #[test]
    fn test_failed_result() {
        let result = CodingAgentTaskResult::failed(TaskErrorCode::Killed, "killed by user")
            .with_summary("partial");
        assert!(!result.success);
        assert_eq!(result.error, Some(TaskErrorCode::Killed));
        assert_eq!(result.summary, "partial");
    }

    #[test]
    fn test_usage_add() {
        let mut usage = TokenUsage::new(10, 5);
        usage.add(TokenUsage::new(1, 2));
        assert_eq!(usage.total(), 18);
    }

    #[test]
    fn test_callbacks_wrap_session_sink() {
        use std::sync::Mutex;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: SessionEventSink = Arc::new(move |e| sink_seen.lock().unwrap().push(e));

        let callbacks = TaskCallbacks::default().with_session_sink(Some(sink));
        callbacks.emit(NativeEvent::new("opencode", serde_json::json!({"type": "x"})));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], super::super::events::SessionEvent::Native(_)));
    }
}
