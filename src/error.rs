// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for foreman.
//!
//! Each subsystem gets its own strongly-typed error, defined with `thiserror`.
//! `anyhow` is only used at the binary boundary.
//!
//! Nothing below the worker boundary is allowed to escape onto the message bus:
//! [`BackendError`] and [`GitError`] values are converted into failed task
//! results or degraded diffs by the callers that receive them.

use thiserror::Error;

/// Errors raised by the message bus.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Request channel closed before a reply arrived")]
    Closed,
}

/// Errors raised by the SQLite-backed store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Errors raised by git subprocess calls.
#[derive(Error, Debug)]
pub enum GitError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git {command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("git {command} timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("Not a git repository: {0}")]
    NotARepository(String),

    #[error("Merge conflict merging {branch}: {detail}")]
    MergeConflict { branch: String, detail: String },
}

/// Errors raised by coding-agent backends.
///
/// Every variant is converted into a failed `CodingAgentTaskResult` at the
/// backend or worker boundary.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Backend not ready: {0}")]
    NotReady(String),

    #[error("Failed to spawn coding agent: {0}")]
    Spawn(String),

    #[error("Coding agent exited with code {0}")]
    Exit(i32),

    #[error("HTTP error: {message}")]
    Http {
        message: String,
        status_code: Option<u16>,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Response parsing error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Create an HTTP error with a status code.
    pub fn http(message: impl Into<String>, status_code: u16) -> Self {
        Self::Http {
            message: message.into(),
            status_code: Some(status_code),
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http {
            message: err.to_string(),
            status_code: err.status().map(|s| s.as_u16()),
        }
    }
}

/// Errors raised by the agent hierarchy.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Agent not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition for {agent_id}: {from} -> {to}")]
    InvalidTransition {
        agent_id: String,
        from: String,
        to: String,
    },

    #[error("Project {project_id} already has a busy coding worker: {worker_id}")]
    ProjectBusy {
        project_id: String,
        worker_id: String,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task {0} is blocked by unfinished dependencies")]
    TaskBlocked(String),

    #[error("Direct LLM execution failed: {0}")]
    Fallback(String),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Git error: {0}")]
    Git(#[from] GitError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}
