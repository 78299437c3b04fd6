// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP client for the remote coding-agent server.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::coding::types::{PermissionDecision, TokenUsage};
use crate::error::BackendError;
use crate::git::FileDiff;

use super::sse::{spawn_event_pump, ServerEvent};

/// Timeout for short control calls (create, abort, health, diff).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Output of one prompt turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantTurn {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct SessionInfo {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RemoteFileDiff {
    #[serde(alias = "path")]
    file: String,
    #[serde(default)]
    additions: u64,
    #[serde(default)]
    deletions: u64,
}

/// Thin typed wrapper over the server's REST API.
#[derive(Debug, Clone)]
pub struct RemoteApi {
    http: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    directory: Option<PathBuf>,
}

impl RemoteApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: None,
            password: None,
            directory: None,
        }
    }

    /// Use HTTP Basic auth.
    pub fn with_basic_auth(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    /// Scope sessions to a working directory.
    pub fn with_directory(mut self, directory: &Path) -> Self {
        self.directory = Some(directory.to_path_buf());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(dir) = &self.directory {
            req = req.query(&[("directory", dir.to_string_lossy().to_string())]);
        }
        if let Some(user) = &self.username {
            req = req.basic_auth(user, self.password.as_deref());
        }
        req
    }

    async fn send_json(&self, req: reqwest::RequestBuilder) -> Result<Value, BackendError> {
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::http(
                format!("{}: {}", status, body.trim()),
                status.as_u16(),
            ));
        }
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| BackendError::Parse(e.to_string()))
    }

    /// `GET /session`: reachable and answering.
    pub async fn health(&self) -> bool {
        match self
            .request(reqwest::Method::GET, "/session")
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Remote health check failed: {}", e);
                false
            }
        }
    }

    /// `POST /session`.
    pub async fn create_session(&self, title: &str) -> Result<String, BackendError> {
        let value = self
            .send_json(
                self.request(reqwest::Method::POST, "/session")
                    .timeout(CONTROL_TIMEOUT)
                    .json(&json!({ "title": title })),
            )
            .await?;
        let info: SessionInfo =
            serde_json::from_value(value).map_err(|e| BackendError::Parse(e.to_string()))?;
        Ok(info.id)
    }

    /// `POST /session/{id}/message`: blocks until the turn completes.
    pub async fn send_message(
        &self,
        session_id: &str,
        text: &str,
        model: Option<&str>,
    ) -> Result<AssistantTurn, BackendError> {
        let mut body = json!({ "parts": [{ "type": "text", "text": text }] });
        if let Some((provider, model)) = model.and_then(|m| m.split_once('/')) {
            body["model"] = json!({ "providerID": provider, "modelID": model });
        }
        let value = self
            .send_json(
                self.request(
                    reqwest::Method::POST,
                    &format!("/session/{}/message", session_id),
                )
                .json(&body),
            )
            .await?;

        if let Some(error) = value.pointer("/info/error") {
            let message = error
                .pointer("/data/message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(BackendError::Session(message));
        }
        Ok(parse_turn(&value))
    }

    /// `GET /session/{id}/diff`.
    pub async fn diff(&self, session_id: &str) -> Result<Vec<FileDiff>, BackendError> {
        let value = self
            .send_json(
                self.request(reqwest::Method::GET, &format!("/session/{}/diff", session_id))
                    .timeout(CONTROL_TIMEOUT),
            )
            .await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        let diffs: Vec<RemoteFileDiff> =
            serde_json::from_value(value).map_err(|e| BackendError::Parse(e.to_string()))?;
        Ok(diffs
            .into_iter()
            .map(|d| FileDiff::new(d.file, d.additions, d.deletions))
            .collect())
    }

    /// `POST /session/{id}/abort`.
    pub async fn abort(&self, session_id: &str) -> Result<(), BackendError> {
        self.send_json(
            self.request(reqwest::Method::POST, &format!("/session/{}/abort", session_id))
                .timeout(CONTROL_TIMEOUT),
        )
        .await
        .map(|_| ())
    }

    /// `GET /session/{id}/message`: full transcript.
    pub async fn messages(&self, session_id: &str) -> Result<Vec<Value>, BackendError> {
        let value = self
            .send_json(
                self.request(
                    reqwest::Method::GET,
                    &format!("/session/{}/message", session_id),
                )
                .timeout(CONTROL_TIMEOUT),
            )
            .await?;
        Ok(match value {
            Value::Array(items) => items,
            _ => Vec::new(),
        })
    }

    /// Text of the most recent assistant message, if any.
    pub async fn last_assistant_text(&self, session_id: &str) -> Option<String> {
        let messages = self.messages(session_id).await.ok()?;
        messages
            .iter()
            .rev()
            .find(|m| m.pointer("/info/role").and_then(Value::as_str) == Some("assistant"))
            .map(|m| parse_turn(m).text)
            .filter(|t| !t.is_empty())
    }

    /// `POST /session/{id}/permissions/{permissionId}`.
    pub async fn reply_permission(
        &self,
        session_id: &str,
        permission_id: &str,
        decision: PermissionDecision,
    ) -> Result<(), BackendError> {
        self.send_json(
            self.request(
                reqwest::Method::POST,
                &format!("/session/{}/permissions/{}", session_id, permission_id),
            )
            .timeout(CONTROL_TIMEOUT)
            .json(&json!({ "response": decision.as_str() })),
        )
        .await
        .map(|_| ())
    }

    /// `GET /event`: subscribe to the server's event stream.
    pub async fn subscribe_events(&self) -> Result<mpsc::Receiver<ServerEvent>, BackendError> {
        let response = self
            .request(reqwest::Method::GET, "/event")
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::http(
                format!("event stream rejected: {}", status),
                status.as_u16(),
            ));
        }
        Ok(spawn_event_pump(response.bytes_stream(), "remote"))
    }
}

/// Concatenate the text parts of a `{info, parts}` message.
fn parse_turn(value: &Value) -> AssistantTurn {
    let text = value
        .get("parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    let usage = value.pointer("/info/tokens").map(|tokens| {
        TokenUsage::new(
            tokens.get("input").and_then(Value::as_u64).unwrap_or(0),
            tokens.get("output").and_then(Value::as_u64).unwrap_or(0),
        )
    });

    AssistantTurn { text, usage }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_turn() {
        let value = json!({
            "info": {"role": "assistant", "tokens": {"input": 120, "output": 30}},
            "parts": [
                {"type": "step-start"},
                {"type": "text", "text": "Updated the parser."},
                {"type": "tool", "tool": "edit"},
                {"type": "text", "text": "Tests pass."}
            ]
        });
        let turn = parse_turn(&value);
        assert_eq!(turn.text, "Updated the parser.\nTests pass.");
        assert_eq!(turn.usage, Some(TokenUsage::new(120, 30)));
    }

    #[test]
    fn test_parse_turn_without_parts() {
        let turn = parse_turn(&json!({"info": {}}));
        assert!(turn.text.is_empty());
        assert!(turn.usage.is_none());
    }

    #[test]
    fn test_base_url_trimmed() {
        let api = RemoteApi::new("http://localhost:4096/");
        assert_eq!(api.base_url(), "http://localhost:4096");
    }

    #[test]
    fn test_remote_diff_shape() {
        let diffs: Vec<RemoteFileDiff> = serde_json::from_value(json!([
            {"file": "src/a.rs", "before": "", "after": "x", "additions": 3, "deletions": 1},
            {"path": "b.rs"}
        ]))
        .unwrap();
        assert_eq!(diffs[0].file, "src/a.rs");
        assert_eq!(diffs[1].additions, 0);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unhealthy() {
        let api = RemoteApi::new("http://127.0.0.1:1");
        assert!(!api.health().await);
        assert!(api.create_session("t").await.is_err());
    }
}
