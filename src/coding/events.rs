// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Normalized session event envelope.
//!
//! Backends speak different event vocabularies. Each one has an adapter that
//! turns its native events into [`NativeEvent`]; the worker brackets them with
//! a synthetic start and end event so consumers see one shape:
//!
//! ```text
//! {"type":"__session-start","task":..,"projectId":..,"agentType":..}
//! {"type":"native","source":"opencode","payload":{..verbatim..}}
//! {"type":"__session-end","status":"completed","diff":[..],"sessionId":..}
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::git::FileDiff;

/// A backend event, carried verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeEvent {
    /// Backend type that produced the event.
    pub source: String,
    pub payload: Value,
}

impl NativeEvent {
    pub fn new(source: impl Into<String>, payload: Value) -> Self {
        Self {
            source: source.into(),
            payload,
        }
    }
}

/// Final session status in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionEndStatus {
    Completed,
    Error,
}

/// The envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    #[serde(rename = "__session-start", rename_all = "camelCase")]
    SessionStart {
        task: String,
        project_id: Option<String>,
        agent_type: String,
    },
    #[serde(rename = "native")]
    Native(NativeEvent),
    #[serde(rename = "__session-end", rename_all = "camelCase")]
    SessionEnd {
        status: SessionEndStatus,
        diff: Option<Vec<FileDiff>>,
        session_id: Option<String>,
    },
}

/// Consumer of session events.
pub type SessionEventSink = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// Adapter for the remote server's SSE events: forwarded unchanged.
pub fn from_server_event(source: &str, raw: &Value) -> NativeEvent {
    NativeEvent::new(source, raw.clone())
}

/// Adapter for PTY output: one event per chunk of terminal bytes.
pub fn from_pty_output(source: &str, chunk: &[u8]) -> NativeEvent {
    NativeEvent::new(
        source,
        json!({
            "type": "output",
            "data": String::from_utf8_lossy(chunk),
        }),
    )
}

/// Adapter for PTY process exit.
pub fn from_pty_exit(source: &str, exit_code: Option<u32>, killed: bool) -> NativeEvent {
    NativeEvent::new(
        source,
        json!({
            "type": "exit",
            "exitCode": exit_code,
            "killed": killed,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shapes() {
        let start = SessionEvent::SessionStart {
            task: "fix bug".into(),
            project_id: Some("p1".into()),
            agent_type: "opencode".into(),
        };
        let json = serde_json::to_value(&start).unwrap();
        assert_eq!(json["type"], "__session-start");
        assert_eq!(json["projectId"], "p1");
        assert_eq!(json["agentType"], "opencode");

        let end = SessionEvent::SessionEnd {
            status: SessionEndStatus::Completed,
            diff: Some(vec![FileDiff::new("a.rs", 1, 0)]),
            session_id: Some("s1".into()),
        };
        let json = serde_json::to_value(&end).unwrap();
        assert_eq!(json["type"], "__session-end");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["diff"][0]["path"], "a.rs");
    }

    #[test]
    fn test_native_forwarded_verbatim() {
        let raw = json!({"type": "message.part.updated", "properties": {"sessionID": "s1"}});
        let event = SessionEvent::Native(from_server_event("opencode", &raw));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "native");
        assert_eq!(json["source"], "opencode");
        assert_eq!(json["payload"], raw);
    }

    #[test]
    fn test_pty_output_is_lossy_text() {
        let event = from_pty_output("codex", b"hello \xff world");
        assert_eq!(event.payload["type"], "output");
        assert!(event.payload["data"].as_str().unwrap().starts_with("hello "));
    }
}
