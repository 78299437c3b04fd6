// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Message types carried by the bus.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of a bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Task assignment from a parent agent to a child.
    Directive,
    /// Result from a child to its parent, correlated to a directive.
    Report,
    /// Conversational text, usually from or to an external user.
    Chat,
    /// Agent lifecycle announcement.
    Status,
}

impl MessageType {
    /// Stable string form used for persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Directive => "directive",
            Self::Report => "report",
            Self::Chat => "chat",
            Self::Status => "status",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "directive" => Some(Self::Directive),
            "report" => Some(Self::Report),
            "chat" => Some(Self::Chat),
            "status" => Some(Self::Status),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message on the bus.
///
/// `from_agent_id == None` means the message came from outside the hierarchy;
/// `to_agent_id == None` means broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMessage {
    /// Unique id. Empty until the bus assigns one on send.
    pub id: String,
    pub from_agent_id: Option<String>,
    pub to_agent_id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// For reports: id of the directive being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl BusMessage {
    /// Create a message; the id is assigned when it is sent.
    pub fn new(
        message_type: MessageType,
        from_agent_id: Option<String>,
        to_agent_id: Option<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            from_agent_id,
            to_agent_id,
            message_type,
            content: content.into(),
            metadata: HashMap::new(),
            conversation_id: None,
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Directive from `from` to `to`.
    pub fn directive(from: Option<&str>, to: &str, content: impl Into<String>) -> Self {
        Self::new(
            MessageType::Directive,
            from.map(str::to_string),
            Some(to.to_string()),
            content,
        )
    }

    /// Report answering the directive `correlation_id`.
    pub fn report(
        from: &str,
        to: Option<&str>,
        content: impl Into<String>,
        correlation_id: Option<&str>,
    ) -> Self {
        let mut msg = Self::new(
            MessageType::Report,
            Some(from.to_string()),
            to.map(str::to_string),
            content,
        );
        msg.correlation_id = correlation_id.map(str::to_string);
        msg
    }

    /// Chat message.
    pub fn chat(from: Option<&str>, to: Option<&str>, content: impl Into<String>) -> Self {
        Self::new(
            MessageType::Chat,
            from.map(str::to_string),
            to.map(str::to_string),
            content,
        )
    }

    /// Broadcast status announcement.
    pub fn status(from: &str, content: impl Into<String>) -> Self {
        Self::new(MessageType::Status, Some(from.to_string()), None, content)
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Attach a conversation id.
    pub fn with_conversation(mut self, conversation_id: Option<&str>) -> Self {
        self.conversation_id = conversation_id.map(str::to_string);
        self
    }

    /// Attach a correlation id.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Whether this message is a broadcast.
    pub fn is_broadcast(&self) -> bool {
        self.to_agent_id.is_none()
    }

    /// String metadata value.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Boolean metadata value.
    pub fn metadata_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(Value::as_bool)
    }
}

/// Filter for history queries. All set fields must match.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Matches messages sent by or addressed to this agent.
    pub agent_id: Option<String>,
    pub conversation_id: Option<String>,
    pub message_type: Option<MessageType>,
    /// Page size; defaults to 50. Zero means the default.
    pub limit: Option<usize>,
    pub offset: usize,
}

impl HistoryFilter {
    /// Default page size.
    pub const DEFAULT_LIMIT: usize = 50;

    /// Filter by conversation.
    pub fn conversation(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            ..Default::default()
        }
    }

    /// Filter by agent (sender or recipient).
    pub fn agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Default::default()
        }
    }

    /// Set the page size.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the page offset.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Effective page size, never zero.
    pub fn page_size(&self) -> usize {
        self.limit
            .filter(|&limit| limit > 0)
            .unwrap_or(Self::DEFAULT_LIMIT)
    }
}

/// One page of history, oldest first.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub messages: Vec<BusMessage>,
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip_strings() {
        for t in [
            MessageType::Directive,
            MessageType::Report,
            MessageType::Chat,
            MessageType::Status,
        ] {
            assert_eq!(MessageType::parse(t.as_str()), Some(t));
        }
        assert_eq!(MessageType::parse("unknown"), None);
    }

    #[test]
    fn test_zero_limit_uses_default_page_size() {
        assert_eq!(HistoryFilter::default().with_limit(0).page_size(), 50);
        assert_eq!(HistoryFilter::default().with_limit(7).page_size(), 7);
        assert_eq!(HistoryFilter::default().page_size(), HistoryFilter::DEFAULT_LIMIT);
    }

    #[test]
    fn test_report_builder() {
        let msg = BusMessage::report("w1", Some("lead"), "done", Some("d-1"))
            .with_metadata("success", serde_json::json!(true));
        assert_eq!(msg.message_type, MessageType::Report);
        assert_eq!(msg.correlation_id.as_deref(), Some("d-1"));
        assert_eq!(msg.metadata_bool("success"), Some(true));
        assert!(msg.id.is_empty());
    }

    #[test]
    fn test_status_is_broadcast() {
        let msg = BusMessage::status("w1", "destroyed");
        assert!(msg.is_broadcast());
    }

    #[test]
    fn test_serializes_type_field() {
        let msg = BusMessage::directive(None, "w1", "do it");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "directive");
        assert_eq!(json["toAgentId"], "w1");
        assert!(json["fromAgentId"].is_null());
    }
}
