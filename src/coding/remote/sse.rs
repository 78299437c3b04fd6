// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Server-sent event decoding for the remote backend's `/event` stream.

use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::coding::activity::ActivitySignal;

/// One event from the server: `{type, properties:{sessionID, ...}}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub properties: Value,
    /// The event exactly as received.
    #[serde(skip)]
    pub raw: Value,
}

impl ServerEvent {
    /// Parse a `data:` payload.
    pub fn parse(data: &str) -> Option<Self> {
        let raw: Value = serde_json::from_str(data).ok()?;
        let mut event: ServerEvent = serde_json::from_value(raw.clone()).ok()?;
        event.raw = raw;
        Some(event)
    }

    /// Session the event belongs to, wherever the server nests it.
    pub fn session_id(&self) -> Option<&str> {
        let p = &self.properties;
        p.get("sessionID")
            .or_else(|| p.pointer("/info/sessionID"))
            .or_else(|| p.pointer("/part/sessionID"))
            .or_else(|| p.pointer("/info/id").filter(|_| self.event_type.starts_with("session.")))
            .and_then(Value::as_str)
    }

    pub fn is_session_error(&self) -> bool {
        self.event_type == "session.error"
    }

    /// `session.idle`, or `session.status` whose nested status is idle.
    pub fn is_idle(&self) -> bool {
        self.event_type == "session.idle"
            || (self.event_type == "session.status"
                && self.properties.pointer("/status/type").and_then(Value::as_str) == Some("idle"))
    }

    pub fn is_permission_request(&self) -> bool {
        matches!(
            self.event_type.as_str(),
            "permission.updated" | "permission.asked"
        )
    }

    /// Error text carried by a `session.error`.
    pub fn error_message(&self) -> String {
        let p = &self.properties;
        p.pointer("/error/data/message")
            .or_else(|| p.pointer("/error/message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| p.get("error").map(Value::to_string))
            .unwrap_or_else(|| "unknown session error".to_string())
    }

    /// Map to an activity-monitor signal.
    pub fn to_signal(&self) -> ActivitySignal {
        let session_id = self.session_id().map(str::to_string);
        if self.is_session_error() {
            ActivitySignal::SessionError {
                session_id,
                message: self.error_message(),
            }
        } else {
            ActivitySignal::Activity { session_id }
        }
    }
}

/// Incremental SSE decoder. Feed it raw chunks; it yields `data` payloads of
/// completed events (multi-line data joined with `\n`).
///
/// Bytes are buffered until a full line arrives, so a UTF-8 sequence split
/// across chunks decodes intact. A line that is not valid UTF-8 is dropped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = match String::from_utf8(raw) {
                Ok(line) => line,
                Err(e) => {
                    warn!("Dropping SSE line that is not UTF-8: {}", e);
                    continue;
                }
            };
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
            // `event:`, `id:`, `retry:` and comments carry nothing we use.
        }
        events
    }
}

/// Pump an SSE byte stream into parsed events until it ends or the receiver
/// is dropped.
pub fn spawn_event_pump<S, B>(stream: S, label: &'static str) -> mpsc::Receiver<ServerEvent>
where
    S: futures::Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(async move {
        tokio::pin!(stream);
        let mut decoder = SseDecoder::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    for data in decoder.push(bytes.as_ref()) {
                        match ServerEvent::parse(&data) {
                            Some(event) => {
                                if tx.send(event).await.is_err() {
                                    debug!("{} event receiver dropped", label);
                                    return;
                                }
                            }
                            None => debug!("{} skipped unparseable event", label),
                        }
                    }
                }
                Err(e) => {
                    warn!("{} event stream error: {}", label, e);
                    return;
                }
            }
        }
        debug!("{} event stream ended", label);
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"type\":\"a\"").is_empty());
        let events = decoder.push(b"}\n\ndata: {\"type\":\"b\"}\r\n\r\n");
        assert_eq!(events, vec![r#"{"type":"a"}"#, r#"{"type":"b"}"#]);
    }

    #[test]
    fn test_decoder_keeps_multibyte_char_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let bytes = "data: {\"type\":\"message.part.updated\",\"properties\":{\"text\":\"héllo\"}}\n\n"
            .as_bytes();
        // Split inside the two-byte encoding of `é`.
        let split = bytes.iter().position(|&b| b == 0xC3).unwrap() + 1;

        assert!(decoder.push(&bytes[..split]).is_empty());
        let events = decoder.push(&bytes[split..]);
        assert_eq!(events.len(), 1);

        let event = ServerEvent::parse(&events[0]).unwrap();
        assert_eq!(event.properties["text"], "héllo");
    }

    #[test]
    fn test_decoder_drops_invalid_utf8_line() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: \xff\xfe\ndata: ok\n\n");
        assert_eq!(events, vec!["ok"]);
    }

    #[test]
    fn test_decoder_joins_multiline_data() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": comment\nevent: x\ndata: line1\ndata: line2\n\n");
        assert_eq!(events, vec!["line1\nline2"]);
    }

    #[test]
    fn test_session_id_locations() {
        let direct = ServerEvent::parse(r#"{"type":"session.idle","properties":{"sessionID":"s1"}}"#).unwrap();
        assert_eq!(direct.session_id(), Some("s1"));

        let part = ServerEvent::parse(
            r#"{"type":"message.part.updated","properties":{"part":{"sessionID":"s2"}}}"#,
        )
        .unwrap();
        assert_eq!(part.session_id(), Some("s2"));

        let info = ServerEvent::parse(
            r#"{"type":"message.updated","properties":{"info":{"sessionID":"s3","id":"m1"}}}"#,
        )
        .unwrap();
        assert_eq!(info.session_id(), Some("s3"));
    }

    #[test]
    fn test_idle_signals() {
        let idle = ServerEvent::parse(r#"{"type":"session.idle","properties":{"sessionID":"s"}}"#).unwrap();
        assert!(idle.is_idle());

        let status = ServerEvent::parse(
            r#"{"type":"session.status","properties":{"sessionID":"s","status":{"type":"idle"}}}"#,
        )
        .unwrap();
        assert!(status.is_idle());

        let busy = ServerEvent::parse(
            r#"{"type":"session.status","properties":{"sessionID":"s","status":{"type":"busy"}}}"#,
        )
        .unwrap();
        assert!(!busy.is_idle());
    }

    #[test]
    fn test_session_error_signal() {
        let event = ServerEvent::parse(
            r#"{"type":"session.error","properties":{"sessionID":"s","error":{"name":"ProviderAuthError","data":{"message":"bad key"}}}}"#,
        )
        .unwrap();
        assert_eq!(
            event.to_signal(),
            ActivitySignal::SessionError {
                session_id: Some("s".into()),
                message: "bad key".into()
            }
        );
        assert_eq!(event.raw["properties"]["error"]["name"], "ProviderAuthError");
    }
}
