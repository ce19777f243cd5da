//! Event framing.
//!
//! ```text
//! id: <id>\n           optional, single line
//! event: <name>\n      optional, single line
//! retry: <ms>\n        optional
//! data: <line>\n       one per input line
//! \n
//! ```

use std::fmt::Write as _;

use serde::Serialize;

use crate::http::headers::strip_crlf;

/// Comment frame written by the keep-alive timer.
pub const HEARTBEAT_FRAME: &str = ": heartbeat\n\n";

/// Payload of an event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    Text(String),
    Json(serde_json::Value),
}

/// One push-protocol event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseMessage {
    id: Option<String>,
    event: Option<String>,
    retry: Option<u64>,
    data: EventData,
}

impl SseMessage {
    pub fn text(data: impl Into<String>) -> Self {
        Self {
            id: None,
            event: None,
            retry: None,
            data: EventData::Text(data.into()),
        }
    }

    /// Event whose data is `value` rendered as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: None,
            event: None,
            retry: None,
            data: EventData::Json(serde_json::to_value(value)?),
        })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// Reconnection delay hint, in milliseconds.
    pub fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn event(&self) -> Option<&str> {
        self.event.as_deref()
    }

    pub fn data(&self) -> &EventData {
        &self.data
    }

    /// Render the wire frame, blank-line terminated.
    pub fn format(&self) -> String {
        let mut out = String::new();
        if let Some(id) = &self.id {
            let _ = writeln!(out, "id: {}", strip_crlf(id));
        }
        if let Some(event) = &self.event {
            let _ = writeln!(out, "event: {}", strip_crlf(event));
        }
        if let Some(retry) = self.retry {
            let _ = writeln!(out, "retry: {retry}");
        }
        match &self.data {
            EventData::Text(text) => {
                for line in split_lines(text) {
                    let _ = writeln!(out, "data: {line}");
                }
            }
            EventData::Json(value) => {
                let _ = writeln!(out, "data: {value}");
            }
        }
        out.push('\n');
        out
    }
}

impl From<&str> for SseMessage {
    fn from(text: &str) -> Self {
        SseMessage::text(text)
    }
}

impl From<String> for SseMessage {
    fn from(text: String) -> Self {
        SseMessage::text(text)
    }
}

/// Split on `\r\n`, `\r` or `\n`. Always yields at least one line.
pub fn split_lines(text: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let bytes = text.as_bytes();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\r' => {
                lines.push(&text[start..i]);
                i += if bytes.get(i + 1) == Some(&b'\n') { 2 } else { 1 };
                start = i;
            }
            b'\n' => {
                lines.push(&text[start..i]);
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }
    lines.push(&text[start..]);
    lines
}
