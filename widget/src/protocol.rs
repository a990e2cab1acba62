//! Chat relay wire format shared by the server (producer) and widgets
//! (consumers).
//!
//! Every event travels as one server-sent-events frame: `data: ` followed by
//! a single-line JSON object and a blank line.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::WidgetError;

pub const DATA_PREFIX: &str = "data: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: String,
}

/// Visitor identity as collected by the widget. Empty strings from the form
/// are normalised to `None` by [`CustomerInfo::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl CustomerInfo {
    pub fn new(name: &str, email: &str, phone: &str) -> Self {
        fn non_empty(value: &str) -> Option<String> {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        }
        Self {
            name: name.trim().to_string(),
            email: non_empty(email),
            phone: non_empty(phone),
        }
    }

    pub fn has_contact(&self) -> bool {
        self.email.is_some() || self.phone.is_some()
    }

    /// The checks the relay applies before opening a conversation.
    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.name.is_empty() {
            return Err(IdentityError::MissingName);
        }
        if !self.has_contact() {
            return Err(IdentityError::MissingContact);
        }
        if let (Some(email), Some(pattern)) = (self.email.as_deref(), email_pattern()) {
            if !pattern.is_match(email) {
                return Err(IdentityError::InvalidEmail);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("Customer name is required")]
    MissingName,
    #[error("Either email or phone is required")]
    MissingContact,
    #[error("Invalid email address")]
    InvalidEmail,
}

fn email_pattern() -> Option<&'static Regex> {
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    EMAIL
        .get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").ok())
        .as_ref()
}

/// Body of `POST /api/chatbot`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub chatbot_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub customer: Option<CustomerInfo>,
    #[serde(default)]
    pub messages: Vec<String>,
    /// Single-message shorthand accepted alongside `messages`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ChatRequest {
    /// The user turn: the last non-blank entry of `messages`, else `message`.
    pub fn user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .map(|text| text.trim())
            .find(|text| !text.is_empty())
            .or_else(|| {
                self.message
                    .as_deref()
                    .map(str::trim)
                    .filter(|text| !text.is_empty())
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    /// Incremental text. Concatenating every chunk of a turn yields the
    /// content of the closing `done` message.
    Chunk { content: String },
    Done {
        session_id: String,
        message: ChatMessage,
    },
    Error { error: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Chunk { .. })
    }
}

pub fn encode_frame(event: &StreamEvent) -> String {
    let payload = serde_json::to_string(event)
        .unwrap_or_else(|_| r#"{"type":"error","error":"unserializable event"}"#.to_string());
    format!("{DATA_PREFIX}{payload}\n\n")
}

/// Splits an arbitrary byte stream into decoded events.
///
/// Network reads do not respect frame boundaries, so incomplete trailing
/// lines are kept until the next `feed` call.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    pending_bytes: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<StreamEvent, WidgetError>> {
        self.pending_bytes.extend_from_slice(bytes);
        let valid_up_to = match std::str::from_utf8(&self.pending_bytes) {
            Ok(text) => text.len(),
            // Only a truncated trailing sequence is held back; invalid bytes
            // are decoded lossily.
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            Err(_) => self.pending_bytes.len(),
        };
        let rest = self.pending_bytes.split_off(valid_up_to);
        let decoded = std::mem::replace(&mut self.pending_bytes, rest);
        self.buffer.push_str(&String::from_utf8_lossy(&decoded));

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line = self.buffer[..newline].trim_end_matches('\r').to_string();
            self.buffer.drain(..=newline);
            if let Some(event) = decode_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes a final unterminated line, if the stream ended without one.
    pub fn finish(&mut self) -> Option<Result<StreamEvent, WidgetError>> {
        let line = std::mem::take(&mut self.buffer);
        decode_line(line.trim_end_matches('\r'))
    }
}

fn decode_line(line: &str) -> Option<Result<StreamEvent, WidgetError>> {
    let payload = line.strip_prefix(DATA_PREFIX)?;
    Some(
        serde_json::from_str::<StreamEvent>(payload)
            .map_err(|err| WidgetError::Frame(format!("{err}: {payload}"))),
    )
}
