//! Widget session state machine and its durable cache.
//!
//! Everything the widget remembers about a visitor lives behind
//! [`SessionStore`], keyed per chatbot: the server-issued session id, the
//! visitor identity and the message history of the current session.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::{
    protocol::{ChatRequest, CustomerInfo, Role, StreamEvent},
    WidgetError,
};

pub const GREETING: &str = "Hi there! How can I help you today?";
pub const WELCOME_BACK: &str = "Welcome back! How can I help you today?";
pub const APOLOGY: &str = "Sorry, I encountered an error. Please try again later.";

pub fn session_key(chatbot_id: &str) -> String {
    format!("chatbot_session_{chatbot_id}")
}

pub fn customer_key(chatbot_id: &str) -> String {
    format!("chatbot_customer_{chatbot_id}")
}

pub fn messages_key(chatbot_id: &str, session_id: Option<&str>) -> String {
    format!("chatbot_messages_{chatbot_id}_{}", session_id.unwrap_or("none"))
}

/// Durable string key-value storage, the equivalent of browser local storage.
pub trait SessionStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: String) -> Result<(), WidgetError>;
    fn remove(&mut self, key: &str) -> Result<(), WidgetError>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) -> Result<(), WidgetError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), WidgetError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// JSON-file backed store. Every write rewrites the whole file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WidgetError> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)?,
            Ok(_) => BTreeMap::new(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, entries })
    }

    fn flush(&self) -> Result<(), WidgetError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, serde_json::to_string_pretty(&self.entries)?)?;
        Ok(())
    }
}

impl SessionStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) -> Result<(), WidgetError> {
        self.entries.insert(key.to_string(), value);
        self.flush()
    }

    fn remove(&mut self, key: &str) -> Result<(), WidgetError> {
        if self.entries.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetState {
    Unidentified,
    CollectingIdentity,
    Active,
    AwaitingReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendRejected {
    #[error("a reply is still streaming")]
    Busy,
    #[error("message is empty")]
    Empty,
    #[error("visitor has not identified yet")]
    NotIdentified,
}

/// What a stream event did to the conversation, for rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Streaming(String),
    Completed(String),
    Failed(String),
    Ignored,
}

pub struct WidgetSession<S: SessionStore> {
    store: S,
    chatbot_id: String,
    state: WidgetState,
    session_id: Option<String>,
    customer: Option<CustomerInfo>,
    history: Vec<HistoryEntry>,
    transcript: Vec<HistoryEntry>,
    streaming: String,
}

impl<S: SessionStore> WidgetSession<S> {
    /// Restores the visitor from `store`. Never touches the network: a
    /// returning visitor gets their cached history replayed as-is.
    pub fn load(store: S, chatbot_id: &str) -> Self {
        let mut session = Self {
            store,
            chatbot_id: chatbot_id.to_string(),
            state: WidgetState::Unidentified,
            session_id: None,
            customer: None,
            history: Vec::new(),
            transcript: Vec::new(),
            streaming: String::new(),
        };

        session.session_id = session
            .store
            .get(&session_key(chatbot_id))
            .filter(|id| !id.trim().is_empty());
        session.customer = session
            .store
            .get(&customer_key(chatbot_id))
            .and_then(|raw| serde_json::from_str::<CustomerInfo>(&raw).ok())
            .filter(CustomerInfo::has_contact);

        if session.customer.is_none() {
            session.state = WidgetState::CollectingIdentity;
            return session;
        }

        session.history = session
            .store
            .get(&messages_key(chatbot_id, session.session_id.as_deref()))
            .and_then(|raw| serde_json::from_str::<Vec<HistoryEntry>>(&raw).ok())
            .unwrap_or_default();
        if session.history.is_empty() {
            session.push_display(Role::Assistant, WELCOME_BACK);
        } else {
            session.transcript = session.history.clone();
        }
        debug!(
            chatbot_id,
            session_id = ?session.session_id,
            restored = session.history.len(),
            "restored widget session"
        );
        session.state = WidgetState::Active;
        session
    }

    pub fn state(&self) -> WidgetState {
        self.state
    }

    pub fn chatbot_id(&self) -> &str {
        &self.chatbot_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn customer(&self) -> Option<&CustomerInfo> {
        self.customer.as_ref()
    }

    /// Messages as shown in the chat window, greetings and apologies included.
    pub fn transcript(&self) -> &[HistoryEntry] {
        &self.transcript
    }

    /// The persisted conversation, oldest first.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn streaming_text(&self) -> &str {
        &self.streaming
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn submit_identity(
        &mut self,
        name: &str,
        email: &str,
        phone: &str,
    ) -> Result<(), WidgetError> {
        let customer = CustomerInfo::new(name, email, phone);
        customer.validate()?;
        self.store.set(
            &customer_key(&self.chatbot_id),
            serde_json::to_string(&customer)?,
        )?;
        self.customer = Some(customer);
        self.state = WidgetState::Active;
        self.push_display(Role::Assistant, GREETING);
        Ok(())
    }

    /// Records the user turn and enters `AwaitingReply`. The returned request
    /// is what the widget posts to the relay.
    pub fn begin_send(&mut self, text: &str) -> Result<ChatRequest, SendRejected> {
        match self.state {
            WidgetState::AwaitingReply => return Err(SendRejected::Busy),
            WidgetState::Unidentified | WidgetState::CollectingIdentity => {
                return Err(SendRejected::NotIdentified)
            }
            WidgetState::Active => {}
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(SendRejected::Empty);
        }

        let entry = HistoryEntry {
            role: Role::User,
            content: text.to_string(),
        };
        self.history.push(entry.clone());
        self.transcript.push(entry);
        self.streaming.clear();
        self.state = WidgetState::AwaitingReply;

        Ok(ChatRequest {
            chatbot_id: self.chatbot_id.clone(),
            session_id: self.session_id.clone(),
            customer: self.customer.clone(),
            messages: vec![text.to_string()],
            message: None,
        })
    }

    pub fn apply_event(&mut self, event: StreamEvent) -> Result<EventOutcome, WidgetError> {
        if self.state != WidgetState::AwaitingReply {
            return Ok(EventOutcome::Ignored);
        }
        match event {
            StreamEvent::Chunk { content } => {
                self.streaming.push_str(&content);
                Ok(EventOutcome::Streaming(self.streaming.clone()))
            }
            StreamEvent::Done {
                session_id,
                message,
            } => {
                self.streaming.clear();
                if self.session_id.is_none() && !session_id.is_empty() {
                    self.store
                        .set(&session_key(&self.chatbot_id), session_id.clone())?;
                    self.session_id = Some(session_id);
                }
                let entry = HistoryEntry {
                    role: Role::Assistant,
                    content: message.content.clone(),
                };
                self.history.push(entry.clone());
                self.transcript.push(entry);
                self.state = WidgetState::Active;
                self.persist_history()?;
                Ok(EventOutcome::Completed(message.content))
            }
            StreamEvent::Error { error } => {
                debug!(chatbot_id = %self.chatbot_id, %error, "relay reported an error");
                self.fail_send();
                Ok(EventOutcome::Failed(error))
            }
        }
    }

    /// The request itself failed or the stream ended without a terminal
    /// event. Input is re-enabled either way.
    pub fn fail_send(&mut self) {
        self.streaming.clear();
        self.push_display(Role::Assistant, APOLOGY);
        self.state = WidgetState::Active;
    }

    pub fn export_json(&self) -> serde_json::Value {
        json!({
            "chatbot_id": self.chatbot_id,
            "session_id": self.session_id,
            "customer": self.customer,
            "exported_at": Utc::now().to_rfc3339(),
            "messages": self.history,
        })
    }

    pub fn logout(&mut self) -> Result<(), WidgetError> {
        self.store
            .remove(&messages_key(&self.chatbot_id, self.session_id.as_deref()))?;
        self.store.remove(&session_key(&self.chatbot_id))?;
        self.store.remove(&customer_key(&self.chatbot_id))?;
        self.session_id = None;
        self.customer = None;
        self.history.clear();
        self.transcript.clear();
        self.streaming.clear();
        self.state = WidgetState::CollectingIdentity;
        Ok(())
    }

    fn persist_history(&mut self) -> Result<(), WidgetError> {
        let key = messages_key(&self.chatbot_id, self.session_id.as_deref());
        self.store.set(&key, serde_json::to_string(&self.history)?)
    }

    fn push_display(&mut self, role: Role, content: &str) {
        self.transcript.push(HistoryEntry {
            role,
            content: content.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChatMessage, IdentityError};

    fn done(session_id: &str, content: &str) -> StreamEvent {
        StreamEvent::Done {
            session_id: session_id.to_string(),
            message: ChatMessage {
                id: "msg_a".to_string(),
                role: Role::Assistant,
                content: content.to_string(),
                created_at: "2024-05-01T10:00:00Z".to_string(),
            },
        }
    }

    fn identified() -> WidgetSession<MemoryStore> {
        let mut session = WidgetSession::load(MemoryStore::new(), "asst_1");
        session
            .submit_identity("Ada", "ada@example.com", "")
            .unwrap();
        session
    }

    #[test]
    fn first_visit_collects_identity() {
        let session = WidgetSession::load(MemoryStore::new(), "asst_1");
        assert_eq!(session.state(), WidgetState::CollectingIdentity);
        assert!(session.transcript().is_empty());
    }

    #[test]
    fn malformed_email_keeps_the_form_open() {
        let mut session = WidgetSession::load(MemoryStore::new(), "asst_1");
        let err = session
            .submit_identity("Ada", "ada@example", "")
            .unwrap_err();
        assert!(matches!(
            err,
            WidgetError::Identity(IdentityError::InvalidEmail)
        ));
        assert_eq!(err.to_string(), "Invalid email address");
        assert_eq!(session.state(), WidgetState::CollectingIdentity);
        assert!(session.customer().is_none());
        assert!(session.transcript().is_empty());

        let store = session.into_store();
        assert!(store.get(&customer_key("asst_1")).is_none());
    }

    #[test]
    fn identity_needs_name_and_one_contact() {
        let mut session = WidgetSession::load(MemoryStore::new(), "asst_1");
        assert!(matches!(
            session.submit_identity("  ", "a@b.c", ""),
            Err(WidgetError::Identity(_))
        ));
        assert!(matches!(
            session.submit_identity("Ada", " ", ""),
            Err(WidgetError::Identity(_))
        ));
        assert_eq!(session.state(), WidgetState::CollectingIdentity);

        session.submit_identity("Ada", "", "+62 811").unwrap();
        assert_eq!(session.state(), WidgetState::Active);
        assert_eq!(session.transcript()[0].content, GREETING);
        assert_eq!(session.customer().unwrap().phone.as_deref(), Some("+62 811"));
    }

    #[test]
    fn second_send_is_dropped_while_awaiting_reply() {
        let mut session = identified();
        let request = session.begin_send("hello").unwrap();
        assert_eq!(request.messages, vec!["hello".to_string()]);
        assert_eq!(request.session_id, None);
        assert_eq!(session.begin_send("again"), Err(SendRejected::Busy));
        assert_eq!(session.history().len(), 1);
    }

    #[test]
    fn chunks_accumulate_until_done() {
        let mut session = identified();
        session.begin_send("hello").unwrap();
        for piece in ["Hi", " there", "!"] {
            session
                .apply_event(StreamEvent::Chunk {
                    content: piece.to_string(),
                })
                .unwrap();
        }
        assert_eq!(session.streaming_text(), "Hi there!");

        let outcome = session.apply_event(done("thread-9", "Hi there!")).unwrap();
        assert_eq!(outcome, EventOutcome::Completed("Hi there!".to_string()));
        assert_eq!(session.state(), WidgetState::Active);
        assert_eq!(session.session_id(), Some("thread-9"));
        assert!(session.streaming_text().is_empty());
    }

    #[test]
    fn error_event_reenables_input_with_apology() {
        let mut session = identified();
        session.begin_send("hello").unwrap();
        let outcome = session
            .apply_event(StreamEvent::Error {
                error: "Run failed with status: failed".to_string(),
            })
            .unwrap();
        assert!(matches!(outcome, EventOutcome::Failed(_)));
        assert_eq!(session.state(), WidgetState::Active);
        assert_eq!(session.transcript().last().unwrap().content, APOLOGY);
        assert!(session.begin_send("retry").is_ok());
    }

    #[test]
    fn events_outside_a_turn_are_ignored() {
        let mut session = identified();
        let outcome = session.apply_event(done("thread-1", "late")).unwrap();
        assert_eq!(outcome, EventOutcome::Ignored);
        assert!(session.history().is_empty());
    }

    #[test]
    fn reload_replays_cached_history_in_order() {
        let mut session = identified();
        session.begin_send("first").unwrap();
        session.apply_event(done("thread-1", "one")).unwrap();
        session.begin_send("second").unwrap();
        session.apply_event(done("thread-1", "two")).unwrap();
        let before = session.history().to_vec();

        let restored = WidgetSession::load(session.into_store(), "asst_1");
        assert_eq!(restored.state(), WidgetState::Active);
        assert_eq!(restored.session_id(), Some("thread-1"));
        assert_eq!(restored.history(), before.as_slice());
        assert_eq!(restored.transcript(), before.as_slice());

        let request_session = {
            let mut restored = restored;
            restored.begin_send("third").unwrap().session_id
        };
        assert_eq!(request_session.as_deref(), Some("thread-1"));
    }

    #[test]
    fn returning_visitor_without_history_is_welcomed_back() {
        let mut store = MemoryStore::new();
        store
            .set(
                &customer_key("asst_1"),
                r#"{"name":"Ada","email":"ada@example.com"}"#.to_string(),
            )
            .unwrap();
        let session = WidgetSession::load(store, "asst_1");
        assert_eq!(session.state(), WidgetState::Active);
        assert_eq!(session.transcript()[0].content, WELCOME_BACK);
    }

    #[test]
    fn export_is_chronological() {
        let mut session = identified();
        session.begin_send("question").unwrap();
        session.apply_event(done("thread-1", "answer")).unwrap();
        let exported = session.export_json();
        let messages = exported["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"], "question");
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(exported["session_id"], "thread-1");
    }

    #[test]
    fn logout_forgets_the_visitor() {
        let mut session = identified();
        session.begin_send("question").unwrap();
        session.apply_event(done("thread-1", "answer")).unwrap();
        session.logout().unwrap();
        assert_eq!(session.state(), WidgetState::CollectingIdentity);

        let reloaded = WidgetSession::load(session.into_store(), "asst_1");
        assert_eq!(reloaded.state(), WidgetState::CollectingIdentity);
        assert!(reloaded.history().is_empty());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("widget.json");
        {
            let mut session = WidgetSession::load(FileStore::open(&path).unwrap(), "asst_1");
            session.submit_identity("Ada", "ada@example.com", "").unwrap();
            session.begin_send("hello").unwrap();
            session.apply_event(done("thread-3", "hi")).unwrap();
        }
        let session = WidgetSession::load(FileStore::open(&path).unwrap(), "asst_1");
        assert_eq!(session.session_id(), Some("thread-3"));
        assert_eq!(session.history().len(), 2);
    }
}
