//! Client side of the assistant chat relay.
//!
//! `protocol` holds the wire types shared with the server, `session` the
//! widget state machine with its durable key-value cache, and `client` an
//! HTTP client that drives both against a running server.

pub mod client;
pub mod protocol;
pub mod session;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WidgetError {
    #[error("malformed stream frame: {0}")]
    Frame(String),

    #[error("session storage failed: {0}")]
    Storage(#[from] std::io::Error),

    #[error("invalid stored value: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("{0}")]
    Identity(#[from] protocol::IdentityError),

    #[error("message not sent: {0}")]
    Rejected(#[from] session::SendRejected),

    #[error("chatbot {0} is not available: {1}")]
    InvalidChatbot(String, String),
}
