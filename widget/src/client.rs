use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    protocol::{ChatRequest, SseDecoder},
    session::{EventOutcome, SessionStore, WidgetSession},
    WidgetError,
};

/// Public configuration returned by the pre-flight check.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatbotProfile {
    pub valid: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    host: String,
}

impl RelayClient {
    pub fn new(host: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            host: host.trim_end_matches('/').to_string(),
        }
    }

    pub async fn verify(&self, chatbot_id: &str) -> Result<ChatbotProfile, WidgetError> {
        let profile = self
            .http
            .get(format!("{}/api/verify-chatbot", self.host))
            .query(&[("id", chatbot_id)])
            .send()
            .await?
            .json::<ChatbotProfile>()
            .await?;
        if !profile.valid {
            return Err(WidgetError::InvalidChatbot(
                chatbot_id.to_string(),
                profile.error.unwrap_or_default(),
            ));
        }
        Ok(profile)
    }

    /// Sends one visitor message and feeds the relayed reply into `session`,
    /// calling `render` for every event. The session always leaves
    /// `AwaitingReply`, whatever happens to the request.
    pub async fn send_turn<S, F>(
        &self,
        session: &mut WidgetSession<S>,
        text: &str,
        mut render: F,
    ) -> Result<(), WidgetError>
    where
        S: SessionStore,
        F: FnMut(&EventOutcome),
    {
        let request = session.begin_send(text)?;
        match self.relay(&request, session, &mut render).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!("reply stream closed without a terminal event");
                session.fail_send();
                render(&EventOutcome::Failed(
                    "stream ended before the reply completed".to_string(),
                ));
                Ok(())
            }
            Err(err) => {
                session.fail_send();
                Err(err)
            }
        }
    }

    async fn relay<S, F>(
        &self,
        request: &ChatRequest,
        session: &mut WidgetSession<S>,
        render: &mut F,
    ) -> Result<bool, WidgetError>
    where
        S: SessionStore,
        F: FnMut(&EventOutcome),
    {
        let response = self
            .http
            .post(format!("{}/api/chatbot", self.host))
            .json(request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| body.get("error").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| status.to_string());
            return Err(WidgetError::Server {
                status: status.as_u16(),
                message,
            });
        }

        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();
        while let Some(bytes) = body.next().await {
            for decoded in decoder.feed(&bytes?) {
                match decoded {
                    Ok(event) => {
                        let terminal = event.is_terminal();
                        let outcome = session.apply_event(event)?;
                        render(&outcome);
                        if terminal {
                            return Ok(true);
                        }
                    }
                    Err(err) => warn!(%err, "skipping malformed frame"),
                }
            }
        }
        if let Some(Ok(event)) = decoder.finish() {
            let terminal = event.is_terminal();
            render(&session.apply_event(event)?);
            return Ok(terminal);
        }
        debug!("relay stream ended");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        http::{header, StatusCode},
        routing::post,
        Router,
    };
    use tokio::net::TcpListener;

    use super::*;
    use crate::{
        protocol::{encode_frame, ChatMessage, Role, StreamEvent},
        session::{MemoryStore, WidgetState},
    };

    /// Serves a fixed reply on `/api/chatbot` from an ephemeral port.
    async fn relay_stub(status: StatusCode, content_type: &'static str, body: String) -> String {
        let app = Router::new().route(
            "/api/chatbot",
            post(move || {
                let body = body.clone();
                async move { (status, [(header::CONTENT_TYPE, content_type)], body) }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn identified() -> WidgetSession<MemoryStore> {
        let mut session = WidgetSession::load(MemoryStore::new(), "asst_1");
        session.submit_identity("Ada", "ada@example.com", "").unwrap();
        session
    }

    #[tokio::test]
    async fn streamed_reply_lands_in_history() {
        let mut body = String::new();
        for content in ["Hello", " world"] {
            body.push_str(&encode_frame(&StreamEvent::Chunk {
                content: content.to_string(),
            }));
        }
        body.push_str(&encode_frame(&StreamEvent::Done {
            session_id: "thread-1".to_string(),
            message: ChatMessage {
                id: "msg_1".to_string(),
                role: Role::Assistant,
                content: "Hello world".to_string(),
                created_at: "2024-05-01T10:00:00Z".to_string(),
            },
        }));
        let host = relay_stub(StatusCode::OK, "text/event-stream", body).await;

        let client = RelayClient::new(&host);
        let mut session = identified();
        let mut seen = Vec::new();
        client
            .send_turn(&mut session, "hi", |outcome| seen.push(outcome.clone()))
            .await
            .unwrap();

        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1], EventOutcome::Streaming("Hello world".to_string()));
        assert_eq!(session.state(), WidgetState::Active);
        assert_eq!(session.session_id(), Some("thread-1"));
        assert_eq!(session.history().last().unwrap().content, "Hello world");
    }

    #[tokio::test]
    async fn rejected_request_reenables_input() {
        let host = relay_stub(
            StatusCode::BAD_REQUEST,
            "application/json",
            r#"{"error":"Chatbot ID is required","details":null}"#.to_string(),
        )
        .await;

        let client = RelayClient::new(&host);
        let mut session = identified();
        let err = client
            .send_turn(&mut session, "hi", |_| {})
            .await
            .unwrap_err();
        match err {
            WidgetError::Server { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "Chatbot ID is required");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(session.state(), WidgetState::Active);
    }
}
