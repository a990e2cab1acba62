//! One visitor turn: resolve the customer and thread, post the message, start
//! a run, then relay the outcome over server-sent events.
//!
//! Everything up to the run start happens inside the request so failures are
//! plain JSON errors. Polling and relaying happen in a spawned task that owns
//! the only sender of the event channel; the stream closes when it returns,
//! errors and panics included. A disconnected client does not stop the task.

use std::{
    convert::Infallible,
    sync::Arc,
    time::Duration,
};

use assistant_widget::protocol::{ChatMessage, ChatRequest, CustomerInfo, Role, StreamEvent};
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::ApiError,
    provider::{AssistantProvider, ProviderError, Run, RunStatus},
    store::Store,
    types::{now_iso, unix_to_iso, AppState, ConversationThread, Customer},
};

const EVENT_BUFFER: usize = 32;

struct Turn {
    chatbot_id: String,
    session_id: Option<String>,
    customer: CustomerInfo,
    text: String,
}

fn validate(request: ChatRequest) -> Result<Turn, ApiError> {
    let chatbot_id = request.chatbot_id.trim().to_string();
    if chatbot_id.is_empty() {
        return Err(ApiError::bad_request("Chatbot ID is required"));
    }
    let text = request
        .user_text()
        .map(str::to_string)
        .ok_or_else(|| ApiError::bad_request("Message is required"))?;
    let raw = request
        .customer
        .ok_or_else(|| ApiError::bad_request("Customer information is required"))?;
    let customer = CustomerInfo::new(
        &raw.name,
        raw.email.as_deref().unwrap_or_default(),
        raw.phone.as_deref().unwrap_or_default(),
    );
    customer
        .validate()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    Ok(Turn {
        chatbot_id,
        session_id: request
            .session_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty()),
        customer,
        text,
    })
}

/// Finds the customer by email or phone, refreshing name and phone, or
/// creates one. Email is never rewritten on a match.
pub async fn resolve_customer(store: &dyn Store, info: &CustomerInfo) -> Result<Customer, ApiError> {
    let now = now_iso();
    if let Some(existing) = store
        .find_customer(info.email.as_deref(), info.phone.as_deref())
        .await?
    {
        let name = if info.name.is_empty() {
            existing.name.clone()
        } else {
            info.name.clone()
        };
        let phone = info.phone.clone().or_else(|| existing.phone.clone());
        store
            .update_customer_contact(&existing.id, &name, phone.as_deref(), &now)
            .await?;
        debug!(customer_id = %existing.id, "matched existing customer");
        return Ok(Customer {
            name,
            phone,
            updated_at: now,
            ..existing
        });
    }

    let customer = Customer {
        id: Uuid::new_v4().to_string(),
        name: info.name.clone(),
        email: info.email.clone(),
        phone: info.phone.clone(),
        created_at: now.clone(),
        updated_at: now,
    };
    store.insert_customer(&customer).await?;
    info!(customer_id = %customer.id, "customer created");
    Ok(customer)
}

/// Reuses the thread named by `session_id` when it belongs to this customer
/// and assistant, else the customer's latest thread with the assistant, else
/// opens a new provider thread.
async fn resolve_thread(
    store: &dyn Store,
    provider: &dyn AssistantProvider,
    customer: &Customer,
    assistant_id: &str,
    session_id: Option<&str>,
) -> Result<ConversationThread, ApiError> {
    if let Some(session_id) = session_id {
        match store.get_thread(session_id).await? {
            Some(thread) if thread.customer_id == customer.id && thread.assistant_id == assistant_id => {
                return Ok(thread);
            }
            Some(_) => debug!(session_id, "session belongs to another conversation"),
            None => debug!(session_id, "unknown session id"),
        }
    }
    if let Some(thread) = store.latest_thread(&customer.id, assistant_id).await? {
        return Ok(thread);
    }

    let remote = provider.create_thread().await?;
    let thread = ConversationThread {
        id: Uuid::new_v4().to_string(),
        provider_thread_id: remote.id,
        customer_id: customer.id.clone(),
        assistant_id: assistant_id.to_string(),
        created_at: now_iso(),
    };
    store.insert_thread(&thread).await?;
    info!(thread_id = %thread.id, provider_thread_id = %thread.provider_thread_id, "thread opened");
    Ok(thread)
}

pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let turn = validate(request)?;
    let provider = state.provider.clone();

    let customer = resolve_customer(state.store.as_ref(), &turn.customer).await?;
    let thread = resolve_thread(
        state.store.as_ref(),
        provider.as_ref(),
        &customer,
        &turn.chatbot_id,
        turn.session_id.as_deref(),
    )
    .await?;
    provider
        .create_message(&thread.provider_thread_id, &turn.text)
        .await?;
    let run = provider
        .create_run(&thread.provider_thread_id, &turn.chatbot_id)
        .await?;
    info!(
        chatbot_id = %turn.chatbot_id,
        thread_id = %thread.id,
        run_id = %run.id,
        "run started"
    );

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let relay = Relay {
        provider,
        thread,
        poll_interval: state.config.poll_interval,
        poll_timeout: state.config.poll_timeout,
        chunk_delay: state.config.chunk_delay,
        tx,
    };
    tokio::spawn(relay.run(run));

    let stream = ReceiverStream::new(rx).map(|event: StreamEvent| {
        let payload = serde_json::to_string(&event).unwrap_or_else(|err| {
            format!(r#"{{"type":"error","error":"could not encode event: {err}"}}"#)
        });
        Ok(Event::default().data(payload))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

enum RunEnd {
    Settled(Run),
    TimedOut,
}

struct Relay {
    provider: Arc<dyn AssistantProvider>,
    thread: ConversationThread,
    poll_interval: Duration,
    poll_timeout: Duration,
    chunk_delay: Duration,
    tx: mpsc::Sender<StreamEvent>,
}

impl Relay {
    async fn run(self, run: Run) {
        let run_id = run.id.clone();
        let result = match self.wait(run).await {
            Ok(RunEnd::Settled(run)) if run.status == RunStatus::Completed => self.stream_reply().await,
            Ok(RunEnd::Settled(run)) => Err(failure_message(&run)),
            Ok(RunEnd::TimedOut) => {
                if let Err(err) = self
                    .provider
                    .cancel_run(&self.thread.provider_thread_id, &run_id)
                    .await
                {
                    debug!(%run_id, error = %err, "cancel after timeout failed");
                }
                Err(format!(
                    "Run timed out after {} seconds",
                    self.poll_timeout.as_secs_f64()
                ))
            }
            Err(err) => Err(err.to_string()),
        };

        if let Err(error) = result {
            warn!(thread_id = %self.thread.id, %run_id, %error, "chat turn failed");
            self.emit(StreamEvent::Error { error }).await;
        }
    }

    async fn wait(&self, run: Run) -> Result<RunEnd, ProviderError> {
        let thread_id = self.thread.provider_thread_id.as_str();
        let poll = async {
            let mut run = run;
            while run.status.is_pending() {
                tokio::time::sleep(self.poll_interval).await;
                run = self.provider.retrieve_run(thread_id, &run.id).await?;
                debug!(run_id = %run.id, status = run.status.as_str(), "polled run");
            }
            Ok::<_, ProviderError>(run)
        };
        match tokio::time::timeout(self.poll_timeout, poll).await {
            Ok(settled) => settled.map(RunEnd::Settled),
            Err(_) => Ok(RunEnd::TimedOut),
        }
    }

    async fn stream_reply(&self) -> Result<(), String> {
        let messages = self
            .provider
            .list_messages(&self.thread.provider_thread_id)
            .await
            .map_err(|err| err.to_string())?;
        let reply = messages
            .into_iter()
            .find(|message| message.role == Role::Assistant)
            .ok_or_else(|| "Run completed without an assistant reply".to_string())?;
        let content = reply.text();

        for chunk in word_chunks(&content) {
            self.emit(StreamEvent::Chunk { content: chunk }).await;
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
        }
        self.emit(StreamEvent::Done {
            session_id: self.thread.id.clone(),
            message: ChatMessage {
                id: reply.id,
                role: Role::Assistant,
                content,
                created_at: unix_to_iso(reply.created_at),
            },
        })
        .await;
        info!(thread_id = %self.thread.id, "reply relayed");
        Ok(())
    }

    async fn emit(&self, event: StreamEvent) {
        if self.tx.send(event).await.is_err() {
            debug!(thread_id = %self.thread.id, "client went away");
        }
    }
}

fn failure_message(run: &Run) -> String {
    let base = format!("Run failed with status: {}", run.status.as_str());
    match &run.last_error {
        Some(failure) => format!("{base} ({})", failure.message),
        None => base,
    }
}

/// Splits on single spaces so the pieces concatenate back to `content`
/// exactly: the first word bare, every later one prefixed by its space.
fn word_chunks(content: &str) -> Vec<String> {
    content
        .split(' ')
        .enumerate()
        .map(|(index, word)| {
            if index == 0 {
                word.to_string()
            } else {
                format!(" {word}")
            }
        })
        .filter(|chunk| !chunk.is_empty())
        .collect()
}
