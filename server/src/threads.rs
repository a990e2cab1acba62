use std::sync::Arc;

use assistant_widget::protocol::ChatMessage;
use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    error::ApiError,
    provider::RemoteMessage,
    types::{now_iso, unix_to_iso, AppState, ConversationThread},
};

fn to_chat_message(message: RemoteMessage) -> ChatMessage {
    ChatMessage {
        content: message.text(),
        created_at: unix_to_iso(message.created_at),
        id: message.id,
        role: message.role,
    }
}

async fn thread_or_404(state: &AppState, thread_id: &str) -> Result<ConversationThread, ApiError> {
    state
        .store
        .get_thread(thread_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Thread not found"))
}

/// Provider history for a thread, newest first as the provider returns it.
async fn fetch_messages(state: &AppState, thread: &ConversationThread) -> Result<Vec<ChatMessage>, ApiError> {
    let messages = state
        .provider
        .list_messages(&thread.provider_thread_id)
        .await?;
    debug!(thread_id = %thread.id, count = messages.len(), "fetched thread messages");
    Ok(messages.into_iter().map(to_chat_message).collect())
}

pub async fn list_threads(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let threads = state.store.list_threads().await?;
    Ok(Json(json!({ "data": threads })))
}

pub async fn thread_messages(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let thread = thread_or_404(&state, &thread_id).await?;
    let messages = fetch_messages(&state, &thread).await?;
    Ok(Json(json!({ "data": messages })))
}

pub async fn export_thread(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let thread = thread_or_404(&state, &thread_id).await?;
    let customer = state.store.get_customer(&thread.customer_id).await?;
    let mut messages = fetch_messages(&state, &thread).await?;
    messages.reverse();
    Ok(Json(json!({
        "thread_id": thread.id,
        "assistant_id": thread.assistant_id,
        "customer": customer,
        "exported_at": now_iso(),
        "messages": messages,
    })))
}
