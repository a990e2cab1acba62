use std::{collections::HashSet, sync::Arc};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::{
    error::ApiError,
    provider::{AssistantProvider, AssistantSpec, ProviderError, RemoteAssistant, ToolSpec, VectorStoreFile},
    types::{
        default_response_format, now_iso, AppState, Assistant, AssistantBody, AssistantQuery,
        IdQuery, SyncStatus,
    },
    widget::embed_snippet,
};

const DEFAULT_TEMPERATURE: f64 = 0.7;
const DEFAULT_TOP_P: f64 = 1.0;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantView {
    #[serde(flatten)]
    assistant: Assistant,
    embed_snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<Vec<VectorStoreFile>>,
}

impl AssistantView {
    fn new(state: &AppState, assistant: Assistant) -> Self {
        Self {
            embed_snippet: embed_snippet(&state.config.public_base_url, &assistant.id),
            assistant,
            files: None,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ReconcileReport {
    pub resumed_deletes: usize,
    pub refreshed: usize,
    pub dropped: usize,
    pub failed: usize,
}

/// Validated form of an [`AssistantBody`].
struct Validated {
    spec: AssistantSpec,
    tools: Vec<String>,
    file_ids: Vec<String>,
}

/// `retrieval` is the admin-facing name of the provider's `file_search` tool.
fn provider_tool(name: &str) -> Option<&'static str> {
    match name {
        "retrieval" | "file_search" => Some("file_search"),
        "code_interpreter" => Some("code_interpreter"),
        _ => None,
    }
}

fn admin_tool(kind: &str) -> String {
    match kind {
        "file_search" => "retrieval".to_string(),
        other => other.to_string(),
    }
}

fn dedup(values: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty() && seen.insert(value.clone()))
        .collect()
}

fn validate(body: AssistantBody) -> Result<Validated, ApiError> {
    if body
        .openai_api_key
        .as_deref()
        .is_some_and(|key| !key.trim().is_empty())
    {
        return Err(ApiError::bad_request(
            "openai_api_key is not accepted; assistants are managed with the server key",
        ));
    }
    let name = body.name.trim().to_string();
    let instructions = body.instructions.trim().to_string();
    let model = body.model.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::bad_request("Name is required"));
    }
    if instructions.is_empty() {
        return Err(ApiError::bad_request("Instructions are required"));
    }
    if model.is_empty() {
        return Err(ApiError::bad_request("Model is required"));
    }

    let temperature = body.temperature.unwrap_or(DEFAULT_TEMPERATURE);
    if !(0.0..=2.0).contains(&temperature) {
        return Err(ApiError::bad_request("Temperature must be between 0 and 2"));
    }
    let top_p = body.top_p.unwrap_or(DEFAULT_TOP_P);
    if !(0.0..=1.0).contains(&top_p) {
        return Err(ApiError::bad_request("Top P must be between 0 and 1"));
    }

    let response_format = match body.response_format {
        None | Some(Value::Null) => default_response_format(),
        Some(Value::String(mode)) if mode == "auto" => Value::String(mode),
        Some(format @ Value::Object(_)) if format.get("type").is_some_and(Value::is_string) => format,
        Some(_) => {
            return Err(ApiError::bad_request(
                "response_format must be \"auto\" or an object with a type",
            ))
        }
    };

    let tools = dedup(body.tools);
    let mut provider_tools: Vec<ToolSpec> = Vec::new();
    for tool in &tools {
        let kind = provider_tool(tool)
            .ok_or_else(|| ApiError::bad_request(format!("Unsupported tool: {tool}")))?;
        if !provider_tools.iter().any(|existing| existing.kind == kind) {
            provider_tools.push(ToolSpec {
                kind: kind.to_string(),
            });
        }
    }

    Ok(Validated {
        spec: AssistantSpec {
            name,
            instructions,
            model,
            tools: provider_tools,
            temperature,
            top_p,
            response_format,
            vector_store_id: None,
        },
        tools,
        file_ids: dedup(body.file_ids),
    })
}

async fn drop_vector_store(provider: &dyn AssistantProvider, vector_store_id: &str) -> Result<(), ProviderError> {
    match provider.delete_vector_store(vector_store_id).await {
        Err(err) if err.is_not_found() => {
            debug!(vector_store_id, "vector store already gone");
            Ok(())
        }
        other => other,
    }
}

pub async fn create_assistant(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AssistantBody>,
) -> Result<Json<AssistantView>, ApiError> {
    let Validated {
        mut spec,
        tools,
        file_ids,
    } = validate(body)?;
    let provider = state.provider.clone();

    if !file_ids.is_empty() {
        let store = provider
            .create_vector_store(&format!("{} knowledge", spec.name), &file_ids)
            .await?;
        spec.vector_store_id = Some(store.id);
    }

    let remote = match provider.create_assistant(&spec).await {
        Ok(remote) => remote,
        Err(err) => {
            if let Some(vector_store_id) = spec.vector_store_id.as_deref() {
                if let Err(cleanup) = drop_vector_store(provider.as_ref(), vector_store_id).await {
                    warn!(vector_store_id, error = %cleanup, "orphaned vector store after failed create");
                }
            }
            return Err(err.into());
        }
    };

    let now = now_iso();
    let assistant = Assistant {
        id: remote.id.clone(),
        name: spec.name,
        instructions: spec.instructions,
        model: spec.model,
        tools,
        temperature: spec.temperature,
        top_p: spec.top_p,
        response_format: spec.response_format,
        file_ids,
        vector_store_id: spec.vector_store_id,
        sync_status: SyncStatus::Active,
        created_at: now.clone(),
        updated_at: now,
    };

    if let Err(err) = state.store.insert_assistant(&assistant).await {
        error!(assistant_id = %assistant.id, error = %err, "local insert failed, removing remote assistant");
        if let Err(cleanup) = provider.delete_assistant(&assistant.id).await {
            warn!(assistant_id = %assistant.id, error = %cleanup, "could not remove remote assistant");
        }
        if let Some(vector_store_id) = assistant.vector_store_id.as_deref() {
            if let Err(cleanup) = drop_vector_store(provider.as_ref(), vector_store_id).await {
                warn!(vector_store_id, error = %cleanup, "could not remove vector store");
            }
        }
        return Err(err.into());
    }

    info!(assistant_id = %assistant.id, model = %assistant.model, files = assistant.file_ids.len(), "assistant created");
    Ok(Json(AssistantView::new(&state, assistant)))
}

pub async fn update_assistant(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AssistantQuery>,
    Json(body): Json<AssistantBody>,
) -> Result<Json<AssistantView>, ApiError> {
    let id = query
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Assistant ID is required"))?;
    let existing = state
        .store
        .get_assistant(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("Assistant not found"))?;
    if existing.sync_status == SyncStatus::Deleting {
        return Err(ApiError::bad_request("Assistant is being deleted"));
    }

    let Validated {
        mut spec,
        tools,
        file_ids,
    } = validate(body)?;
    let provider = state.provider.clone();

    state
        .store
        .set_assistant_status(&id, SyncStatus::Pending, &now_iso())
        .await?;

    let old_files: HashSet<&String> = existing.file_ids.iter().collect();
    let new_files: HashSet<&String> = file_ids.iter().collect();
    let files_changed = old_files != new_files;

    let mut created_store = None;
    spec.vector_store_id = if !files_changed {
        existing.vector_store_id.clone()
    } else if file_ids.is_empty() {
        None
    } else {
        let store = provider
            .create_vector_store(&format!("{} knowledge", spec.name), &file_ids)
            .await?;
        created_store = Some(store.id.clone());
        Some(store.id)
    };

    if let Err(err) = provider.update_assistant(&id, &spec).await {
        if let Some(vector_store_id) = created_store.as_deref() {
            if let Err(cleanup) = drop_vector_store(provider.as_ref(), vector_store_id).await {
                warn!(vector_store_id, error = %cleanup, "orphaned vector store after failed update");
            }
        }
        warn!(assistant_id = %id, error = %err, "remote update failed, row left pending");
        return Err(err.into());
    }

    if files_changed {
        if let Some(old_store) = existing.vector_store_id.as_deref() {
            if let Err(err) = drop_vector_store(provider.as_ref(), old_store).await {
                warn!(vector_store_id = old_store, error = %err, "could not remove replaced vector store");
            }
        }
    }

    let assistant = Assistant {
        id: id.clone(),
        name: spec.name,
        instructions: spec.instructions,
        model: spec.model,
        tools,
        temperature: spec.temperature,
        top_p: spec.top_p,
        response_format: spec.response_format,
        file_ids,
        vector_store_id: spec.vector_store_id,
        sync_status: SyncStatus::Active,
        created_at: existing.created_at,
        updated_at: now_iso(),
    };
    state.store.update_assistant(&assistant).await?;
    info!(assistant_id = %id, files_changed, "assistant updated");

    Ok(Json(AssistantView::new(&state, assistant)))
}

/// Removes the remote pair and then the local row. Resumable: provider 404s
/// count as already removed.
async fn finish_delete(
    state: &AppState,
    provider: &dyn AssistantProvider,
    assistant: &Assistant,
) -> Result<(), ApiError> {
    if let Some(vector_store_id) = assistant.vector_store_id.as_deref() {
        drop_vector_store(provider, vector_store_id).await?;
    }
    match provider.delete_assistant(&assistant.id).await {
        Err(err) if err.is_not_found() => {
            debug!(assistant_id = %assistant.id, "remote assistant already gone");
        }
        other => other?,
    }
    state.store.delete_assistant(&assistant.id).await?;
    Ok(())
}

pub async fn delete_assistant(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IdQuery>,
) -> Result<Json<Value>, ApiError> {
    let id = query
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Assistant ID is required"))?;
    let existing = state
        .store
        .get_assistant(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("Assistant not found"))?;

    state
        .store
        .set_assistant_status(&id, SyncStatus::Deleting, &now_iso())
        .await?;
    if let Err(err) = finish_delete(&state, state.provider.as_ref(), &existing).await {
        warn!(assistant_id = %id, error = %err, "delete incomplete, row left deleting");
        return Err(err);
    }
    info!(assistant_id = %id, "assistant deleted");
    Ok(Json(json!({ "success": true })))
}

pub async fn list_assistants(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AssistantQuery>,
) -> Result<Json<Value>, ApiError> {
    let assistants = state.store.list_assistants().await?;
    let mut views = Vec::with_capacity(assistants.len());
    for assistant in assistants {
        let vector_store_id = assistant.vector_store_id.clone();
        let mut view = AssistantView::new(&state, assistant);
        if query.include_files {
            let files = match vector_store_id {
                Some(vector_store_id) => state
                    .provider
                    .list_vector_store_files(&vector_store_id)
                    .await
                    .unwrap_or_else(|err| {
                        warn!(%vector_store_id, error = %err, "file status lookup failed");
                        Vec::new()
                    }),
                None => Vec::new(),
            };
            view.files = Some(files);
        }
        views.push(view);
    }
    Ok(Json(json!({ "data": views })))
}

async fn mirror_remote(
    provider: &dyn AssistantProvider,
    existing: &Assistant,
    remote: RemoteAssistant,
) -> Assistant {
    let vector_store_id = remote.vector_store_ids().into_iter().next();
    let file_ids = if vector_store_id == existing.vector_store_id {
        existing.file_ids.clone()
    } else if let Some(vector_store_id) = vector_store_id.as_deref() {
        match provider.list_vector_store_files(vector_store_id).await {
            Ok(files) => files.into_iter().map(|file| file.id).collect(),
            Err(err) => {
                warn!(vector_store_id, error = %err, "could not read bound files");
                existing.file_ids.clone()
            }
        }
    } else {
        Vec::new()
    };

    Assistant {
        id: existing.id.clone(),
        name: remote.name.unwrap_or_else(|| existing.name.clone()),
        instructions: remote
            .instructions
            .unwrap_or_else(|| existing.instructions.clone()),
        model: remote.model,
        tools: remote.tools.iter().map(|tool| admin_tool(&tool.kind)).collect(),
        temperature: remote.temperature.unwrap_or(existing.temperature),
        top_p: remote.top_p.unwrap_or(existing.top_p),
        response_format: remote
            .response_format
            .unwrap_or_else(|| existing.response_format.clone()),
        file_ids,
        vector_store_id,
        sync_status: SyncStatus::Active,
        created_at: existing.created_at.clone(),
        updated_at: now_iso(),
    }
}

/// Converges rows left `deleting` or `pending` by an interrupted request.
pub async fn reconcile(state: &AppState) -> Result<ReconcileReport, ApiError> {
    let provider = state.provider.as_ref();
    let mut report = ReconcileReport::default();

    for assistant in state
        .store
        .list_assistants_with_status(SyncStatus::Deleting)
        .await?
    {
        match finish_delete(state, provider, &assistant).await {
            Ok(()) => report.resumed_deletes += 1,
            Err(err) => {
                warn!(assistant_id = %assistant.id, error = %err, "resumed delete failed");
                report.failed += 1;
            }
        }
    }

    for assistant in state
        .store
        .list_assistants_with_status(SyncStatus::Pending)
        .await?
    {
        match provider.retrieve_assistant(&assistant.id).await {
            Ok(remote) => {
                let mirrored = mirror_remote(provider, &assistant, remote).await;
                state.store.update_assistant(&mirrored).await?;
                report.refreshed += 1;
            }
            Err(err) if err.is_not_found() => {
                if let Some(vector_store_id) = assistant.vector_store_id.as_deref() {
                    if let Err(cleanup) = drop_vector_store(provider, vector_store_id).await {
                        warn!(vector_store_id, error = %cleanup, "could not remove vector store");
                    }
                }
                state.store.delete_assistant(&assistant.id).await?;
                report.dropped += 1;
            }
            Err(err) => {
                warn!(assistant_id = %assistant.id, error = %err, "pending assistant refresh failed");
                report.failed += 1;
            }
        }
    }

    info!(
        resumed_deletes = report.resumed_deletes,
        refreshed = report.refreshed,
        dropped = report.dropped,
        failed = report.failed,
        "reconcile finished"
    );
    Ok(report)
}

pub async fn reconcile_assistants(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReconcileReport>, ApiError> {
    Ok(Json(reconcile(&state).await?))
}

pub async fn verify_chatbot(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IdQuery>,
) -> Response {
    let Some(id) = query.id.filter(|id| !id.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "valid": false, "error": "Chatbot ID is required" })),
        )
            .into_response();
    };

    match state.provider.retrieve_assistant(&id).await {
        Ok(remote) => {
            let file_ids = remote.vector_store_ids();
            Json(json!({
                "valid": true,
                "name": remote.name,
                "model": remote.model,
                "tools": remote.tools.iter().map(|tool| admin_tool(&tool.kind)).collect::<Vec<_>>(),
                "temperature": remote.temperature,
                "top_p": remote.top_p,
                "response_format": remote.response_format,
                "file_ids": file_ids,
            }))
            .into_response()
        }
        Err(err) => {
            warn!(chatbot_id = %id, error = %err, "chatbot verification failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "valid": false, "error": err.to_string() })),
            )
                .into_response()
        }
    }
}
