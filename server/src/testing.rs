//! In-process provider double and state builders shared by the handler tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
};

use assistant_widget::protocol::Role;
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use chrono::Duration;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tower::ServiceExt;

use crate::{
    config::ServerConfig,
    provider::{
        AssistantProvider, AssistantSpec, FileFailure, MessageContent, ProviderError,
        RemoteAssistant, RemoteFile, RemoteMessage, RemoteThread, Run, RunFailure, RunStatus,
        TextValue, ToolResources, FileSearchResources, VectorStore, VectorStoreFile,
    },
    store::{MemoryStore, Store},
    types::{AdminSession, AppState},
};

#[derive(Default)]
pub struct MockState {
    pub assistants: HashMap<String, RemoteAssistant>,
    pub vector_stores: HashMap<String, Vec<String>>,
    /// Chronological per provider thread.
    pub threads: HashMap<String, Vec<RemoteMessage>>,
    /// Statuses handed out by successive polls; the last one repeats.
    pub run_script: VecDeque<RunStatus>,
    pub reply: String,
    pub fail_on: HashSet<&'static str>,
    pub calls: Vec<String>,
    runs: HashMap<String, String>,
    completed_runs: HashSet<String>,
    next_id: usize,
    clock: i64,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_{}", self.next_id)
    }

    fn tick(&mut self) -> i64 {
        self.clock += 1;
        1_714_557_600 + self.clock
    }

    fn push_message(&mut self, thread_id: &str, role: Role, text: &str) -> RemoteMessage {
        let message = RemoteMessage {
            id: self.next_id("msg"),
            role,
            content: vec![MessageContent::Text {
                text: TextValue {
                    value: text.to_string(),
                },
            }],
            created_at: self.tick(),
        };
        self.threads
            .entry(thread_id.to_string())
            .or_default()
            .push(message.clone());
        message
    }
}

#[derive(Clone)]
pub struct MockProvider {
    pub state: Arc<Mutex<MockState>>,
}

impl MockProvider {
    pub fn new() -> Self {
        let state = MockState {
            reply: "Hello there friend".to_string(),
            run_script: VecDeque::from([RunStatus::InProgress, RunStatus::Completed]),
            ..MockState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn with_script(self, statuses: &[RunStatus]) -> Self {
        self.state.lock().unwrap().run_script = statuses.iter().copied().collect();
        self
    }

    pub fn with_reply(self, reply: &str) -> Self {
        self.state.lock().unwrap().reply = reply.to_string();
        self
    }

    pub fn fail_on(&self, operation: &'static str) {
        self.state.lock().unwrap().fail_on.insert(operation);
    }

    pub fn heal(&self, operation: &'static str) {
        self.state.lock().unwrap().fail_on.remove(operation);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn has_assistant(&self, id: &str) -> bool {
        self.state.lock().unwrap().assistants.contains_key(id)
    }

    pub fn vector_store_count(&self) -> usize {
        self.state.lock().unwrap().vector_stores.len()
    }

    pub fn seed_message(&self, thread_id: &str, role: Role, text: &str) {
        self.state.lock().unwrap().push_message(thread_id, role, text);
    }

    fn enter(&self, operation: &'static str) -> Result<std::sync::MutexGuard<'_, MockState>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(operation.to_string());
        if state.fail_on.contains(operation) {
            return Err(ProviderError::Api {
                status: 500,
                code: Some("server_error".to_string()),
                message: format!("mock failure in {operation}"),
            });
        }
        Ok(state)
    }
}

fn not_found(what: &str, id: &str) -> ProviderError {
    ProviderError::Api {
        status: 404,
        code: None,
        message: format!("No {what} found with id '{id}'."),
    }
}

fn remote_from_spec(id: String, spec: &AssistantSpec, created_at: i64) -> RemoteAssistant {
    RemoteAssistant {
        id,
        name: Some(spec.name.clone()),
        instructions: Some(spec.instructions.clone()),
        model: spec.model.clone(),
        tools: spec.tools.clone(),
        temperature: Some(spec.temperature),
        top_p: Some(spec.top_p),
        response_format: Some(spec.response_format.clone()),
        tool_resources: Some(ToolResources {
            file_search: Some(FileSearchResources {
                vector_store_ids: spec.vector_store_id.iter().cloned().collect(),
            }),
        }),
        created_at,
    }
}

#[async_trait]
impl AssistantProvider for MockProvider {
    async fn upload_file(
        &self,
        _file_name: &str,
        _content_type: &str,
        _bytes: Vec<u8>,
    ) -> Result<RemoteFile, ProviderError> {
        let mut state = self.enter("upload_file")?;
        Ok(RemoteFile {
            id: state.next_id("file"),
        })
    }

    async fn create_vector_store(
        &self,
        _name: &str,
        file_ids: &[String],
    ) -> Result<VectorStore, ProviderError> {
        let mut state = self.enter("create_vector_store")?;
        let id = state.next_id("vs");
        state.vector_stores.insert(id.clone(), file_ids.to_vec());
        Ok(VectorStore { id })
    }

    async fn delete_vector_store(&self, vector_store_id: &str) -> Result<(), ProviderError> {
        let mut state = self.enter("delete_vector_store")?;
        state
            .vector_stores
            .remove(vector_store_id)
            .map(|_| ())
            .ok_or_else(|| not_found("vector store", vector_store_id))
    }

    async fn list_vector_store_files(
        &self,
        vector_store_id: &str,
    ) -> Result<Vec<VectorStoreFile>, ProviderError> {
        let state = self.enter("list_vector_store_files")?;
        let files = state
            .vector_stores
            .get(vector_store_id)
            .ok_or_else(|| not_found("vector store", vector_store_id))?;
        Ok(files
            .iter()
            .map(|id| VectorStoreFile {
                id: id.clone(),
                status: if id.contains("bad") { "failed" } else { "completed" }.to_string(),
                last_error: id.contains("bad").then(|| FileFailure {
                    code: Some("unsupported_file".to_string()),
                    message: Some("could not parse file".to_string()),
                }),
            })
            .collect())
    }

    async fn create_assistant(&self, spec: &AssistantSpec) -> Result<RemoteAssistant, ProviderError> {
        let mut state = self.enter("create_assistant")?;
        let id = state.next_id("asst");
        let created_at = state.tick();
        let remote = remote_from_spec(id.clone(), spec, created_at);
        state.assistants.insert(id, remote.clone());
        Ok(remote)
    }

    async fn update_assistant(
        &self,
        assistant_id: &str,
        spec: &AssistantSpec,
    ) -> Result<RemoteAssistant, ProviderError> {
        let mut state = self.enter("update_assistant")?;
        let created_at = state
            .assistants
            .get(assistant_id)
            .map(|existing| existing.created_at)
            .ok_or_else(|| not_found("assistant", assistant_id))?;
        let remote = remote_from_spec(assistant_id.to_string(), spec, created_at);
        state
            .assistants
            .insert(assistant_id.to_string(), remote.clone());
        Ok(remote)
    }

    async fn retrieve_assistant(&self, assistant_id: &str) -> Result<RemoteAssistant, ProviderError> {
        let state = self.enter("retrieve_assistant")?;
        state
            .assistants
            .get(assistant_id)
            .cloned()
            .ok_or_else(|| not_found("assistant", assistant_id))
    }

    async fn delete_assistant(&self, assistant_id: &str) -> Result<(), ProviderError> {
        let mut state = self.enter("delete_assistant")?;
        state
            .assistants
            .remove(assistant_id)
            .map(|_| ())
            .ok_or_else(|| not_found("assistant", assistant_id))
    }

    async fn create_thread(&self) -> Result<RemoteThread, ProviderError> {
        let mut state = self.enter("create_thread")?;
        let id = state.next_id("thread");
        state.threads.insert(id.clone(), Vec::new());
        Ok(RemoteThread { id })
    }

    async fn create_message(
        &self,
        thread_id: &str,
        content: &str,
    ) -> Result<RemoteMessage, ProviderError> {
        let mut state = self.enter("create_message")?;
        if !state.threads.contains_key(thread_id) {
            return Err(not_found("thread", thread_id));
        }
        Ok(state.push_message(thread_id, Role::User, content))
    }

    async fn list_messages(&self, thread_id: &str) -> Result<Vec<RemoteMessage>, ProviderError> {
        let state = self.enter("list_messages")?;
        let messages = state
            .threads
            .get(thread_id)
            .ok_or_else(|| not_found("thread", thread_id))?;
        Ok(messages.iter().rev().cloned().collect())
    }

    async fn create_run(&self, thread_id: &str, _assistant_id: &str) -> Result<Run, ProviderError> {
        let mut state = self.enter("create_run")?;
        let id = state.next_id("run");
        state.runs.insert(id.clone(), thread_id.to_string());
        Ok(Run {
            id,
            status: RunStatus::Queued,
            last_error: None,
        })
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<Run, ProviderError> {
        let mut state = self.enter("retrieve_run")?;
        let status = if state.run_script.len() > 1 {
            state.run_script.pop_front().unwrap_or(RunStatus::Completed)
        } else {
            state.run_script.front().copied().unwrap_or(RunStatus::Completed)
        };
        if status == RunStatus::Completed && state.completed_runs.insert(run_id.to_string()) {
            let reply = state.reply.clone();
            state.push_message(thread_id, Role::Assistant, &reply);
        }
        let last_error = (status == RunStatus::Failed).then(|| RunFailure {
            message: "Something went wrong".to_string(),
        });
        Ok(Run {
            id: run_id.to_string(),
            status,
            last_error,
        })
    }

    async fn cancel_run(&self, _thread_id: &str, _run_id: &str) -> Result<(), ProviderError> {
        drop(self.enter("cancel_run")?);
        Ok(())
    }
}

pub fn test_state(provider: MockProvider) -> (Arc<AppState>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let state = Arc::new(AppState {
        store: store.clone(),
        provider: Arc::new(provider),
        config: ServerConfig::for_tests(),
        access_code_hash: bcrypt::hash("letmein", 4).unwrap(),
    });
    (state, store)
}

/// Registers an admin session directly and returns its bearer token.
pub async fn admin_token(store: &dyn Store) -> String {
    let token = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now();
    store
        .insert_admin_session(&AdminSession {
            token_hash: hex::encode(Sha256::digest(token.as_bytes())),
            created_at: now.to_rfc3339(),
            expires_at: (now + Duration::hours(1))
                .to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
        })
        .await
        .unwrap();
    token
}

pub async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn send_json(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}
