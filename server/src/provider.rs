//! Typed client for the hosted assistants API.
//!
//! Responses are decoded into the structs below before anything else sees
//! them, so a change in the provider's response shape surfaces as
//! [`ProviderError::Schema`] at this boundary.

use assistant_widget::protocol::Role;
use async_trait::async_trait;
use reqwest::{multipart, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{0}")]
    Transport(#[from] reqwest::Error),

    #[error("{message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("unexpected provider response: {0}")]
    Schema(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::Api { status: 404, .. })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
struct Deleted {
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileSearchResources {
    #[serde(default)]
    pub vector_store_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolResources {
    #[serde(default)]
    pub file_search: Option<FileSearchResources>,
}

/// Desired remote configuration of an assistant.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantSpec {
    pub name: String,
    pub instructions: String,
    pub model: String,
    pub tools: Vec<ToolSpec>,
    pub temperature: f64,
    pub top_p: f64,
    pub response_format: Value,
    pub vector_store_id: Option<String>,
}

impl AssistantSpec {
    fn to_body(&self) -> Value {
        let vector_store_ids: Vec<&str> = self.vector_store_id.iter().map(String::as_str).collect();
        json!({
            "name": self.name,
            "instructions": self.instructions,
            "model": self.model,
            "tools": self.tools,
            "temperature": self.temperature,
            "top_p": self.top_p,
            "response_format": self.response_format,
            "tool_resources": { "file_search": { "vector_store_ids": vector_store_ids } },
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteAssistant {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    pub model: String,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub response_format: Option<Value>,
    #[serde(default)]
    pub tool_resources: Option<ToolResources>,
    pub created_at: i64,
}

impl RemoteAssistant {
    pub fn vector_store_ids(&self) -> Vec<String> {
        self.tool_resources
            .as_ref()
            .and_then(|resources| resources.file_search.as_ref())
            .map(|search| search.vector_store_ids.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFile {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VectorStore {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileFailure {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VectorStoreFile {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub last_error: Option<FileFailure>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteThread {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextValue {
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: TextValue },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteMessage {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: Vec<MessageContent>,
    pub created_at: i64,
}

impl RemoteMessage {
    /// Text of the first text part; non-text messages read as empty.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .find_map(|part| match part {
                MessageContent::Text { text } => Some(text.value.clone()),
                MessageContent::Other => None,
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    pub fn is_pending(self) -> bool {
        matches!(self, RunStatus::Queued | RunStatus::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
            RunStatus::Completed => "completed",
            RunStatus::Incomplete => "incomplete",
            RunStatus::Expired => "expired",
            RunStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunFailure {
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub last_error: Option<RunFailure>,
}

#[async_trait]
pub trait AssistantProvider: Send + Sync {
    async fn upload_file(
        &self,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<RemoteFile, ProviderError>;

    async fn create_vector_store(
        &self,
        name: &str,
        file_ids: &[String],
    ) -> Result<VectorStore, ProviderError>;
    async fn delete_vector_store(&self, vector_store_id: &str) -> Result<(), ProviderError>;
    async fn list_vector_store_files(
        &self,
        vector_store_id: &str,
    ) -> Result<Vec<VectorStoreFile>, ProviderError>;

    async fn create_assistant(&self, spec: &AssistantSpec) -> Result<RemoteAssistant, ProviderError>;
    async fn update_assistant(
        &self,
        assistant_id: &str,
        spec: &AssistantSpec,
    ) -> Result<RemoteAssistant, ProviderError>;
    async fn retrieve_assistant(&self, assistant_id: &str) -> Result<RemoteAssistant, ProviderError>;
    async fn delete_assistant(&self, assistant_id: &str) -> Result<(), ProviderError>;

    async fn create_thread(&self) -> Result<RemoteThread, ProviderError>;
    async fn create_message(
        &self,
        thread_id: &str,
        content: &str,
    ) -> Result<RemoteMessage, ProviderError>;
    /// Newest first.
    async fn list_messages(&self, thread_id: &str) -> Result<Vec<RemoteMessage>, ProviderError>;

    async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<Run, ProviderError>;
    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<Run, ProviderError>;
    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<(), ProviderError>;
}

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ProviderError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(api_error(status.as_u16(), &body));
        }
        serde_json::from_slice::<T>(&body).map_err(|err| ProviderError::Schema(err.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<(), ProviderError> {
        let deleted: Deleted = self.send(self.request(reqwest::Method::DELETE, path)).await?;
        if !deleted.deleted {
            return Err(ProviderError::Schema(format!("{path} was not deleted")));
        }
        Ok(())
    }
}

fn api_error(status: u16, body: &[u8]) -> ProviderError {
    let parsed = serde_json::from_slice::<Value>(body).ok();
    let error = parsed.as_ref().and_then(|value| value.get("error"));
    let message = error
        .and_then(|err| err.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("provider returned status {status}"));
    let code = error
        .and_then(|err| err.get("code"))
        .and_then(Value::as_str)
        .map(str::to_string);
    ProviderError::Api {
        status,
        code,
        message,
    }
}

#[async_trait]
impl AssistantProvider for OpenAiClient {
    async fn upload_file(
        &self,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<RemoteFile, ProviderError> {
        let part = multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(content_type)?;
        let form = multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", part);
        debug!(file_name, "uploading knowledge file");
        self.send(self.request(reqwest::Method::POST, "/files").multipart(form))
            .await
    }

    async fn create_vector_store(
        &self,
        name: &str,
        file_ids: &[String],
    ) -> Result<VectorStore, ProviderError> {
        self.send(
            self.request(reqwest::Method::POST, "/vector_stores")
                .json(&json!({ "name": name, "file_ids": file_ids })),
        )
        .await
    }

    async fn delete_vector_store(&self, vector_store_id: &str) -> Result<(), ProviderError> {
        self.delete(&format!("/vector_stores/{vector_store_id}")).await
    }

    async fn list_vector_store_files(
        &self,
        vector_store_id: &str,
    ) -> Result<Vec<VectorStoreFile>, ProviderError> {
        let list: ListResponse<VectorStoreFile> = self
            .send(self.request(
                reqwest::Method::GET,
                &format!("/vector_stores/{vector_store_id}/files?limit=100"),
            ))
            .await?;
        Ok(list.data)
    }

    async fn create_assistant(&self, spec: &AssistantSpec) -> Result<RemoteAssistant, ProviderError> {
        self.send(
            self.request(reqwest::Method::POST, "/assistants")
                .json(&spec.to_body()),
        )
        .await
    }

    async fn update_assistant(
        &self,
        assistant_id: &str,
        spec: &AssistantSpec,
    ) -> Result<RemoteAssistant, ProviderError> {
        self.send(
            self.request(reqwest::Method::POST, &format!("/assistants/{assistant_id}"))
                .json(&spec.to_body()),
        )
        .await
    }

    async fn retrieve_assistant(&self, assistant_id: &str) -> Result<RemoteAssistant, ProviderError> {
        self.send(self.request(reqwest::Method::GET, &format!("/assistants/{assistant_id}")))
            .await
    }

    async fn delete_assistant(&self, assistant_id: &str) -> Result<(), ProviderError> {
        self.delete(&format!("/assistants/{assistant_id}")).await
    }

    async fn create_thread(&self) -> Result<RemoteThread, ProviderError> {
        self.send(self.request(reqwest::Method::POST, "/threads").json(&json!({})))
            .await
    }

    async fn create_message(
        &self,
        thread_id: &str,
        content: &str,
    ) -> Result<RemoteMessage, ProviderError> {
        self.send(
            self.request(reqwest::Method::POST, &format!("/threads/{thread_id}/messages"))
                .json(&json!({ "role": "user", "content": content })),
        )
        .await
    }

    async fn list_messages(&self, thread_id: &str) -> Result<Vec<RemoteMessage>, ProviderError> {
        let list: ListResponse<RemoteMessage> = self
            .send(self.request(
                reqwest::Method::GET,
                &format!("/threads/{thread_id}/messages?order=desc&limit=100"),
            ))
            .await?;
        Ok(list.data)
    }

    async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<Run, ProviderError> {
        self.send(
            self.request(reqwest::Method::POST, &format!("/threads/{thread_id}/runs"))
                .json(&json!({ "assistant_id": assistant_id })),
        )
        .await
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<Run, ProviderError> {
        self.send(self.request(
            reqwest::Method::GET,
            &format!("/threads/{thread_id}/runs/{run_id}"),
        ))
        .await
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<(), ProviderError> {
        let _: Run = self
            .send(self.request(
                reqwest::Method::POST,
                &format!("/threads/{thread_id}/runs/{run_id}/cancel"),
            ))
            .await?;
        Ok(())
    }
}
