use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{config::ServerConfig, provider::AssistantProvider, store::Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Local row matches the last confirmed remote state.
    Active,
    /// A remote create or update was requested and not yet mirrored.
    Pending,
    /// Remote removal started; the row goes away once it is confirmed.
    Deleting,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Active => "active",
            SyncStatus::Pending => "pending",
            SyncStatus::Deleting => "deleting",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SyncStatus::Active),
            "pending" => Some(SyncStatus::Pending),
            "deleting" => Some(SyncStatus::Deleting),
            _ => None,
        }
    }
}

/// Local mirror of a provider-hosted assistant. `id` is the provider id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assistant {
    pub id: String,
    pub name: String,
    pub instructions: String,
    pub model: String,
    pub tools: Vec<String>,
    pub temperature: f64,
    pub top_p: f64,
    pub response_format: Value,
    pub file_ids: Vec<String>,
    pub vector_store_id: Option<String>,
    pub sync_status: SyncStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationThread {
    pub id: String,
    pub provider_thread_id: String,
    pub customer_id: String,
    pub assistant_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub id: String,
    pub provider_thread_id: String,
    pub assistant_id: String,
    pub created_at: String,
    pub customer: Customer,
}

#[derive(Debug, Clone)]
pub struct AdminSession {
    pub token_hash: String,
    pub created_at: String,
    pub expires_at: String,
}

/// Full-replacement configuration accepted by create and update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssistantBody {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub response_format: Option<Value>,
    #[serde(default)]
    pub file_ids: Vec<String>,
    /// Rejected when present: every assistant lives under the server key.
    #[serde(default)]
    pub openai_api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AssistantQuery {
    pub id: Option<String>,
    #[serde(default)]
    pub include_files: bool,
}

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginBody {
    #[serde(default)]
    pub access_code: String,
}

pub fn default_response_format() -> Value {
    json!({ "type": "text" })
}

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub provider: Arc<dyn AssistantProvider>,
    pub config: ServerConfig,
    /// bcrypt hash of the configured admin access code.
    pub access_code_hash: String,
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn unix_to_iso(seconds: i64) -> String {
    chrono::DateTime::from_timestamp(seconds, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}
