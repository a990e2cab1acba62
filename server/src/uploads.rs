use std::sync::Arc;

use axum::{
    extract::{Multipart, State},
    Json,
};
use serde_json::{json, Value};
use tracing::info;

use crate::{error::ApiError, types::AppState};

pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

const ALLOWED_TYPES: [(&str, &str); 4] = [
    ("txt", "text/plain"),
    ("pdf", "application/pdf"),
    ("doc", "application/msword"),
    (
        "docx",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    ),
];

/// Content type for an accepted knowledge file, by extension.
fn knowledge_content_type(file_name: &str) -> Option<&'static str> {
    let (_, ext) = file_name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    ALLOWED_TYPES
        .iter()
        .find(|(allowed, _)| *allowed == ext)
        .map(|(_, mime)| *mime)
}

pub async fn upload_knowledge_file(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("Invalid upload: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().trim().to_string();
        if file_name.is_empty() {
            return Err(ApiError::bad_request("No file provided"));
        }
        let content_type = knowledge_content_type(&file_name).ok_or_else(|| {
            ApiError::bad_request("Only .txt, .pdf, .doc and .docx files are allowed")
        })?;
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request(format!("Invalid upload: {err}")))?;
        if bytes.is_empty() {
            return Err(ApiError::bad_request("Uploaded file is empty"));
        }
        if bytes.len() > MAX_UPLOAD_BYTES {
            return Err(ApiError::bad_request("File size must be less than 10MB"));
        }

        let size = bytes.len();
        let file = state
            .provider
            .upload_file(&file_name, content_type, bytes.to_vec())
            .await?;
        info!(file_id = %file.id, %file_name, size, "knowledge file uploaded");
        return Ok(Json(json!({ "file_id": file.id })));
    }
    Err(ApiError::bad_request("No file provided"))
}
