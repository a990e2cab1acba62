use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, warn};

use crate::provider::ProviderError;

/// Every handler failure. Provider messages reach the caller verbatim;
/// database details are only logged.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Provider(_) | ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Value {
        match self {
            ApiError::Provider(ProviderError::Api { status, code, .. }) => {
                json!({ "provider_status": status, "code": code })
            }
            _ => Value::Null,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Database(err) => {
                error!(error = %err, "database error");
                "internal database error".to_string()
            }
            ApiError::Provider(err) => {
                error!(error = %err, "provider call failed");
                err.to_string()
            }
            other => {
                warn!(status = status.as_u16(), error = %other, "request rejected");
                other.to_string()
            }
        };
        (
            status,
            Json(json!({ "error": message, "details": self.details() })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;

    async fn body_of(err: ApiError) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn provider_message_is_forwarded_verbatim() {
        let (status, body) = body_of(ApiError::Provider(ProviderError::Api {
            status: 404,
            code: Some("not_found".to_string()),
            message: "No assistant found with id 'asst_x'.".to_string(),
        }))
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "No assistant found with id 'asst_x'.");
        assert_eq!(body["details"]["provider_status"], 404);
    }

    #[tokio::test]
    async fn database_details_stay_private() {
        let (status, body) = body_of(ApiError::Database(sqlx::Error::PoolTimedOut)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "internal database error");
        assert!(body["details"].is_null());
    }

    #[tokio::test]
    async fn client_errors_keep_their_status() {
        let (status, body) = body_of(ApiError::not_found("Assistant not found")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Assistant not found");
    }
}
