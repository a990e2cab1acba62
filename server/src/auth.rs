use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
    Json,
};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::ApiError,
    types::{now_iso, AdminSession, AppState, LoginBody},
};

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(String, AdminSession), ApiError> {
    let token = bearer_token(headers)
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;
    let token_hash = sha256_hex(&token);
    let session = state
        .store
        .find_admin_session(&token_hash, &now_iso())
        .await?
        .ok_or_else(|| ApiError::Unauthorized("invalid or expired session".to_string()))?;
    Ok((token_hash, session))
}

/// Guards the admin routes; widget-facing routes are mounted outside it.
pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    authorize(&state, request.headers()).await?;
    Ok(next.run(request).await)
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> Result<Json<Value>, ApiError> {
    let code = body.access_code.trim();
    if code.is_empty() {
        return Err(ApiError::bad_request("Access code is required"));
    }
    if !bcrypt::verify(code, &state.access_code_hash).unwrap_or(false) {
        return Err(ApiError::Unauthorized("Invalid access code".to_string()));
    }

    let purged = state.store.purge_expired_admin_sessions(&now_iso()).await?;
    if purged > 0 {
        debug!(purged, "expired admin sessions removed");
    }

    let token = Uuid::new_v4().to_string();
    let now = Utc::now();
    let expires_at =
        (now + state.config.admin_session_ttl).to_rfc3339_opts(SecondsFormat::Micros, true);
    state
        .store
        .insert_admin_session(&AdminSession {
            token_hash: sha256_hex(&token),
            created_at: now.to_rfc3339_opts(SecondsFormat::Micros, true),
            expires_at: expires_at.clone(),
        })
        .await?;
    info!(%expires_at, "admin session opened");

    Ok(Json(json!({ "token": token, "expires_at": expires_at })))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let (token_hash, _) = authorize(&state, &headers).await?;
    state.store.delete_admin_session(&token_hash).await?;
    debug!("admin session closed");
    Ok(Json(json!({ "success": true })))
}

pub async fn session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let (_, session) = authorize(&state, &headers).await?;
    Ok(Json(json!({ "valid": true, "expires_at": session.expires_at })))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use crate::{
        app::router,
        store::Store,
        testing::{body_json, test_state, MockProvider},
        types::AdminSession,
    };

    fn login_request(code: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header("content-type", "application/json")
            .body(Body::from(format!(r#"{{"access_code":"{code}"}}"#)))
            .unwrap()
    }

    fn with_token(method: &str, uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn wrong_access_code_is_rejected() {
        let (state, _) = test_state(MockProvider::new());
        let response = router(state).oneshot(login_request("nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Invalid access code");
    }

    #[tokio::test]
    async fn login_session_logout_lifecycle() {
        let (state, _) = test_state(MockProvider::new());
        let app = router(state);

        let response = app.clone().oneshot(login_request("letmein")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let token = body_json(response).await["token"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .clone()
            .oneshot(with_token("GET", "/api/auth/session", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["valid"], true);

        let response = app
            .clone()
            .oneshot(with_token("GET", "/api/assistant", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(with_token("POST", "/api/auth/logout", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(with_token("GET", "/api/assistant", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn login_clears_expired_sessions() {
        let (state, store) = test_state(MockProvider::new());
        store
            .insert_admin_session(&AdminSession {
                token_hash: "stale".to_string(),
                created_at: "2020-01-01T00:00:00.000000Z".to_string(),
                expires_at: "2020-01-01T12:00:00.000000Z".to_string(),
            })
            .await
            .unwrap();

        let response = router(state).oneshot(login_request("letmein")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(store
            .find_admin_session("stale", "2019-12-31T00:00:00.000000Z")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn admin_routes_need_a_token_but_widget_routes_do_not() {
        let (state, _) = test_state(MockProvider::new());
        let app = router(state);

        let response = app
            .clone()
            .oneshot(Request::get("/api/threads").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(Request::get("/embed.js").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
