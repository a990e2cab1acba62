use std::{sync::Arc, time::Duration};

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    assistants, auth, chat,
    config::ServerConfig,
    provider::OpenAiClient,
    store::{MemoryStore, PgStore, Store},
    threads,
    types::{now_iso, AppState},
    uploads::{self, MAX_UPLOAD_BYTES},
    widget,
};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to connect to postgres: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to run migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("failed to hash admin access code: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true, "now": now_iso() }))
}

pub fn router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route(
            "/api/assistant",
            get(assistants::list_assistants)
                .post(assistants::create_assistant)
                .put(assistants::update_assistant)
                .delete(assistants::delete_assistant),
        )
        .route(
            "/api/assistant/reconcile",
            post(assistants::reconcile_assistants),
        )
        .route("/api/assistant/presets", get(widget::instruction_presets))
        .route(
            "/api/upload",
            post(uploads::upload_knowledge_file)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + 1024 * 1024)),
        )
        .route("/api/threads", get(threads::list_threads))
        .route(
            "/api/threads/{thread_id}/messages",
            get(threads::thread_messages),
        )
        .route(
            "/api/threads/{thread_id}/export",
            get(threads::export_thread),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_admin,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/embed.js", get(widget::embed_script))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/session", get(auth::session))
        .route("/api/chatbot", post(chat::chat))
        .route("/api/verify-chatbot", get(assistants::verify_chatbot))
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn open_store(config: &ServerConfig) -> Result<Arc<dyn Store>, StartupError> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("no database configured, using in-memory store; data is lost on restart");
        return Ok(Arc::new(MemoryStore::new()));
    };

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&db).await?;
    info!("database ready");
    Ok(Arc::new(PgStore::new(db)))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

pub async fn run(config: ServerConfig) -> Result<(), StartupError> {
    let store = open_store(&config).await?;
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()?;
    let provider = Arc::new(OpenAiClient::new(
        http,
        &config.openai_base_url,
        &config.openai_api_key,
    ));
    let access_code_hash = bcrypt::hash(&config.admin_access_code, bcrypt::DEFAULT_COST)?;
    let port = config.port;

    let state = Arc::new(AppState {
        store,
        provider,
        config,
        access_code_hash,
    });

    let startup = state.clone();
    tokio::spawn(async move {
        if let Err(err) = startup.store.purge_expired_admin_sessions(&now_iso()).await {
            warn!(error = %err, "expired session cleanup failed");
        }
        if let Err(err) = assistants::reconcile(&startup).await {
            warn!(error = %err, "startup reconcile failed");
        }
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "assistant server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
