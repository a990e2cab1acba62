mod app;
mod assistants;
mod auth;
mod chat;
mod config;
mod error;
mod provider;
mod store;
#[cfg(test)]
mod testing;
mod threads;
mod types;
mod uploads;
mod widget;

use tracing::error;
use tracing_subscriber::{
    filter::{LevelFilter, Targets},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::ServerConfig;

fn init_tracing() {
    let own_level = if cfg!(debug_assertions) {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = Targets::new()
        .with_default(LevelFilter::INFO)
        .with_target("assistant_server", own_level)
        .with_target("tower_http", LevelFilter::DEBUG)
        .with_target("sqlx", LevelFilter::WARN)
        .with_target("hyper", LevelFilter::OFF);

    // A subscriber may already be set when embedded; keep the existing one.
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .try_init();
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            std::process::exit(1);
        }
    };

    if let Err(err) = app::run(config).await {
        error!(error = %err, "server exited with error");
        std::process::exit(1);
    }
}
