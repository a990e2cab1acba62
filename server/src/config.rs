use std::{env, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable must be set")]
    Missing(&'static str),

    #[error("{name} has invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// `None` runs the server on the in-memory store.
    pub database_url: Option<String>,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub admin_access_code: String,
    pub public_base_url: String,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub chunk_delay: Duration,
    pub admin_session_ttl: chrono::Duration,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_var("PORT", 4000u16)?;
        let openai_api_key = required_var("OPENAI_API_KEY")?;
        let admin_access_code = required_var("ADMIN_ACCESS_CODE")?;
        let openai_base_url = env::var("OPENAI_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
            .trim_end_matches('/')
            .to_string();
        let public_base_url = env::var("API_PUBLIC_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_string();

        let poll_interval = Duration::from_millis(parse_var("RUN_POLL_INTERVAL_MS", 1000u64)?);
        let poll_timeout = Duration::from_secs(parse_var("RUN_POLL_TIMEOUT_SECS", 60u64)?);
        if poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                name: "RUN_POLL_INTERVAL_MS",
                value: "0".to_string(),
            });
        }
        let chunk_delay = Duration::from_millis(parse_var("CHUNK_DELAY_MS", 30u64)?);
        let ttl_hours = parse_var("ADMIN_SESSION_TTL_HOURS", 12i64)?;
        if ttl_hours <= 0 {
            return Err(ConfigError::Invalid {
                name: "ADMIN_SESSION_TTL_HOURS",
                value: ttl_hours.to_string(),
            });
        }

        Ok(Self {
            port,
            database_url: resolve_database_url(),
            openai_api_key,
            openai_base_url,
            admin_access_code,
            public_base_url,
            poll_interval,
            poll_timeout,
            chunk_delay,
            admin_session_ttl: chrono::Duration::hours(ttl_hours),
        })
    }
}

fn required_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid { name, value: raw })
        }
        _ => Ok(default),
    }
}

fn resolve_database_url() -> Option<String> {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return Some(url);
        }
    }
    let host = env::var("POSTGRES_HOST").or_else(|_| env::var("PGHOST")).ok()?;
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_default();
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "assistants".to_string());
    Some(format!("postgres://{user}:{password}@{host}:{port}/{db}"))
}

#[cfg(test)]
impl ServerConfig {
    pub fn for_tests() -> Self {
        Self {
            port: 0,
            database_url: None,
            openai_api_key: "sk-test".to_string(),
            openai_base_url: "http://provider.invalid/v1".to_string(),
            admin_access_code: "letmein".to_string(),
            public_base_url: "https://bots.example.com".to_string(),
            poll_interval: Duration::from_millis(5),
            poll_timeout: Duration::from_millis(200),
            chunk_delay: Duration::ZERO,
            admin_session_ttl: chrono::Duration::hours(1),
        }
    }
}
