use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::service::challonge_service::{ChallongeConfig, DEFAULT_BASE_URL};

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub challonge: ChallongeConfig,
    pub dispatch: DispatchConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    /// Chat layer webhook; side effects are only logged when unset.
    pub webhook_url: Option<String>,
    pub category_prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL")?;
        let max_connections: u32 = env_or("DATABASE_MAX_CONNECTIONS", "5").parse()?;
        let challonge_username = env::var("CHALLONGE_USERNAME")?;
        let challonge_api_key = env::var("CHALLONGE_API_KEY")?;
        let challonge_base_url = env_or("CHALLONGE_BASE_URL", DEFAULT_BASE_URL);
        let challonge_timeout: u64 = env_or("CHALLONGE_TIMEOUT_SECS", "10").parse()?;
        let webhook_url = env::var("DISPATCH_WEBHOOK_URL").ok().filter(|url| !url.trim().is_empty());
        let category_prefix = env_or("MATCH_CATEGORY_PREFIX", "round");
        let port: u16 = env_or("PORT", "8080").parse()?;
        let host = env_or("HOST", "0.0.0.0");
        let rust_log = env_or("RUST_LOG", "tournament_engine=info,actix_web=info");

        Ok(Config {
            database: DatabaseConfig {
                url: database_url,
                max_connections,
            },
            challonge: ChallongeConfig {
                base_url: challonge_base_url,
                username: challonge_username,
                api_key: challonge_api_key,
                timeout: Duration::from_secs(challonge_timeout),
            },
            dispatch: DispatchConfig {
                webhook_url,
                category_prefix,
            },
            server: ServerConfig { port, host, rust_log },
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
