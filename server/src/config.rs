//! Configuration management for the server.

use std::env;

/// Default page size for pulls that do not name one.
pub const DEFAULT_PULL_LIMIT: i64 = 100;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Bearer token clients must present; anonymous access when unset
    pub auth_token: Option<String>,
    /// Upper bound for the `limit` of a pull
    pub max_pull_limit: i64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;

        let auth_token = env::var("AUTH_TOKEN").ok().filter(|t| !t.is_empty());

        let max_pull_limit = match env::var("MAX_PULL_LIMIT") {
            Ok(raw) => raw
                .parse::<i64>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::InvalidPullLimit)?,
            Err(_) => 1000,
        };

        Ok(Self {
            host,
            port,
            database_url,
            auth_token,
            max_pull_limit,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("MAX_PULL_LIMIT must be a positive integer")]
    InvalidPullLimit,
}
