//! Client configuration.
//!
//! Values come from environment variables (optionally via a `.env` file) or
//! are set directly on [`ClientConfig`]. Every field has a default except the
//! remote endpoint and its credentials; without those the client still runs
//! fully offline and replication does not start.

use chartsync_engine::protocol::{DEFAULT_PULL_BATCH, DEFAULT_PUSH_BATCH};
use std::env;
use std::time::Duration;

/// Default collection name.
pub const DEFAULT_COLLECTION: &str = "records";
/// Default history queue capacity.
pub const DEFAULT_HISTORY_CAPACITY: usize = 256;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the remote authoritative store
    pub remote_url: Option<String>,
    /// Bearer token for the remote
    pub token: Option<String>,
    /// Remote collection replicated by this client
    pub collection: String,
    /// SQLite connection URL of the local store
    pub database_url: String,
    /// Actor recorded in field history
    pub actor_id: String,
    pub pull_batch_size: usize,
    pub push_batch_size: usize,
    /// Keep a live change channel open and pull on every notification
    pub live: bool,
    /// Interval between scheduled replication cycles
    pub sync_interval: Duration,
    pub request_timeout: Duration,
    /// Window over which local store change notifications are coalesced
    pub change_window: Duration,
    /// Capacity of the bounded history queue
    pub history_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            token: None,
            collection: DEFAULT_COLLECTION.to_string(),
            database_url: "sqlite://chartsync.db?mode=rwc".to_string(),
            actor_id: "local".to_string(),
            pull_batch_size: DEFAULT_PULL_BATCH,
            push_batch_size: DEFAULT_PUSH_BATCH,
            live: true,
            sync_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(15),
            change_window: Duration::from_millis(25),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// In-memory local store, no remote. Used by tests and demos.
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        Ok(Self {
            remote_url: env::var("CHARTSYNC_REMOTE_URL").ok().filter(|s| !s.is_empty()),
            token: env::var("CHARTSYNC_TOKEN").ok().filter(|s| !s.is_empty()),
            collection: env::var("CHARTSYNC_COLLECTION").unwrap_or(defaults.collection),
            database_url: env::var("CHARTSYNC_DATABASE_URL").unwrap_or(defaults.database_url),
            actor_id: env::var("CHARTSYNC_ACTOR").unwrap_or(defaults.actor_id),
            pull_batch_size: parse_var("CHARTSYNC_PULL_BATCH", defaults.pull_batch_size)?,
            push_batch_size: parse_var("CHARTSYNC_PUSH_BATCH", defaults.push_batch_size)?,
            live: parse_var("CHARTSYNC_LIVE", defaults.live)?,
            sync_interval: Duration::from_secs(parse_var(
                "CHARTSYNC_SYNC_INTERVAL_SECS",
                defaults.sync_interval.as_secs(),
            )?),
            request_timeout: defaults.request_timeout,
            change_window: defaults.change_window,
            history_capacity: parse_var("CHARTSYNC_HISTORY_CAPACITY", defaults.history_capacity)?,
        })
    }

    /// Validated remote settings, or why replication cannot start.
    pub fn remote(&self) -> Result<RemoteSettings, ConfigError> {
        let endpoint = self.remote_url.clone().ok_or(ConfigError::MissingRemote)?;
        url::Url::parse(&endpoint).map_err(|e| ConfigError::InvalidValue {
            name: "CHARTSYNC_REMOTE_URL",
            reason: e.to_string(),
        })?;
        let token = self.token.clone().ok_or(ConfigError::MissingCredentials)?;

        Ok(RemoteSettings {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            timeout: self.request_timeout,
        })
    }
}

/// Remote endpoint and credentials.
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub endpoint: String,
    pub token: String,
    pub timeout: Duration,
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            name,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("no remote endpoint configured (CHARTSYNC_REMOTE_URL)")]
    MissingRemote,

    #[error("no credentials configured for the remote (CHARTSYNC_TOKEN)")]
    MissingCredentials,

    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.pull_batch_size, 100);
        assert_eq!(config.push_batch_size, 50);
        assert_eq!(config.collection, "records");
        assert!(config.live);
    }

    #[test]
    fn remote_requires_endpoint_and_token() {
        let mut config = ClientConfig::in_memory();
        assert_eq!(config.remote().unwrap_err(), ConfigError::MissingRemote);

        config.remote_url = Some("https://sync.example.org/".into());
        assert_eq!(config.remote().unwrap_err(), ConfigError::MissingCredentials);

        config.token = Some("secret".into());
        let remote = config.remote().unwrap();
        assert_eq!(remote.endpoint, "https://sync.example.org");
    }

    #[test]
    fn remote_rejects_bad_url() {
        let config = ClientConfig {
            remote_url: Some("not a url".into()),
            token: Some("t".into()),
            ..ClientConfig::in_memory()
        };
        assert!(matches!(
            config.remote(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
