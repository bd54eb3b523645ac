//! Error types for the client runtime.
//!
//! Local store and mutation errors are returned to the caller. Network errors
//! are produced by remote adapters and normally only reach the user through
//! the sync state; they appear here so that awaited operations such as a
//! forced resync can report them too.

use crate::config::ConfigError;
use chartsync_engine::{ConflictId, RecordId, ValidationError};
use thiserror::Error;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Transient failures talking to the remote.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("remote unreachable: {0}")]
    Unreachable(String),

    #[error("request timed out")]
    Timeout,

    #[error("remote returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("could not decode remote response: {0}")]
    Decode(String),

    #[error("live channel error: {0}")]
    Live(String),

    #[error("offline")]
    Offline,
}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NetworkError::Timeout
        } else if err.is_decode() {
            NetworkError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            NetworkError::Status {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            NetworkError::Unreachable(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for NetworkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        NetworkError::Live(err.to_string())
    }
}

/// All errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Engine(chartsync_engine::Error),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    #[error("record already exists: {0}")]
    RecordAlreadyExists(RecordId),

    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    #[error("replication is not running")]
    NotStarted,

    #[error("operation cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<chartsync_engine::Error> for ClientError {
    fn from(err: chartsync_engine::Error) -> Self {
        match err {
            chartsync_engine::Error::Validation(v) => ClientError::Validation(v),
            other => ClientError::Engine(other),
        }
    }
}

impl ClientError {
    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Network(_) | ClientError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartsync_engine::Violation;

    #[test]
    fn engine_validation_is_flattened() {
        let mut v = ValidationError::default();
        v.push("name", Violation::Missing);
        let err: ClientError = chartsync_engine::Error::Validation(v).into();
        assert!(matches!(err, ClientError::Validation(_)));
    }

    #[test]
    fn network_errors_are_transient() {
        let err = ClientError::Network(NetworkError::Timeout);
        assert!(err.is_transient());
        assert!(!ClientError::NotStarted.is_transient());
    }

    #[test]
    fn error_display() {
        let err = ClientError::ConflictNotFound("c-1".into());
        assert_eq!(err.to_string(), "conflict not found: c-1");
        let err = ClientError::Network(NetworkError::Status {
            status: 401,
            message: "unauthorized".into(),
        });
        assert_eq!(err.to_string(), "remote returned 401: unauthorized");
    }
}
