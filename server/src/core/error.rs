// party_sync/server/src/core/error.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PartyError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Store or broadcast unreachable. Never used for "nothing stored".
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Malformed snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not permitted: {0}")]
    NotPermitted(String),

    #[error("Threading error: {0}")]
    ThreadingError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<redis::RedisError> for PartyError {
    fn from(err: redis::RedisError) -> Self {
        PartyError::BackendUnavailable(err.to_string())
    }
}

impl PartyError {
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, PartyError::BackendUnavailable(_))
    }
}

pub type PartyResult<T> = Result<T, PartyError>;
