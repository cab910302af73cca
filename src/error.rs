use thiserror::Error;

use crate::models::chat::MessageId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation '{0}' not found")]
    ConversationNotFound(String),
    #[error("message {0} not found")]
    MessageNotFound(MessageId),
    #[error("message {0} already has a reply")]
    ReplyExists(MessageId),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Failure of an optional capability (classifier, generator, notifier).
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("{0} timed out after {1} ms")]
    Timeout(&'static str, u128),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("capability not configured: {0}")]
    NotConfigured(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,
    #[error("bad token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("expected an access token, got '{0}'")]
    WrongTokenType(String),
    #[error("token names no user")]
    MissingUser,
    #[error("auth secret must not be empty")]
    EmptySecret,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid pattern '{0}': {1}")]
    Pattern(String, regex::Error),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limiter backend unreachable: {0}")]
    Backend(#[from] redis::RedisError),
}
