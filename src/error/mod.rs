use thiserror::Error;

use crate::chat::attachment::ValidationError;
use crate::chat::types::ChatError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Model provider error: {0}")]
    ModelProvider(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Attachment rejected: {0}")]
    Attachment(#[from] ValidationError),

    #[error("Chat error: {0}")]
    Chat(String),

    #[error("Not signed in: {0}")]
    Unauthorized(String),

    #[error("Secure storage error: {0}")]
    SecureStorage(#[from] keyring::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Error {
    pub fn platform(msg: impl Into<String>) -> Self {
        Error::Platform(msg.into())
    }

    pub fn model_provider(msg: impl Into<String>) -> Self {
        Error::ModelProvider(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Error::Unauthorized(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Error::Unknown(msg.into())
    }

    /// One-line, length-capped rendering suitable for a response `details` field.
    pub fn diagnostic(&self) -> String {
        const MAX_DIAGNOSTIC_CHARS: usize = 120;

        let text = self.to_string();
        let first_line = text.lines().next().unwrap_or_default();
        if first_line.chars().count() <= MAX_DIAGNOSTIC_CHARS {
            first_line.to_string()
        } else {
            let truncated: String = first_line.chars().take(MAX_DIAGNOSTIC_CHARS).collect();
            format!("{}...", truncated)
        }
    }
}

impl From<ChatError> for Error {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Unauthorized => Error::unauthorized(err.to_string()),
            other => Error::Chat(other.to_string()),
        }
    }
}
