use thiserror::Error;

/// Errors surfaced by the client runtime.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    Transport(String),

    #[error("Failed to import {url}: {message}")]
    Import { url: String, message: String },

    #[error("Invalid HMR payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Invalid socket URL: {0}")]
    Url(#[from] url::ParseError),
}

impl ClientError {
    #[must_use]
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    #[must_use]
    pub fn import(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Import {
            url: url.into(),
            message: message.into(),
        }
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
