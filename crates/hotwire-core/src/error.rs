use std::path::PathBuf;
use thiserror::Error;

/// Core error type for hotwire operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Failed to resolve {url}: {message}")]
    Resolve { url: String, message: String },

    /// `import.meta.hot.accept()` called with something other than string
    /// literals. `pos` is the byte offset of the offending character.
    #[error("import.meta.hot.accept() can only accept string literals or an Array of string literals (at offset {pos})")]
    AcceptUsage { pos: usize },

    #[error("Invalid HMR message: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    #[must_use]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    #[must_use]
    pub fn resolve(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resolve {
            url: url.into(),
            message: message.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
