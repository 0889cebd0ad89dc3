//! Error types for the folio server.

use std::path::PathBuf;

/// Server error type.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// IO error.
    #[error("IO error at {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// Engine error.
    #[error(transparent)]
    Core(#[from] folio_core::Error),

    /// The configured listen address does not parse.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ServerError {
    /// Message for the client, with a recovery hint where one exists.
    pub fn client_message(&self) -> String {
        match self {
            ServerError::Core(e) => e.with_hint(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::new(),
            message: e.to_string(),
        }
    }
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
