//! Error types for plugin-sync client operations.

use plugin_sync_protocol::{classify, Classification};
use std::path::PathBuf;
use std::time::Duration;

/// Source tag used when classifying failures observed by the client itself.
pub const SOURCE_CLIENT: &str = "client";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Home directory not found")]
    HomeNotFound,

    #[error("Failed to connect to daemon socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {0:?} waiting for the daemon")]
    Timeout(Duration),

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Daemon error {code}: {message}")]
    Daemon { code: String, message: String },

    #[error("Connection closed by the daemon")]
    Closed,
}

impl ClientError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ClientError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        ClientError::Json {
            context: context.into(),
            source,
        }
    }

    /// Maps a client-side failure onto the shared classifier so it renders
    /// like any server-reported failure. An abandoned request counts as a
    /// network failure.
    pub fn classification(&self, retry_count: u32) -> Classification {
        match self {
            ClientError::Timeout(_) => classify("connection timeout", SOURCE_CLIENT, retry_count),
            ClientError::Connect { .. } | ClientError::Closed => {
                classify("connection refused", SOURCE_CLIENT, retry_count)
            }
            ClientError::Daemon { message, .. } => classify(message, SOURCE_CLIENT, retry_count),
            other => classify(&other.to_string(), SOURCE_CLIENT, retry_count),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
