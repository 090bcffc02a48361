use thiserror::Error;

use minipos_core::StoreError;

use crate::protocol::ProtocolError;

/// Errors raised on the terminal side.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("No {collection} with id '{id}'")]
    NotFound { collection: &'static str, id: String },

    #[error("No user is logged in on this terminal")]
    NotLoggedIn,

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Table '{0}' is occupied with items but has no order id")]
    InconsistentTable(String),
}

/// Errors raised by the relay server.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] axum::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}
