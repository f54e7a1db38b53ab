//! Signaling transport error types

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur on the signaling connection
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid signaling URL {0}: must start with ws:// or wss://")]
    InvalidUrl(String),

    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Serialize failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Signaling channel closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
