use std::net::IpAddr;

use thiserror::Error;

/// Clipshare error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to serialize/deserialize: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Clipboard error: {0}")]
    Clipboard(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Already connected to {0}")]
    AlreadyConnected(IpAddr),

    #[error("Not connected to {0}")]
    NotConnected(IpAddr),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
