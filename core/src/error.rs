use std::time::Duration;

use thiserror::Error;

use crate::discovery::NeighborKey;

/// Clipmesh error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to serialize/deserialize: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Clipboard error: {0}")]
    Clipboard(String),

    #[error("Invalid package: {0}")]
    InvalidPackage(String),

    #[error("Unknown neighbor: {0}")]
    UnknownNeighbor(NeighborKey),

    #[error("Could not connect to {key} after {attempts} attempt(s)")]
    ConnectFailed { key: NeighborKey, attempts: u32 },

    #[error("Timed out after {timeout:?} writing to {key}")]
    SendTimeout { key: NeighborKey, timeout: Duration },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
