//! Gateway error types

use std::path::PathBuf;

use canlink_core::{AdapterError, RegistryError};
use thiserror::Error;

/// Result type for gateway operations
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unexpected wire message
    #[error("Wire protocol error: {0}")]
    Wire(String),

    #[error("Message payload of {len} bytes exceeds {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Session hello could not be turned into an adapter configuration
    #[error("Invalid session metadata: {0}")]
    Metadata(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// Another gateway answered on the socket path
    #[error("A gateway is already running at {}", .0.display())]
    AlreadyRunning(PathBuf),
}

impl GatewayError {
    pub fn wire(message: impl Into<String>) -> Self {
        Self::Wire(message.into())
    }
}
