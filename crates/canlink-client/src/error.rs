//! Error types for gateway client operations

use canlink_core::AdapterError;
use canlink_gateway::GatewayError;
use thiserror::Error;

/// Result type alias for client operations
pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    /// Socket could not be reached
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Request timed out")]
    Timeout,

    /// The gateway answered with something other than what was asked for
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    /// The gateway closed the connection without answering
    #[error("Gateway closed the connection")]
    Disconnected,
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Gateway(GatewayError::Io(err))
    }
}

/// Express a gateway link failure in the adapter taxonomy
pub(crate) fn link_error(err: GatewayError) -> AdapterError {
    match err {
        GatewayError::Adapter(err) => err,
        other => AdapterError::TransportIo(format!("gateway link: {}", other)),
    }
}
